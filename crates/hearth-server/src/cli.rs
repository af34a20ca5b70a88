use chrono::NaiveTime;
use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "hearth-server")]
#[command(about = "Household rule scheduler", long_about = None)]
pub struct Cli {
    /// Config file (defaults to ~/.hearth/hearth.toml)
    #[arg(long, env = "HEARTH_CONFIG")]
    pub config: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the scheduler until interrupted
    Serve,
    /// Manage schedule rules
    #[command(subcommand)]
    Rules(RuleCommand),
    /// Run a user's assigned rule immediately
    RunNow {
        user_id: String,
    },
    /// Show the jobs the current rules would schedule
    Jobs,
}

#[derive(Subcommand, Debug)]
pub enum RuleCommand {
    /// List every rule
    List,
    /// Rule names this process can execute
    Names,
    /// Create a rule
    Add(RuleArgs),
    /// Change a rule's timing
    Update {
        id: i64,
        #[command(flatten)]
        timing: TimingArgs,
    },
    Delete {
        id: i64,
    },
    Enable {
        id: i64,
    },
    Disable {
        id: i64,
    },
    /// Set the rule a user's "run now" triggers
    Assign {
        user_id: String,
        rule_name: String,
    },
    /// List user assignments
    Assignments,
}

#[derive(clap::Args, Debug)]
pub struct RuleArgs {
    /// Registered rule name, e.g. "Rule disable all"
    pub rule_name: String,
    #[command(flatten)]
    pub timing: TimingArgs,
}

#[derive(clap::Args, Debug)]
pub struct TimingArgs {
    /// Local start time, HH:MM
    #[arg(value_parser = parse_time)]
    pub start: NaiveTime,
    /// Advisory end time, HH:MM
    #[arg(long, value_parser = parse_time)]
    pub end: Option<NaiveTime>,
    /// Days to run on; empty means every day
    #[arg(long, value_delimiter = ',')]
    pub days: Vec<String>,
}

fn parse_time(s: &str) -> Result<NaiveTime, String> {
    NaiveTime::parse_from_str(s, "%H:%M").map_err(|e| format!("expected HH:MM: {e}"))
}
