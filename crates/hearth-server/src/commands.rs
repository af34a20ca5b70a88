use anyhow::{bail, Context, Result};
use hearth_scheduler::{RuleDraft, SchedulerService};

use crate::cli::{RuleArgs, RuleCommand, TimingArgs};

fn draft(rule_name: String, timing: TimingArgs) -> RuleDraft {
    RuleDraft {
        rule_name,
        start_time: timing.start,
        end_time: timing.end,
        days: timing.days,
    }
}

fn checked_draft(service: &SchedulerService, args: RuleArgs) -> Result<RuleDraft> {
    if !service.registry().contains(&args.rule_name) {
        bail!(
            "unknown rule name '{}'; registered: {}",
            args.rule_name,
            service.registry().names().join(", ")
        );
    }
    Ok(draft(args.rule_name, args.timing))
}

/// Mutations commit, then notify every running scheduler process.
pub async fn handle_rule_command(service: &SchedulerService, command: RuleCommand) -> Result<()> {
    match command {
        RuleCommand::List => {
            for rule in service.store().list_rules()? {
                println!(
                    "{:>4}  {:<5} {:<24} {}{}  days={}",
                    rule.id,
                    if rule.enabled { "on" } else { "off" },
                    rule.rule_name,
                    rule.start_time.format("%H:%M"),
                    rule.end_time
                        .map(|t| format!("-{}", t.format("%H:%M")))
                        .unwrap_or_default(),
                    rule.day_of_week
                );
            }
        }
        RuleCommand::Names => {
            for name in service.registry().names() {
                println!("{name}");
            }
        }
        RuleCommand::Add(args) => {
            let draft = checked_draft(service, args)?;
            let rule = service.add_rule(&draft).await?;
            println!("added rule {} ({})", rule.id, rule.job_id());
        }
        RuleCommand::Update { id, timing } => {
            let existing = service
                .store()
                .get_rule(id)?
                .with_context(|| format!("no rule with id {id}"))?;
            service.update_rule(id, &draft(existing.rule_name, timing)).await?;
            println!("updated rule {id}");
        }
        RuleCommand::Delete { id } => {
            service.delete_rule(id).await?;
            println!("deleted rule {id}");
        }
        RuleCommand::Enable { id } => {
            service.enable_rule(id).await?;
            println!("enabled rule {id}");
        }
        RuleCommand::Disable { id } => {
            service.disable_rule(id).await?;
            println!("disabled rule {id}");
        }
        RuleCommand::Assign { user_id, rule_name } => {
            service.assign_rules(&[(user_id.clone(), rule_name.clone())]).await?;
            println!("{user_id} -> {rule_name}");
        }
        RuleCommand::Assignments => {
            for a in service.store().list_assignments()? {
                println!("{} -> {}", a.user_id, a.assigned_rule);
            }
        }
    }
    Ok(())
}

pub async fn run_now(service: &SchedulerService, user_id: &str) -> Result<()> {
    match service.run_assigned_now(user_id).await? {
        Some(rule_name) => println!("ran '{rule_name}' for {user_id}"),
        None => bail!("no rule assigned to {user_id}"),
    }
    Ok(())
}

/// Register timers from the current rules without starting the listener,
/// then print them.
pub async fn show_jobs(service: &SchedulerService) -> Result<()> {
    let summary = service.reload().await?;
    for job in service.scheduled_jobs() {
        println!(
            "{:<32} {:<20} {:<48} next={}",
            job.id,
            job.name,
            job.trigger,
            job.next_run_display()
        );
    }
    for skipped in summary.skipped {
        println!("{skipped:<32} (skipped: no registered body or bad day mask)");
    }
    Ok(())
}
