use chrono::{NaiveDateTime, NaiveTime};
use serde::{Deserialize, Serialize};

/// A persisted "run job X at time T on days D" row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleRule {
    /// Autoincrement primary key; the scheduled job id is `rule_<id>`.
    pub id: i64,
    /// Key into the job-body registry.
    pub rule_name: String,
    /// Local wall-clock time the rule fires at.
    pub start_time: NaiveTime,
    /// Advisory only; the trigger ignores it.
    pub end_time: Option<NaiveTime>,
    /// `*` for every day, otherwise a comma list such as `mon,wed` or `0,2`.
    pub day_of_week: String,
    pub enabled: bool,
}

impl ScheduleRule {
    /// Job id used for the timer and for the rule's job lock.
    pub fn job_id(&self) -> String {
        rule_job_id(self.id)
    }
}

pub fn rule_job_id(rule_id: i64) -> String {
    format!("rule_{rule_id}")
}

/// Fields supplied when creating or editing a rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleDraft {
    pub rule_name: String,
    pub start_time: NaiveTime,
    pub end_time: Option<NaiveTime>,
    /// Selected weekdays; empty or all seven collapse to `*`.
    #[serde(default)]
    pub days: Vec<String>,
}

/// Which rule a user's "run now" button triggers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRuleAssignment {
    pub user_id: String,
    pub assigned_rule: String,
}

/// What a wrapped job did on one trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    /// The body ran to completion.
    Executed,
    /// Deliberately not executed: not the leader, or the job lock is held elsewhere.
    Skipped,
}

/// Admin-facing view of one live timer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobDetails {
    pub id: String,
    pub name: String,
    pub trigger: String,
    pub next_run_time: Option<NaiveDateTime>,
}

impl JobDetails {
    pub fn next_run_display(&self) -> String {
        self.next_run_time
            .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_else(|| "-".to_string())
    }
}
