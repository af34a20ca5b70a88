//! Jobs that are registered on every reload regardless of the rule table.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use hearth_core::config::BuiltinsConfig;
use rusqlite::Connection;

use crate::{
    collaborators::{AlertPusher, LogAnalyzer, LogCollector},
    registry::JobBody,
    error::Result,
    schedule::Trigger,
};

pub mod archive;
pub mod logs;
pub mod overdue;

pub use archive::{ArchiveCompletedTasks, ArchiveReport};
pub use logs::{AnalyzeLogs, UpstreamLogPull};
pub use overdue::NotifyOverdueFeedback;

pub const ARCHIVE_COMPLETED_TASKS: &str = "archive_completed_tasks";
pub const ANALYZE_LOGS: &str = "analyze_logs";
pub const NOTIFY_OVERDUE_FEEDBACK: &str = "notify_overdue_task_feedback";
pub const UPSTREAM_LOG_PULL: &str = "upstream_log_pull";

/// A fixed job: its id doubles as its display name and job-lock key.
#[derive(Clone)]
pub struct BuiltinJob {
    pub id: &'static str,
    pub trigger: Trigger,
    pub body: Arc<dyn JobBody>,
}

impl BuiltinJob {
    pub fn new(id: &'static str, trigger: Trigger, body: Arc<dyn JobBody>) -> Self {
        Self { id, trigger, body }
    }
}

/// External systems the built-ins hand work to.
#[derive(Clone)]
pub struct Collaborators {
    pub analyzer: Arc<dyn LogAnalyzer>,
    pub collector: Arc<dyn LogCollector>,
    pub alerts: Arc<dyn AlertPusher>,
}

/// The standard set: nightly goal archive (02:10), nightly log analysis
/// (00:20), overdue feedback alerts and the upstream log pull.
pub fn standard_builtins(
    conn: Arc<Mutex<Connection>>,
    collaborators: Collaborators,
    config: &BuiltinsConfig,
) -> Result<Vec<BuiltinJob>> {
    let retention = Duration::from_secs(config.archive_after_hours.saturating_mul(3600));
    // Out-of-range retention means "effectively never".
    let retention = chrono::Duration::from_std(retention).unwrap_or_else(|_| chrono::Duration::weeks(52 * 100));
    Ok(vec![
        BuiltinJob::new(
            ARCHIVE_COMPLETED_TASKS,
            Trigger::daily(2, 10)?,
            Arc::new(ArchiveCompletedTasks::new(Arc::clone(&conn), retention)),
        ),
        BuiltinJob::new(
            ANALYZE_LOGS,
            Trigger::daily(0, 20)?,
            Arc::new(AnalyzeLogs::new(collaborators.analyzer)),
        ),
        BuiltinJob::new(
            NOTIFY_OVERDUE_FEEDBACK,
            Trigger::every(Duration::from_secs(config.overdue_every_secs)),
            Arc::new(NotifyOverdueFeedback::new(conn, collaborators.alerts)),
        ),
        BuiltinJob::new(
            UPSTREAM_LOG_PULL,
            Trigger::every(Duration::from_secs(config.upstream_pull_every_secs)),
            Arc::new(UpstreamLogPull::new(collaborators.collector)),
        ),
    ])
}
