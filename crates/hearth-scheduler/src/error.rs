use thiserror::Error;

/// Errors that can occur within the scheduler subsystem.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Underlying SQLite / rusqlite error.
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// The lock / notification backend could not be reached.
    #[error("Coordination store unavailable: {0}")]
    Coordination(String),

    /// A rule's start time or day-of-week mask could not be parsed.
    #[error("Invalid schedule: {0}")]
    InvalidSchedule(String),

    /// No rule with the given ID exists in the store.
    #[error("Rule not found: {id}")]
    RuleNotFound { id: i64 },

    /// The rule name has no entry in the job-body registry.
    #[error("Unknown rule: {name}")]
    UnknownRule { name: String },

    /// A job run on demand failed.
    #[error("Job failed: {0}")]
    Job(#[from] JobError),
}

pub type Result<T> = std::result::Result<T, SchedulerError>;

impl From<sqlx::Error> for SchedulerError {
    fn from(e: sqlx::Error) -> Self {
        SchedulerError::Coordination(e.to_string())
    }
}

impl From<SchedulerError> for hearth_core::HearthError {
    fn from(e: SchedulerError) -> Self {
        use hearth_core::HearthError;
        match e {
            SchedulerError::Database(e) => HearthError::Database(e.to_string()),
            SchedulerError::Coordination(msg) => HearthError::Coordination(msg),
            other => HearthError::Internal(other.to_string()),
        }
    }
}

/// Failure raised by a job body. The scheduler only logs it; the next
/// trigger of the same job is unaffected.
#[derive(Debug, Error)]
pub enum JobError {
    #[error("database: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("I/O: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP: {0}")]
    Http(#[from] reqwest::Error),

    #[error("command `{program}` exited with {status}: {stderr}")]
    Command {
        program: String,
        status: String,
        stderr: String,
    },

    #[error("timed out after {secs}s")]
    Timeout { secs: u64 },

    #[error("{0}")]
    Failed(String),
}

impl JobError {
    pub fn msg(message: impl Into<String>) -> Self {
        JobError::Failed(message.into())
    }
}
