use thiserror::Error;

#[derive(Debug, Error)]
pub enum HearthError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Coordination store error: {0}")]
    Coordination(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl HearthError {
    /// Short machine-readable code, used as the process exit reason in logs.
    pub fn code(&self) -> &'static str {
        match self {
            HearthError::Config(_) => "CONFIG_ERROR",
            HearthError::Database(_) => "DATABASE_ERROR",
            HearthError::Coordination(_) => "COORDINATION_ERROR",
            HearthError::Io(_) => "IO_ERROR",
            HearthError::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

pub type Result<T> = std::result::Result<T, HearthError>;
