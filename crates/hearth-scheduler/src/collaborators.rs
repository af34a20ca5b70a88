//! Black-box collaborators the job bodies delegate to.
//!
//! The scheduler does not know how network filters are toggled or how the
//! log ETL works; it only needs something that "runs and may fail". The
//! concrete implementations here shell out to configured commands or post to
//! an HTTP endpoint.

use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDateTime;
use serde_json::json;
use tokio::process::Command;
use tracing::debug;

use crate::{error::JobError, registry::JobBody};

/// Log ETL over a half-open `[start, end)` window of local time.
#[async_trait]
pub trait LogAnalyzer: Send + Sync {
    async fn analyze(&self, start: NaiveDateTime, end: NaiveDateTime) -> Result<(), JobError>;
}

/// Pulls fresh query logs from the upstream DNS filter.
#[async_trait]
pub trait LogCollector: Send + Sync {
    async fn pull(&self) -> Result<(), JobError>;
}

/// Pushes a short message to the desktop alert endpoint.
#[async_trait]
pub trait AlertPusher: Send + Sync {
    async fn push(&self, message: &str) -> Result<(), JobError>;
}

/// Run `argv`, failing on a non-zero exit or when `timeout` elapses.
pub async fn run_command(argv: &[String], timeout: Option<Duration>) -> Result<(), JobError> {
    let (program, args) = argv
        .split_first()
        .ok_or_else(|| JobError::msg("empty command"))?;

    let mut cmd = Command::new(program);
    cmd.args(args).kill_on_drop(true);

    let output = match timeout {
        Some(limit) => tokio::time::timeout(limit, cmd.output())
            .await
            .map_err(|_| JobError::Timeout {
                secs: limit.as_secs(),
            })??,
        None => cmd.output().await?,
    };

    if !output.status.success() {
        return Err(JobError::Command {
            program: program.clone(),
            status: output.status.to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    debug!(
        %program,
        stdout = %String::from_utf8_lossy(&output.stdout).trim(),
        "command finished"
    );
    Ok(())
}

/// An external command used as a rule body or as the log collector.
#[derive(Debug, Clone)]
pub struct CommandJob {
    argv: Vec<String>,
    timeout: Option<Duration>,
}

impl CommandJob {
    pub fn new(argv: Vec<String>, timeout: Option<Duration>) -> Self {
        Self { argv, timeout }
    }
}

#[async_trait]
impl JobBody for CommandJob {
    async fn run(&self) -> Result<(), JobError> {
        run_command(&self.argv, self.timeout).await
    }
}

#[async_trait]
impl LogCollector for CommandJob {
    async fn pull(&self) -> Result<(), JobError> {
        run_command(&self.argv, self.timeout).await
    }
}

/// Log analyzer command; receives the window as `--start` / `--end`.
#[derive(Debug, Clone)]
pub struct CommandLogAnalyzer {
    argv: Vec<String>,
}

impl CommandLogAnalyzer {
    pub fn new(argv: Vec<String>) -> Self {
        Self { argv }
    }
}

#[async_trait]
impl LogAnalyzer for CommandLogAnalyzer {
    async fn analyze(&self, start: NaiveDateTime, end: NaiveDateTime) -> Result<(), JobError> {
        let mut argv = self.argv.clone();
        argv.extend([
            "--start".to_string(),
            start.format("%Y-%m-%d %H:%M:%S").to_string(),
            "--end".to_string(),
            end.format("%Y-%m-%d %H:%M:%S").to_string(),
        ]);
        run_command(&argv, None).await
    }
}

/// Stand-in for a collaborator that has no command configured.
#[derive(Debug, Clone, Copy)]
pub struct Unconfigured(pub &'static str);

#[async_trait]
impl LogAnalyzer for Unconfigured {
    async fn analyze(&self, _start: NaiveDateTime, _end: NaiveDateTime) -> Result<(), JobError> {
        debug!(collaborator = self.0, "not configured; nothing to do");
        Ok(())
    }
}

#[async_trait]
impl LogCollector for Unconfigured {
    async fn pull(&self) -> Result<(), JobError> {
        debug!(collaborator = self.0, "not configured; nothing to do");
        Ok(())
    }
}

/// Posts `{"message": ...}` to a local alert listener.
#[derive(Clone)]
pub struct HttpAlertPusher {
    client: reqwest::Client,
    url: String,
}

impl HttpAlertPusher {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, JobError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl AlertPusher for HttpAlertPusher {
    async fn push(&self, message: &str) -> Result<(), JobError> {
        self.client
            .post(&self.url)
            .json(&json!({ "message": message }))
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn argv(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|p| p.to_string()).collect()
    }

    #[tokio::test]
    async fn empty_command_is_an_error() {
        assert!(run_command(&[], None).await.is_err());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn exit_status_decides_outcome() {
        assert!(CommandJob::new(argv(&["true"]), None).run().await.is_ok());

        let err = CommandJob::new(argv(&["sh", "-c", "echo nope >&2; exit 3"]), None)
            .run()
            .await
            .unwrap_err();
        match err {
            JobError::Command { program, stderr, .. } => {
                assert_eq!(program, "sh");
                assert_eq!(stderr, "nope");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn slow_command_times_out() {
        let job = CommandJob::new(argv(&["sleep", "5"]), Some(Duration::from_millis(50)));
        assert!(matches!(job.run().await, Err(JobError::Timeout { .. })));
    }
}
