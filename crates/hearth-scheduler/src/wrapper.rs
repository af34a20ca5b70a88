use std::sync::Arc;

use tracing::{debug, error, info};

use crate::{
    error::JobError, job_lock::JobLocks, leader::LeaderElector, registry::JobBody,
    types::RunStatus,
};

/// Leadership plus per-job exclusion, composed around every job body before
/// it is handed to the timer engine.
#[derive(Clone)]
pub struct JobGuard {
    leader: Arc<LeaderElector>,
    locks: Arc<JobLocks>,
}

impl JobGuard {
    pub fn new(leader: Arc<LeaderElector>, locks: Arc<JobLocks>) -> Self {
        Self { leader, locks }
    }

    pub fn leader(&self) -> &Arc<LeaderElector> {
        &self.leader
    }

    pub fn locks(&self) -> &Arc<JobLocks> {
        &self.locks
    }

    pub fn wrap(&self, job_id: impl Into<String>, body: Arc<dyn JobBody>) -> WrappedJob {
        WrappedJob {
            job_id: job_id.into(),
            body,
            guard: self.clone(),
        }
    }
}

/// A job body gated by [`JobGuard`]. Cloning is cheap.
#[derive(Clone)]
pub struct WrappedJob {
    job_id: String,
    body: Arc<dyn JobBody>,
    guard: JobGuard,
}

impl WrappedJob {
    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    /// Run the body if, and only if, this process leads, has no run of this
    /// job id in flight, *and* holds the job lock. Leadership is checked
    /// first; it is the coarser gate.
    pub async fn run(&self) -> Result<RunStatus, JobError> {
        if !self.guard.leader.acquire_leadership().await {
            return Ok(RunStatus::Skipped);
        }
        let Some(_permit) = self.guard.locks.begin_run(&self.job_id) else {
            debug!(job_id = %self.job_id, "skipping job; previous run still in progress");
            return Ok(RunStatus::Skipped);
        };
        if !self.guard.locks.try_acquire(&self.job_id).await {
            debug!(job_id = %self.job_id, "skipping job; lock held by another process");
            return Ok(RunStatus::Skipped);
        }
        self.body.run().await?;
        Ok(RunStatus::Executed)
    }
}

/// One log line per trigger: error on failure, info on success, nothing when
/// the trigger was skipped.
pub fn log_job_event(job_id: &str, outcome: &Result<RunStatus, JobError>) {
    match outcome {
        Err(e) => error!(job_id, error = %e, "scheduler job failed"),
        Ok(RunStatus::Skipped) => {}
        Ok(RunStatus::Executed) => info!(job_id, "scheduler job executed"),
    }
}
