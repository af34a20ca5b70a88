use std::sync::{Arc, Mutex, PoisonError};

use chrono::{Local, NaiveDateTime};
use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{
    schedule::Trigger,
    types::JobDetails,
    wrapper::{log_job_event, WrappedJob},
};

struct ActiveJob {
    name: String,
    trigger: Trigger,
    next_fire: Arc<Mutex<Option<NaiveDateTime>>>,
    cancel: CancellationToken,
}

/// In-process timer engine: one tokio task per registered job.
///
/// Removing a job cancels its timer but never interrupts a run that is
/// already executing; that run finishes and the task exits afterwards.
#[derive(Default)]
pub struct SchedulerCore {
    jobs: DashMap<String, ActiveJob>,
}

impl SchedulerCore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `job` under its job id, replacing any timer with that id.
    /// Must be called from within a tokio runtime.
    pub fn add_job(&self, name: impl Into<String>, trigger: Trigger, job: WrappedJob) {
        let id = job.job_id().to_string();
        let cancel = CancellationToken::new();
        let next_fire = Arc::new(Mutex::new(None));
        tokio::spawn(drive(
            trigger.clone(),
            job,
            Arc::clone(&next_fire),
            cancel.clone(),
        ));

        let entry = ActiveJob {
            name: name.into(),
            trigger,
            next_fire,
            cancel,
        };
        if let Some(previous) = self.jobs.insert(id.clone(), entry) {
            previous.cancel.cancel();
            debug!(job_id = %id, "replaced existing timer");
        }
    }

    /// Cancel the timer for `id`. Returns false if no such job was registered.
    pub fn remove_job(&self, id: &str) -> bool {
        match self.jobs.remove(id) {
            Some((_, job)) => {
                job.cancel.cancel();
                true
            }
            None => false,
        }
    }

    pub fn remove_all_jobs(&self) {
        let ids: Vec<String> = self.jobs.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            self.remove_job(&id);
        }
    }

    pub fn contains(&self, id: &str) -> bool {
        self.jobs.contains_key(id)
    }

    /// Ids of every registered timer, sorted.
    pub fn job_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.jobs.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    /// Snapshot for admin listings, soonest first.
    pub fn jobs(&self) -> Vec<JobDetails> {
        let mut details: Vec<JobDetails> = self
            .jobs
            .iter()
            .map(|entry| {
                let job = entry.value();
                JobDetails {
                    id: entry.key().clone(),
                    name: job.name.clone(),
                    trigger: job.trigger.to_string(),
                    next_run_time: *job.next_fire.lock().unwrap_or_else(PoisonError::into_inner),
                }
            })
            .collect();
        details.sort_by(|a, b| {
            (a.next_run_time.is_none(), a.next_run_time, &a.id)
                .cmp(&(b.next_run_time.is_none(), b.next_run_time, &b.id))
        });
        details
    }
}

async fn drive(
    trigger: Trigger,
    job: WrappedJob,
    next_fire: Arc<Mutex<Option<NaiveDateTime>>>,
    cancel: CancellationToken,
) {
    let set_next = |value: Option<NaiveDateTime>| {
        *next_fire.lock().unwrap_or_else(PoisonError::into_inner) = value;
    };

    loop {
        let now = Local::now().naive_local();
        let Some(next) = trigger.next_fire(now) else {
            warn!(job_id = %job.job_id(), %trigger, "trigger has no next fire time; timer stopped");
            break;
        };
        set_next(Some(next));

        let wait = (next - now).to_std().unwrap_or_default();
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(wait) => {}
        }

        let outcome = job.run().await;
        log_job_event(job.job_id(), &outcome);

        if cancel.is_cancelled() {
            break;
        }
    }
    set_next(None);
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use super::*;
    use crate::coordination::{LockBackend, MemoryCoordinator};
    use crate::job_lock::JobLocks;
    use crate::leader::LeaderElector;
    use crate::registry::job_fn;
    use crate::wrapper::JobGuard;

    fn guard() -> JobGuard {
        let backend: Arc<dyn LockBackend> = Arc::new(MemoryCoordinator::new());
        JobGuard::new(
            Arc::new(LeaderElector::new(Arc::clone(&backend), "leader", "test")),
            Arc::new(JobLocks::new(backend)),
        )
    }

    fn counter_job(guard: &JobGuard, id: &str, calls: &Arc<AtomicUsize>) -> WrappedJob {
        let calls = Arc::clone(calls);
        guard.wrap(
            id,
            job_fn(move || {
                let calls = Arc::clone(&calls);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            }),
        )
    }

    #[tokio::test]
    async fn interval_job_fires_until_removed() {
        let core = SchedulerCore::new();
        let guard = guard();
        let calls = Arc::new(AtomicUsize::new(0));
        core.add_job(
            "ticker",
            Trigger::every(Duration::from_millis(30)),
            counter_job(&guard, "ticker", &calls),
        );

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(calls.load(Ordering::SeqCst) >= 2);

        assert!(core.remove_job("ticker"));
        assert!(!core.remove_job("ticker"));
        tokio::time::sleep(Duration::from_millis(50)).await;
        let settled = calls.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert_eq!(calls.load(Ordering::SeqCst), settled);
    }

    #[tokio::test]
    async fn same_id_replaces_timer() {
        let core = SchedulerCore::new();
        let guard = guard();
        let calls = Arc::new(AtomicUsize::new(0));
        core.add_job("a", Trigger::daily(2, 10).unwrap(), counter_job(&guard, "rule_1", &calls));
        core.add_job("b", Trigger::daily(3, 0).unwrap(), counter_job(&guard, "rule_1", &calls));

        let jobs = core.jobs();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].name, "b");
        assert_eq!(jobs[0].trigger, "cron[day_of_week='*', hour='3', minute='0']");
    }

    #[tokio::test]
    async fn listing_reports_next_fire() {
        let core = SchedulerCore::new();
        let guard = guard();
        let calls = Arc::new(AtomicUsize::new(0));
        core.add_job("nightly", Trigger::daily(2, 10).unwrap(), counter_job(&guard, "rule_1", &calls));
        core.add_job(
            "poll",
            Trigger::every(Duration::from_secs(60)),
            counter_job(&guard, "poll", &calls),
        );
        // Give the timer tasks a chance to publish their first fire time.
        tokio::time::sleep(Duration::from_millis(20)).await;

        let jobs = core.jobs();
        assert_eq!(core.job_ids(), vec!["poll", "rule_1"]);
        assert!(jobs.iter().all(|j| j.next_run_time.is_some()));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn cleared_core_accepts_new_jobs() {
        let core = SchedulerCore::new();
        let guard = guard();
        let calls = Arc::new(AtomicUsize::new(0));
        core.add_job("nightly", Trigger::daily(2, 10).unwrap(), counter_job(&guard, "rule_1", &calls));

        core.remove_all_jobs();
        assert!(core.job_ids().is_empty());

        core.add_job("nightly", Trigger::daily(2, 10).unwrap(), counter_job(&guard, "rule_2", &calls));
        assert_eq!(core.job_ids(), vec!["rule_2"]);
    }
}
