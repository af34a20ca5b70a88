use std::collections::HashSet;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, error, info};

use crate::coordination::{job_lock_key, LockBackend, LockLease};

/// Per-job exclusion leases, independent of leadership.
///
/// Leadership alone cannot stop two processes from both believing they lead
/// for a moment during a handover; the job lock closes that gap. Leases are
/// cached per job id and reused across triggers.
///
/// A cached lease says nothing about runs inside this process, so each job id
/// also has a run slot. Slots outlive timer replacement.
pub struct JobLocks {
    backend: Arc<dyn LockBackend>,
    leases: DashMap<String, Box<dyn LockLease>>,
    running: DashMap<String, Arc<Mutex<()>>>,
}

/// Held for the duration of one run of a job id in this process.
pub struct RunPermit {
    _slot: OwnedMutexGuard<()>,
}

impl JobLocks {
    pub fn new(backend: Arc<dyn LockBackend>) -> Self {
        Self {
            backend,
            leases: DashMap::new(),
            running: DashMap::new(),
        }
    }

    /// Claim the run slot for `job_id`, or `None` if a run of it is already
    /// in flight in this process.
    pub fn begin_run(&self, job_id: &str) -> Option<RunPermit> {
        let slot = Arc::clone(&*self.running.entry(job_id.to_string()).or_default());
        slot.try_lock_owned().ok().map(|guard| RunPermit { _slot: guard })
    }

    /// Returns true if this process holds (or just took) the lock for `job_id`.
    pub async fn try_acquire(&self, job_id: &str) -> bool {
        // Take the cached lease out for probing; a DashMap guard must not be
        // held across an await. A concurrent trigger of the same job in the
        // meantime finds the key held and skips, which is the desired outcome.
        if let Some((_, mut lease)) = self.leases.remove(job_id) {
            if lease.is_alive().await {
                self.leases.insert(job_id.to_string(), lease);
                return true;
            }
            debug!(job_id, "cached job lock went stale; re-acquiring");
            lease.release().await;
        }

        match self.backend.try_lock(job_lock_key(job_id)).await {
            Ok(Some(lease)) => {
                self.leases.insert(job_id.to_string(), lease);
                true
            }
            Ok(None) => false,
            Err(e) => {
                error!(job_id, error = %e, "failed to acquire job lock");
                false
            }
        }
    }

    /// Close and forget leases for jobs that are no longer scheduled.
    pub async fn release_unused(&self, active: &HashSet<String>) {
        let stale: Vec<String> = self
            .leases
            .iter()
            .map(|entry| entry.key().clone())
            .filter(|id| !active.contains(id))
            .collect();

        for job_id in stale {
            if let Some((_, lease)) = self.leases.remove(&job_id) {
                lease.release().await;
                info!(job_id = %job_id, "released job lock for unscheduled job");
            }
        }
        // A slot still referenced belongs to a run in flight; keep it.
        self.running
            .retain(|id, slot| active.contains(id) || Arc::strong_count(slot) > 1);
    }

    /// Close every lease; used at shutdown.
    pub async fn release_all(&self) {
        self.release_unused(&HashSet::new()).await;
    }

    pub fn held_ids(&self) -> HashSet<String> {
        self.leases.iter().map(|entry| entry.key().clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordination::MemoryCoordinator;

    #[tokio::test]
    async fn lease_is_cached_and_exclusive() {
        let store = MemoryCoordinator::new();
        let ours = JobLocks::new(Arc::new(store.clone()));
        let theirs = JobLocks::new(Arc::new(store.clone()));

        assert!(ours.try_acquire("rule_1").await);
        assert!(ours.try_acquire("rule_1").await);
        assert_eq!(store.held_count(), 1);

        assert!(!theirs.try_acquire("rule_1").await);
        assert!(theirs.try_acquire("rule_2").await);
    }

    #[tokio::test]
    async fn release_unused_keeps_active_ids() {
        let store = MemoryCoordinator::new();
        let locks = JobLocks::new(Arc::new(store.clone()));
        assert!(locks.try_acquire("rule_1").await);
        assert!(locks.try_acquire("rule_2").await);

        let active: HashSet<String> = ["rule_1".to_string()].into();
        locks.release_unused(&active).await;

        assert_eq!(locks.held_ids(), active);
        assert!(store.is_held(job_lock_key("rule_1")));
        assert!(!store.is_held(job_lock_key("rule_2")));
    }

    #[tokio::test]
    async fn stale_lease_is_replaced() {
        let store = MemoryCoordinator::new();
        let locks = JobLocks::new(Arc::new(store.clone()));
        assert!(locks.try_acquire("rule_1").await);

        store.sever(job_lock_key("rule_1"));
        assert!(locks.try_acquire("rule_1").await);
        assert!(store.is_held(job_lock_key("rule_1")));
    }

    #[tokio::test]
    async fn run_slot_is_exclusive_until_dropped() {
        let locks = JobLocks::new(Arc::new(MemoryCoordinator::new()));

        let first = locks.begin_run("rule_1").unwrap();
        assert!(locks.begin_run("rule_1").is_none());
        assert!(locks.begin_run("rule_2").is_some());

        drop(first);
        assert!(locks.begin_run("rule_1").is_some());
    }

    #[tokio::test]
    async fn busy_run_slot_survives_release_unused() {
        let locks = JobLocks::new(Arc::new(MemoryCoordinator::new()));
        let permit = locks.begin_run("rule_1").unwrap();

        locks.release_all().await;
        assert!(locks.begin_run("rule_1").is_none());

        drop(permit);
        locks.release_all().await;
        assert!(locks.begin_run("rule_1").is_some());
    }

    #[tokio::test]
    async fn outage_means_not_held() {
        let store = MemoryCoordinator::new();
        let locks = JobLocks::new(Arc::new(store.clone()));
        store.set_unavailable(true);
        assert!(!locks.try_acquire("rule_1").await);
        assert!(locks.held_ids().is_empty());
    }
}
