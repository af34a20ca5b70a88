use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::coordination::{lock_key, LockBackend, LockLease};

/// Cluster-wide leadership held as a connection-scoped lock.
///
/// There is no heartbeat: the lease is exactly as alive as its connection,
/// and the check runs on every job trigger. Backend errors always mean
/// "not leader" so an unreachable store stops all execution.
pub struct LeaderElector {
    backend: Arc<dyn LockBackend>,
    key: i64,
    node_id: String,
    lease: Mutex<Option<Box<dyn LockLease>>>,
    closed: AtomicBool,
}

impl LeaderElector {
    pub fn new(backend: Arc<dyn LockBackend>, lock_name: &str, node_id: impl Into<String>) -> Self {
        Self {
            backend,
            key: lock_key(lock_name),
            node_id: node_id.into(),
            lease: Mutex::new(None),
            closed: AtomicBool::new(false),
        }
    }

    pub fn key(&self) -> i64 {
        self.key
    }

    /// Returns true if this process may execute jobs right now.
    ///
    /// A cached lease that still answers its probe wins immediately; otherwise
    /// one non-blocking acquire is attempted on a fresh connection.
    pub async fn acquire_leadership(&self) -> bool {
        let mut slot = self.lease.lock().await;
        if self.closed.load(Ordering::SeqCst) {
            return false;
        }

        if let Some(lease) = slot.as_mut() {
            if lease.is_alive().await {
                return true;
            }
            warn!(node_id = %self.node_id, "scheduler leader connection lost; re-electing");
            if let Some(stale) = slot.take() {
                stale.release().await;
            }
        }

        match self.backend.try_lock(self.key).await {
            Ok(Some(lease)) => {
                info!(node_id = %self.node_id, "became scheduler leader");
                *slot = Some(lease);
                true
            }
            // Another process leads; expected, not an error.
            Ok(None) => false,
            Err(e) => {
                error!(node_id = %self.node_id, error = %e, "failed to acquire scheduler leader lock");
                false
            }
        }
    }

    /// Close the leadership connection so another process can take over.
    /// Safe to call repeatedly.
    pub async fn release_leadership(&self) {
        if let Some(lease) = self.lease.lock().await.take() {
            lease.release().await;
            info!(node_id = %self.node_id, "released scheduler leadership");
        }
    }

    /// Release and refuse to lead again until [`LeaderElector::reopen`].
    ///
    /// The flag is checked under the lease lock, so a trigger racing shutdown
    /// either finishes its acquire before the release or sees the flag.
    pub async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.release_leadership().await;
    }

    pub fn reopen(&self) {
        self.closed.store(false, Ordering::SeqCst);
    }

    /// Whether a lease is cached, without probing it.
    pub async fn holds_lease(&self) -> bool {
        self.lease.lock().await.is_some()
    }
}
