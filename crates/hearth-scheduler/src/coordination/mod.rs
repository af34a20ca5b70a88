//! Cross-process coordination primitives.
//!
//! Two contracts, both backed by one shared store:
//!
//! * [`LockBackend`]: try-only, connection-scoped exclusive locks. A lease
//!   lives exactly as long as the connection that took it; losing the
//!   connection releases the lock, so no heartbeat is needed.
//! * [`ChangeBus`]: a single named notification channel with at-least-once,
//!   unordered delivery to live subscribers.
//!
//! [`postgres::PgCoordinator`] implements both on advisory locks and
//! LISTEN/NOTIFY; [`memory::MemoryCoordinator`] is an in-process stand-in.

use async_trait::async_trait;
use sha2::{Digest, Sha256};

use crate::error::Result;

pub mod memory;
pub mod postgres;

pub use memory::MemoryCoordinator;
pub use postgres::PgCoordinator;

/// A held exclusive lock. Dropping it without calling [`LockLease::release`]
/// still frees the lock once the underlying connection goes away.
#[async_trait]
pub trait LockLease: Send + Sync {
    /// Cheap round-trip proving the connection (and therefore the lock) is
    /// still held.
    async fn is_alive(&mut self) -> bool;

    /// Close the connection, releasing the lock. Idempotent by construction.
    async fn release(self: Box<Self>);
}

#[async_trait]
pub trait LockBackend: Send + Sync {
    /// Non-blocking acquire on a fresh connection.
    ///
    /// `Ok(None)` means someone else holds the key; `Err` means the store
    /// itself could not be reached. Callers treat both as "not held".
    async fn try_lock(&self, key: i64) -> Result<Option<Box<dyn LockLease>>>;
}

/// One long-lived subscriber connection.
#[async_trait]
pub trait ChangeSubscription: Send {
    /// Wait for the next payload. `Err` means the connection was lost and the
    /// subscription must be rebuilt.
    async fn recv(&mut self) -> Result<String>;

    /// Drain a payload that has already arrived, without waiting.
    async fn try_recv(&mut self) -> Result<Option<String>>;
}

#[async_trait]
pub trait ChangeBus: Send + Sync {
    async fn publish(&self, payload: &str) -> Result<()>;

    async fn subscribe(&self) -> Result<Box<dyn ChangeSubscription>>;
}

/// Stable 64-bit lock key for a name.
///
/// The first eight bytes of SHA-256 give a key space wide enough that
/// collisions between job ids are not a practical concern; a collision would
/// only cause spurious contention, never double execution.
pub fn lock_key(name: &str) -> i64 {
    let digest = Sha256::digest(name.as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    i64::from_be_bytes(bytes)
}

/// Lock key for a job id, namespaced away from the leadership key.
pub fn job_lock_key(job_id: &str) -> i64 {
    lock_key(&format!("job:{job_id}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_are_stable_and_distinct() {
        assert_eq!(lock_key("hearth_scheduler_leader"), lock_key("hearth_scheduler_leader"));
        assert_ne!(job_lock_key("rule_1"), job_lock_key("rule_2"));
        assert_ne!(job_lock_key("rule_1"), lock_key("rule_1"));
    }
}
