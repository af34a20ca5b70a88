//! In-process coordinator: one holder per key, broadcast notifications.
//!
//! Clones share state, so handing one clone to each simulated "process" in a
//! test gives them a common coordination store. Fault injection covers the
//! failure modes the scheduler must survive: a holder's connection dropping,
//! the whole store going away, and subscribers being disconnected.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::{ChangeBus, ChangeSubscription, LockBackend, LockLease};
use crate::error::{Result, SchedulerError};

#[derive(Default)]
struct State {
    /// key -> id of the lease currently holding it
    holders: HashMap<i64, u64>,
    /// leases whose connection was cut out from under them
    severed: HashSet<u64>,
    next_lease: u64,
    unavailable: bool,
    subscribers: Vec<mpsc::UnboundedSender<String>>,
    published: Vec<String>,
}

#[derive(Clone, Default)]
pub struct MemoryCoordinator {
    state: Arc<Mutex<State>>,
}

impl MemoryCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        lock(&self.state)
    }

    /// Simulate the store being unreachable: every operation errors and every
    /// held lease stops answering liveness probes.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.state().unavailable = unavailable;
    }

    /// Simulate the holder of `key` losing its connection. The lock is freed
    /// and the old lease's next probe fails.
    pub fn sever(&self, key: i64) {
        let mut state = self.state();
        if let Some(lease_id) = state.holders.remove(&key) {
            state.severed.insert(lease_id);
        }
    }

    /// Drop every subscriber connection.
    pub fn disconnect_subscribers(&self) {
        self.state().subscribers.clear();
    }

    pub fn is_held(&self, key: i64) -> bool {
        self.state().holders.contains_key(&key)
    }

    pub fn held_count(&self) -> usize {
        self.state().holders.len()
    }

    pub fn subscriber_count(&self) -> usize {
        self.state()
            .subscribers
            .iter()
            .filter(|tx| !tx.is_closed())
            .count()
    }

    /// Every payload ever published, in order.
    pub fn published(&self) -> Vec<String> {
        self.state().published.clone()
    }
}

fn lock(state: &Mutex<State>) -> MutexGuard<'_, State> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

fn unavailable() -> SchedulerError {
    SchedulerError::Coordination("memory coordinator unavailable".to_string())
}

#[async_trait]
impl LockBackend for MemoryCoordinator {
    async fn try_lock(&self, key: i64) -> Result<Option<Box<dyn LockLease>>> {
        let mut state = self.state();
        if state.unavailable {
            return Err(unavailable());
        }
        if state.holders.contains_key(&key) {
            return Ok(None);
        }
        state.next_lease += 1;
        let id = state.next_lease;
        state.holders.insert(key, id);
        Ok(Some(Box::new(MemoryLease {
            key,
            id,
            state: Arc::clone(&self.state),
            released: false,
        })))
    }
}

struct MemoryLease {
    key: i64,
    id: u64,
    state: Arc<Mutex<State>>,
    released: bool,
}

impl MemoryLease {
    fn free(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        let mut state = lock(&self.state);
        if state.holders.get(&self.key) == Some(&self.id) {
            state.holders.remove(&self.key);
        }
        state.severed.remove(&self.id);
    }
}

#[async_trait]
impl LockLease for MemoryLease {
    async fn is_alive(&mut self) -> bool {
        let state = lock(&self.state);
        !self.released
            && !state.unavailable
            && !state.severed.contains(&self.id)
            && state.holders.get(&self.key) == Some(&self.id)
    }

    async fn release(mut self: Box<Self>) {
        self.free();
    }
}

impl Drop for MemoryLease {
    // Dropping the lease is dropping its connection.
    fn drop(&mut self) {
        self.free();
    }
}

#[async_trait]
impl ChangeBus for MemoryCoordinator {
    async fn publish(&self, payload: &str) -> Result<()> {
        let mut state = self.state();
        if state.unavailable {
            return Err(unavailable());
        }
        state.published.push(payload.to_string());
        state
            .subscribers
            .retain(|tx| tx.send(payload.to_string()).is_ok());
        Ok(())
    }

    async fn subscribe(&self) -> Result<Box<dyn ChangeSubscription>> {
        let mut state = self.state();
        if state.unavailable {
            return Err(unavailable());
        }
        let (tx, rx) = mpsc::unbounded_channel();
        state.subscribers.push(tx);
        Ok(Box::new(MemorySubscription { rx }))
    }
}

struct MemorySubscription {
    rx: mpsc::UnboundedReceiver<String>,
}

#[async_trait]
impl ChangeSubscription for MemorySubscription {
    async fn recv(&mut self) -> Result<String> {
        self.rx
            .recv()
            .await
            .ok_or_else(|| SchedulerError::Coordination("subscriber disconnected".to_string()))
    }

    async fn try_recv(&mut self) -> Result<Option<String>> {
        match self.rx.try_recv() {
            Ok(payload) => Ok(Some(payload)),
            Err(mpsc::error::TryRecvError::Empty) => Ok(None),
            Err(mpsc::error::TryRecvError::Disconnected) => Err(SchedulerError::Coordination(
                "subscriber disconnected".to_string(),
            )),
        }
    }
}
