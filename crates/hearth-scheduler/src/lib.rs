//! `hearth-scheduler`: rule scheduler and cross-process coordination for the
//! hearth household backend.
//!
//! # Overview
//!
//! Schedule rules live in SQLite. Every process runs a [`SchedulerService`]
//! that turns enabled rules (plus a fixed set of built-in jobs) into local
//! timers. Several processes may run at once; a shared coordination store
//! makes sure each trigger executes at most once cluster-wide and that rule
//! edits made anywhere reach every process.
//!
//! # Execution gate
//!
//! | Check          | Mechanism                                  | Failure  |
//! |----------------|--------------------------------------------|----------|
//! | Leadership     | connection-scoped lock on the leader key   | skip     |
//! | Job lock       | connection-scoped lock on `job:<id>`       | skip     |
//! | Body           | [`registry::JobBody::run`]                 | log      |
//!
//! Backend errors count as "not held", so an unreachable store stops
//! execution rather than risking duplicates.

pub mod builtin;
pub mod channel;
pub mod collaborators;
pub mod coordination;
pub mod db;
pub mod engine;
pub mod error;
pub mod job_lock;
pub mod leader;
pub mod registry;
pub mod schedule;
pub mod service;
pub mod store;
pub mod types;
pub mod wrapper;

pub use channel::{ChangeChannel, Reloader};
pub use coordination::{ChangeBus, LockBackend, MemoryCoordinator, PgCoordinator};
pub use engine::SchedulerCore;
pub use error::{JobError, Result, SchedulerError};
pub use registry::{job_fn, JobBody, JobRegistry};
pub use schedule::{DayMask, Trigger};
pub use service::{ReloadSummary, SchedulerService, ServiceOptions};
pub use store::RuleStore;
pub use types::{JobDetails, RuleDraft, RunStatus, ScheduleRule, UserRuleAssignment};
