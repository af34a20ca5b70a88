use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::error::JobError;

/// A callable job body. The only contract is "runs, and may fail".
#[async_trait]
pub trait JobBody: Send + Sync {
    async fn run(&self) -> Result<(), JobError>;
}

/// Adapts an async closure into a [`JobBody`].
pub struct FnJob<F>(pub F);

#[async_trait]
impl<F, Fut> JobBody for FnJob<F>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), JobError>> + Send + 'static,
{
    async fn run(&self) -> Result<(), JobError> {
        (self.0)().await
    }
}

pub fn job_fn<F, Fut>(f: F) -> Arc<dyn JobBody>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), JobError>> + Send + 'static,
{
    Arc::new(FnJob(f))
}

/// Static rule name → job body map, populated at startup and consulted on
/// every reload. Names that are not registered are skipped by the caller.
#[derive(Clone, Default)]
pub struct JobRegistry {
    bodies: BTreeMap<String, Arc<dyn JobBody>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the body for `name`.
    pub fn register(&mut self, name: impl Into<String>, body: Arc<dyn JobBody>) {
        let name = name.into();
        debug!(rule_name = %name, "job body registered");
        self.bodies.insert(name, body);
    }

    pub fn with(mut self, name: impl Into<String>, body: Arc<dyn JobBody>) -> Self {
        self.register(name, body);
        self
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn JobBody>> {
        self.bodies.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.bodies.contains_key(name)
    }

    /// Registered names in sorted order, for rule pickers.
    pub fn names(&self) -> Vec<String> {
        self.bodies.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.bodies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bodies.is_empty()
    }
}
