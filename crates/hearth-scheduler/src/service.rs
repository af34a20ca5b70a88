use std::collections::{BTreeSet, HashSet};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use hearth_core::config::CoordinationConfig;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::{
    builtin::BuiltinJob,
    channel::{ChangeChannel, Reloader},
    coordination::{ChangeBus, LockBackend},
    engine::SchedulerCore,
    error::{Result, SchedulerError},
    job_lock::JobLocks,
    leader::LeaderElector,
    registry::JobRegistry,
    schedule::{DayMask, Trigger},
    store::RuleStore,
    types::{rule_job_id, JobDetails, RuleDraft, ScheduleRule},
    wrapper::JobGuard,
};

/// Coordination tunables, normally taken from `[coordination]`.
#[derive(Debug, Clone)]
pub struct ServiceOptions {
    pub leader_lock_name: String,
    pub listen_wait: Duration,
    pub listener_backoff: Duration,
    /// Periodic unconditional reload; `None` disables it.
    pub safety_reload: Option<Duration>,
}

impl Default for ServiceOptions {
    fn default() -> Self {
        Self::from(&CoordinationConfig::default())
    }
}

impl From<&CoordinationConfig> for ServiceOptions {
    fn from(cfg: &CoordinationConfig) -> Self {
        Self {
            leader_lock_name: cfg.leader_lock_name.clone(),
            listen_wait: Duration::from_millis(cfg.listen_wait_ms),
            listener_backoff: Duration::from_secs(cfg.listener_backoff_secs),
            safety_reload: (cfg.safety_reload_secs > 0)
                .then(|| Duration::from_secs(cfg.safety_reload_secs)),
        }
    }
}

/// What one reload registered.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReloadSummary {
    /// Every job id with a live timer after the reload, built-ins included.
    pub active: BTreeSet<String>,
    /// Enabled rules left out: unknown rule name or unreadable day mask.
    pub skipped: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Stopped,
    Running,
}

struct Background {
    stop: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

/// One per process. Owns the timers, the leadership and job-lock leases, and
/// the change listener; every reload in the process goes through here.
pub struct SchedulerService {
    instance_id: String,
    store: RuleStore,
    registry: JobRegistry,
    builtins: Vec<BuiltinJob>,
    core: SchedulerCore,
    guard: JobGuard,
    channel: ChangeChannel,
    options: ServiceOptions,
    reload_lock: tokio::sync::Mutex<()>,
    state: Mutex<State>,
    background: Mutex<Option<Background>>,
}

impl SchedulerService {
    pub fn new(
        store: RuleStore,
        registry: JobRegistry,
        builtins: Vec<BuiltinJob>,
        locks: Arc<dyn LockBackend>,
        bus: Arc<dyn ChangeBus>,
        options: ServiceOptions,
    ) -> Self {
        let instance_id = Uuid::new_v4().simple().to_string();
        let leader = LeaderElector::new(
            Arc::clone(&locks),
            &options.leader_lock_name,
            instance_id.clone(),
        );
        let guard = JobGuard::new(Arc::new(leader), Arc::new(JobLocks::new(locks)));
        Self {
            channel: ChangeChannel::new(bus, instance_id.clone()),
            instance_id,
            store,
            registry,
            builtins,
            core: SchedulerCore::new(),
            guard,
            options,
            reload_lock: tokio::sync::Mutex::new(()),
            state: Mutex::new(State::Stopped),
            background: Mutex::new(None),
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn store(&self) -> &RuleStore {
        &self.store
    }

    pub fn registry(&self) -> &JobRegistry {
        &self.registry
    }

    pub fn guard(&self) -> &JobGuard {
        &self.guard
    }

    pub fn is_running(&self) -> bool {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) == State::Running
    }

    fn set_state(&self, to: State) -> State {
        std::mem::replace(
            &mut *self.state.lock().unwrap_or_else(PoisonError::into_inner),
            to,
        )
    }

    /// Subscribe, load the rules, then start listening. Idempotent.
    ///
    /// Subscribing before the first reload means a change committed during
    /// startup is either in the rows read or in the queued notifications.
    pub async fn start(self: &Arc<Self>) {
        if self.set_state(State::Running) == State::Running {
            return;
        }
        self.guard.leader().reopen();

        let initial = match self.channel.subscribe().await {
            Ok(sub) => Some(sub),
            Err(e) => {
                error!(error = %e, "could not subscribe to schedule changes; listener will retry");
                None
            }
        };

        if let Err(e) = self.reload().await {
            error!(error = %e, "initial schedule load failed");
        }

        let stop = CancellationToken::new();
        let reloader: Arc<dyn Reloader> = self.clone();
        let mut tasks = vec![self
            .channel
            .listener(Arc::clone(&reloader), stop.clone())
            .with_wait(self.options.listen_wait)
            .with_backoff(self.options.listener_backoff)
            .spawn(initial)];

        if let Some(every) = self.options.safety_reload {
            tasks.push(tokio::spawn(safety_reload(reloader, every, stop.clone())));
        }

        *self.background.lock().unwrap_or_else(PoisonError::into_inner) =
            Some(Background { stop, tasks });
        info!(instance_id = %self.instance_id, "scheduler service started");
    }

    /// Stop listening, cancel every timer and close every lease. Idempotent.
    pub async fn stop(&self) {
        if self.set_state(State::Stopped) == State::Stopped {
            return;
        }

        let background = self
            .background
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(background) = background {
            background.stop.cancel();
            for task in background.tasks {
                if let Err(e) = task.await {
                    warn!(error = %e, "background task ended abnormally");
                }
            }
        }

        // Serialise with any reload still in flight.
        let _serial = self.reload_lock.lock().await;
        self.guard.leader().close().await;
        self.core.remove_all_jobs();
        self.guard.locks().release_all().await;
        info!(instance_id = %self.instance_id, "scheduler service stopped");
    }

    /// Rebuild every timer from the rule store.
    ///
    /// The read happens first; if it fails the existing timers are kept.
    /// Concurrent calls in one process run one after another.
    #[instrument(skip(self), fields(instance_id = %self.instance_id))]
    pub async fn reload(&self) -> Result<ReloadSummary> {
        let _serial = self.reload_lock.lock().await;
        let rules = self.store.enabled_rules()?;

        self.core.remove_all_jobs();
        let mut summary = ReloadSummary::default();

        for rule in rules {
            let job_id = rule.job_id();
            let Some(trigger) = self.rule_trigger(&rule) else {
                summary.skipped.push(job_id);
                continue;
            };
            let Some(body) = self.registry.get(&rule.rule_name) else {
                warn!(rule_id = rule.id, rule_name = %rule.rule_name, "unknown rule name; skipping");
                summary.skipped.push(job_id);
                continue;
            };
            self.core
                .add_job(&rule.rule_name, trigger, self.guard.wrap(&job_id, body));
            summary.active.insert(job_id);
        }

        for builtin in &self.builtins {
            self.core.add_job(
                builtin.id,
                builtin.trigger.clone(),
                self.guard.wrap(builtin.id, Arc::clone(&builtin.body)),
            );
            summary.active.insert(builtin.id.to_string());
        }

        let active: HashSet<String> = summary.active.iter().cloned().collect();
        self.guard.locks().release_unused(&active).await;

        self.log_scheduled_jobs();
        Ok(summary)
    }

    fn rule_trigger(&self, rule: &ScheduleRule) -> Option<Trigger> {
        match DayMask::parse(&rule.day_of_week) {
            Ok(days) => Some(Trigger::Daily {
                at: rule.start_time,
                days,
            }),
            Err(e) => {
                warn!(rule_id = rule.id, error = %e, "unreadable day mask; skipping rule");
                None
            }
        }
    }

    fn log_scheduled_jobs(&self) {
        let jobs = self.core.jobs();
        let mut lines = String::new();
        for job in &jobs {
            lines.push_str(&format!(
                "\n  {} ({}) {} next={}",
                job.id,
                job.name,
                job.trigger,
                job.next_run_display()
            ));
        }
        info!(count = jobs.len(), "scheduled jobs:{lines}");
    }

    /// Cancel one rule's timer. Returns false if it was not scheduled.
    pub fn remove_job(&self, rule_id: i64) -> bool {
        let removed = self.core.remove_job(&rule_job_id(rule_id));
        if removed {
            debug!(rule_id, "removed scheduled job");
        }
        removed
    }

    pub fn scheduled_jobs(&self) -> Vec<JobDetails> {
        self.core.jobs()
    }

    /// Announce a committed change to every other process.
    pub async fn notify_change(&self) {
        self.channel.publish().await;
    }

    async fn after_rule_change(&self) {
        if self.is_running() {
            if let Err(e) = self.reload().await {
                error!(error = %e, "reload after rule change failed");
            }
        }
        self.notify_change().await;
    }

    pub async fn add_rule(&self, draft: &RuleDraft) -> Result<ScheduleRule> {
        let rule = self.store.add_rule(draft)?;
        self.after_rule_change().await;
        Ok(rule)
    }

    /// Only the timing fields of `draft` are applied.
    pub async fn update_rule(&self, id: i64, draft: &RuleDraft) -> Result<()> {
        self.store.update_rule(id, draft)?;
        self.after_rule_change().await;
        Ok(())
    }

    /// The timer is cancelled before the row goes, so a delete racing a
    /// trigger never fires a rule that no longer exists.
    pub async fn delete_rule(&self, id: i64) -> Result<()> {
        self.remove_job(id);
        self.store.delete_rule(id)?;
        self.after_rule_change().await;
        Ok(())
    }

    pub async fn enable_rule(&self, id: i64) -> Result<()> {
        self.store.set_enabled(id, true)?;
        self.after_rule_change().await;
        Ok(())
    }

    pub async fn disable_rule(&self, id: i64) -> Result<()> {
        self.store.set_enabled(id, false)?;
        self.after_rule_change().await;
        Ok(())
    }

    /// Record which rule each user's "run now" triggers. Timers are
    /// unaffected, so there is no local reload.
    pub async fn assign_rules(&self, assignments: &[(String, String)]) -> Result<()> {
        for (user_id, rule_name) in assignments {
            if !self.registry.contains(rule_name) {
                return Err(SchedulerError::UnknownRule {
                    name: rule_name.clone(),
                });
            }
            self.store.assign_rule(user_id, rule_name)?;
        }
        self.notify_change().await;
        Ok(())
    }

    /// Run the rule assigned to `user_id` right now, in this process.
    ///
    /// Returns the rule name that ran, or `None` when nothing is assigned.
    pub async fn run_assigned_now(&self, user_id: &str) -> Result<Option<String>> {
        let Some(rule_name) = self.store.assigned_rule(user_id)? else {
            return Ok(None);
        };
        let body = self
            .registry
            .get(&rule_name)
            .ok_or_else(|| SchedulerError::UnknownRule {
                name: rule_name.clone(),
            })?;
        body.run().await?;
        info!(%user_id, %rule_name, "ran assigned rule on demand");
        Ok(Some(rule_name))
    }
}

#[async_trait]
impl Reloader for SchedulerService {
    async fn reload(&self) -> Result<()> {
        SchedulerService::reload(self).await.map(|_| ())
    }
}

async fn safety_reload(reloader: Arc<dyn Reloader>, every: Duration, stop: CancellationToken) {
    loop {
        tokio::select! {
            biased;
            _ = stop.cancelled() => break,
            _ = tokio::time::sleep(every) => {}
        }
        if let Err(e) = reloader.reload().await {
            error!(error = %e, "periodic schedule reload failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use chrono::NaiveTime;
    use rusqlite::Connection;

    use super::*;
    use crate::coordination::MemoryCoordinator;
    use crate::registry::job_fn;

    fn draft(name: &str, hh: u32, mm: u32) -> RuleDraft {
        RuleDraft {
            rule_name: name.to_string(),
            start_time: NaiveTime::from_hms_opt(hh, mm, 0).unwrap(),
            end_time: None,
            days: vec![],
        }
    }

    fn service(store: &RuleStore, coord: &MemoryCoordinator, registry: JobRegistry) -> Arc<SchedulerService> {
        let builtins = vec![BuiltinJob::new(
            "nightly_builtin",
            Trigger::daily(2, 10).unwrap(),
            job_fn(|| async { Ok(()) }),
        )];
        Arc::new(SchedulerService::new(
            store.clone(),
            registry,
            builtins,
            Arc::new(coord.clone()),
            Arc::new(coord.clone()),
            ServiceOptions {
                listen_wait: Duration::from_millis(20),
                listener_backoff: Duration::from_millis(20),
                ..ServiceOptions::default()
            },
        ))
    }

    fn registry() -> JobRegistry {
        JobRegistry::new()
            .with("Rule disable all", job_fn(|| async { Ok(()) }))
            .with("Rule enable all", job_fn(|| async { Ok(()) }))
    }

    #[tokio::test]
    async fn reload_registers_enabled_known_rules_plus_builtins() {
        let store = RuleStore::new(Connection::open_in_memory().unwrap()).unwrap();
        let coord = MemoryCoordinator::new();
        let svc = service(&store, &coord, registry());

        let kept = store.add_rule(&draft("Rule disable all", 21, 0)).unwrap();
        let off = store.add_rule(&draft("Rule disable all", 22, 0)).unwrap();
        store.set_enabled(off.id, false).unwrap();
        let unknown = store.add_rule(&draft("Rule nobody wrote", 7, 0)).unwrap();

        let summary = svc.reload().await.unwrap();
        let expected: BTreeSet<String> = [kept.job_id(), "nightly_builtin".to_string()].into();
        assert_eq!(summary.active, expected);
        assert_eq!(summary.skipped, vec![unknown.job_id()]);

        // Idempotent.
        assert_eq!(svc.reload().await.unwrap(), summary);
        let ids: BTreeSet<String> = svc.scheduled_jobs().into_iter().map(|j| j.id).collect();
        assert_eq!(ids, expected);
    }

    #[tokio::test]
    async fn mutations_publish_and_delete_removes_timer() {
        let store = RuleStore::new(Connection::open_in_memory().unwrap()).unwrap();
        let coord = MemoryCoordinator::new();
        let svc = service(&store, &coord, registry());
        svc.start().await;

        let rule = svc.add_rule(&draft("Rule enable all", 6, 30)).await.unwrap();
        assert!(svc.scheduled_jobs().iter().any(|j| j.id == rule.job_id()));

        svc.disable_rule(rule.id).await.unwrap();
        assert!(!svc.scheduled_jobs().iter().any(|j| j.id == rule.job_id()));

        svc.enable_rule(rule.id).await.unwrap();
        svc.delete_rule(rule.id).await.unwrap();
        assert!(!svc.scheduled_jobs().iter().any(|j| j.id == rule.job_id()));
        assert!(!svc.remove_job(rule.id));

        let published = coord.published();
        assert_eq!(published.len(), 4);
        assert!(published.iter().all(|p| p == svc.instance_id()));

        svc.stop().await;
        assert!(svc.scheduled_jobs().is_empty());
        assert_eq!(coord.held_count(), 0);
    }

    #[tokio::test]
    async fn failed_read_keeps_existing_timers() {
        let conn = Arc::new(std::sync::Mutex::new(Connection::open_in_memory().unwrap()));
        crate::db::init_db(&conn.lock().unwrap()).unwrap();
        let store = RuleStore::from_shared(Arc::clone(&conn));
        let coord = MemoryCoordinator::new();
        let svc = service(&store, &coord, registry());

        store.add_rule(&draft("Rule disable all", 21, 0)).unwrap();
        let before = svc.reload().await.unwrap();

        conn.lock().unwrap().execute_batch("DROP TABLE schedule_rules").unwrap();
        assert!(svc.reload().await.is_err());
        let ids: BTreeSet<String> = svc.scheduled_jobs().into_iter().map(|j| j.id).collect();
        assert_eq!(ids, before.active);
    }

    #[tokio::test]
    async fn run_now_uses_assignment() {
        let store = RuleStore::new(Connection::open_in_memory().unwrap()).unwrap();
        let coord = MemoryCoordinator::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let counted = Arc::clone(&calls);
        let registry = registry().with(
            "Rule enable AI",
            job_fn(move || {
                let counted = Arc::clone(&counted);
                async move {
                    counted.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            }),
        );
        let svc = service(&store, &coord, registry);

        assert_eq!(svc.run_assigned_now("kid").await.unwrap(), None);

        svc.assign_rules(&[("kid".into(), "Rule enable AI".into())])
            .await
            .unwrap();
        assert_eq!(
            svc.run_assigned_now("kid").await.unwrap().as_deref(),
            Some("Rule enable AI")
        );
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let err = svc
            .assign_rules(&[("kid".into(), "Rule nope".into())])
            .await
            .unwrap_err();
        assert!(matches!(err, SchedulerError::UnknownRule { .. }));
    }
}
