use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use hearth_core::{HearthConfig, HearthError};
use hearth_scheduler::{
    builtin::{standard_builtins, Collaborators},
    collaborators::{
        AlertPusher, CommandJob, CommandLogAnalyzer, HttpAlertPusher, LogAnalyzer, LogCollector,
        Unconfigured,
    },
    coordination::{ChangeBus, LockBackend},
    db::init_db,
    JobRegistry, MemoryCoordinator, PgCoordinator, RuleStore, SchedulerService, ServiceOptions,
};
use rusqlite::Connection;
use tracing::{info, warn};

/// Open the household database and make sure every table exists.
pub fn open_database(path: &str) -> hearth_core::Result<Arc<Mutex<Connection>>> {
    if let Some(parent) = Path::new(path).parent() {
        std::fs::create_dir_all(parent)?;
    }
    info!(%path, "opening SQLite database");

    let db = Connection::open(path).map_err(|e| HearthError::Database(e.to_string()))?;
    db.execute_batch("PRAGMA journal_mode=WAL; PRAGMA busy_timeout=5000;")
        .map_err(|e| HearthError::Database(e.to_string()))?;
    init_db(&db)?;
    Ok(Arc::new(Mutex::new(db)))
}

/// Both coordination roles, served by one backend.
///
/// Without a url every process would elect itself leader, so the in-process
/// coordinator is only used when `single_process` is set.
pub fn coordinator(
    config: &HearthConfig,
) -> hearth_core::Result<(Arc<dyn LockBackend>, Arc<dyn ChangeBus>)> {
    match config.coordination.url.as_deref() {
        Some(url) => {
            let pg = Arc::new(PgCoordinator::new(url, config.coordination.channel.clone())?);
            info!(channel = %pg.channel(), "coordinating through Postgres");
            let locks: Arc<dyn LockBackend> = pg.clone();
            let bus: Arc<dyn ChangeBus> = pg;
            Ok((locks, bus))
        }
        None if !config.coordination.single_process => Err(HearthError::Config(
            "coordination.url is not set; configure the shared Postgres url, or set \
             coordination.single_process = true if this is the only scheduler process"
                .to_string(),
        )),
        None => {
            warn!("single-process mode; this process only coordinates with itself");
            let memory = Arc::new(MemoryCoordinator::new());
            let locks: Arc<dyn LockBackend> = memory.clone();
            let bus: Arc<dyn ChangeBus> = memory;
            Ok((locks, bus))
        }
    }
}

/// One command-backed body per `[rules."name"]` entry.
pub fn registry(config: &HearthConfig) -> JobRegistry {
    let mut registry = JobRegistry::new();
    for (name, rule) in &config.rules {
        if rule.command.is_empty() {
            warn!(rule_name = %name, "rule has an empty command; not registered");
            continue;
        }
        let job = CommandJob::new(rule.command.clone(), rule.timeout_secs.map(Duration::from_secs));
        registry.register(name.clone(), Arc::new(job));
    }
    registry
}

fn collaborators(config: &HearthConfig) -> hearth_core::Result<Collaborators> {
    let analyzer: Arc<dyn LogAnalyzer> = if config.builtins.analyze_logs.is_empty() {
        Arc::new(Unconfigured("analyze_logs"))
    } else {
        Arc::new(CommandLogAnalyzer::new(config.builtins.analyze_logs.clone()))
    };
    let collector: Arc<dyn LogCollector> = if config.builtins.pull_logs.is_empty() {
        Arc::new(Unconfigured("pull_logs"))
    } else {
        Arc::new(CommandJob::new(config.builtins.pull_logs.clone(), None))
    };
    let alerts: Arc<dyn AlertPusher> = Arc::new(
        HttpAlertPusher::new(
            config.alerts.url.clone(),
            Duration::from_secs(config.alerts.timeout_secs),
        )
        .map_err(|e| HearthError::Internal(e.to_string()))?,
    );
    Ok(Collaborators {
        analyzer,
        collector,
        alerts,
    })
}

/// Assemble the per-process scheduler service from config.
pub fn build_service(config: &HearthConfig) -> hearth_core::Result<Arc<SchedulerService>> {
    let db = open_database(&config.database.path)?;
    let (locks, bus) = coordinator(config)?;
    let builtins = standard_builtins(Arc::clone(&db), collaborators(config)?, &config.builtins)?;

    Ok(Arc::new(SchedulerService::new(
        RuleStore::from_shared(db),
        registry(config),
        builtins,
        locks,
        bus,
        ServiceOptions::from(&config.coordination),
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_skips_empty_commands() {
        let config = HearthConfig::from_toml_str(
            r#"
            [rules."Rule disable all"]
            command = ["true"]

            [rules."Rule broken"]
            command = []
            "#,
        )
        .unwrap();

        assert_eq!(registry(&config).names(), vec!["Rule disable all"]);
    }

    #[test]
    fn refuses_to_run_uncoordinated_by_default() {
        let mut config = HearthConfig::default();
        config.database.path = ":memory:".to_string();

        let err = build_service(&config).err().unwrap();
        assert_eq!(err.code(), "CONFIG_ERROR");
        assert!(err.to_string().contains("single_process"));
    }

    #[tokio::test]
    async fn single_process_mode_uses_in_memory_coordination() {
        let mut config = HearthConfig::default();
        config.database.path = ":memory:".to_string();
        config.coordination.single_process = true;

        let service = build_service(&config).unwrap();
        let summary = service.reload().await.unwrap();
        assert_eq!(summary.active.len(), 4);
        assert!(summary.active.contains("archive_completed_tasks"));
    }
}
