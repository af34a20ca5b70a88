use std::collections::BTreeMap;

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

pub const DEFAULT_CHANGE_CHANNEL: &str = "schedule_rules_changed";
pub const DEFAULT_LEADER_LOCK_NAME: &str = "hearth_scheduler_leader";
pub const DEFAULT_ALERT_URL: &str = "http://localhost:9181/alert";
pub const DEFAULT_LISTEN_WAIT_MS: u64 = 1_000; // bounded wait between stop-flag checks
pub const DEFAULT_LISTENER_BACKOFF_SECS: u64 = 5;
pub const DEFAULT_ARCHIVE_AFTER_HOURS: u64 = 72;
pub const DEFAULT_OVERDUE_EVERY_SECS: u64 = 60;
pub const DEFAULT_UPSTREAM_PULL_EVERY_SECS: u64 = 180;

/// Top-level config (hearth.toml + HEARTH_* env overrides).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HearthConfig {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub coordination: CoordinationConfig,
    #[serde(default)]
    pub alerts: AlertConfig,
    #[serde(default)]
    pub builtins: BuiltinsConfig,
    /// Job bodies keyed by rule name, e.g. `[rules."Rule disable all"]`.
    #[serde(default)]
    pub rules: BTreeMap<String, RuleCommandConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

/// Shared Postgres instance used only for advisory locks and LISTEN/NOTIFY.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinationConfig {
    /// Required unless `single_process` is set.
    pub url: Option<String>,
    /// Run without a coordination store. Only safe when exactly one scheduler
    /// process serves the household database.
    #[serde(default)]
    pub single_process: bool,
    #[serde(default = "default_channel")]
    pub channel: String,
    #[serde(default = "default_leader_lock_name")]
    pub leader_lock_name: String,
    #[serde(default = "default_listen_wait_ms")]
    pub listen_wait_ms: u64,
    #[serde(default = "default_listener_backoff_secs")]
    pub listener_backoff_secs: u64,
    /// Optional periodic reload that backstops lost notifications. 0 disables it.
    #[serde(default)]
    pub safety_reload_secs: u64,
}

impl Default for CoordinationConfig {
    fn default() -> Self {
        Self {
            url: None,
            single_process: false,
            channel: default_channel(),
            leader_lock_name: default_leader_lock_name(),
            listen_wait_ms: DEFAULT_LISTEN_WAIT_MS,
            listener_backoff_secs: DEFAULT_LISTENER_BACKOFF_SECS,
            safety_reload_secs: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertConfig {
    #[serde(default = "default_alert_url")]
    pub url: String,
    #[serde(default = "default_alert_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            url: default_alert_url(),
            timeout_secs: default_alert_timeout_secs(),
        }
    }
}

/// Tuning for the maintenance jobs registered on every reload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuiltinsConfig {
    #[serde(default = "default_archive_after_hours")]
    pub archive_after_hours: u64,
    #[serde(default = "default_overdue_every_secs")]
    pub overdue_every_secs: u64,
    #[serde(default = "default_upstream_pull_every_secs")]
    pub upstream_pull_every_secs: u64,
    /// argv of the log ETL command; `--start`/`--end` are appended per run.
    #[serde(default)]
    pub analyze_logs: Vec<String>,
    /// argv of the upstream DNS log collector.
    #[serde(default)]
    pub pull_logs: Vec<String>,
}

impl Default for BuiltinsConfig {
    fn default() -> Self {
        Self {
            archive_after_hours: DEFAULT_ARCHIVE_AFTER_HOURS,
            overdue_every_secs: DEFAULT_OVERDUE_EVERY_SECS,
            upstream_pull_every_secs: DEFAULT_UPSTREAM_PULL_EVERY_SECS,
            analyze_logs: Vec::new(),
            pull_logs: Vec::new(),
        }
    }
}

/// External command executed when a rule with this name fires.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleCommandConfig {
    pub command: Vec<String>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

fn default_db_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.hearth/hearth.db", home)
}
fn default_channel() -> String {
    DEFAULT_CHANGE_CHANNEL.to_string()
}
fn default_leader_lock_name() -> String {
    DEFAULT_LEADER_LOCK_NAME.to_string()
}
fn default_listen_wait_ms() -> u64 {
    DEFAULT_LISTEN_WAIT_MS
}
fn default_listener_backoff_secs() -> u64 {
    DEFAULT_LISTENER_BACKOFF_SECS
}
fn default_alert_url() -> String {
    DEFAULT_ALERT_URL.to_string()
}
fn default_alert_timeout_secs() -> u64 {
    5
}
fn default_archive_after_hours() -> u64 {
    DEFAULT_ARCHIVE_AFTER_HOURS
}
fn default_overdue_every_secs() -> u64 {
    DEFAULT_OVERDUE_EVERY_SECS
}
fn default_upstream_pull_every_secs() -> u64 {
    DEFAULT_UPSTREAM_PULL_EVERY_SECS
}

impl HearthConfig {
    /// Load config from a TOML file with HEARTH_* env var overrides.
    ///
    /// Checks in order:
    ///   1. Explicit path argument
    ///   2. ~/.hearth/hearth.toml
    ///
    /// Nested keys use a double underscore: `HEARTH_COORDINATION__URL`.
    pub fn load(config_path: Option<&str>) -> crate::error::Result<Self> {
        let path = config_path
            .map(String::from)
            .unwrap_or_else(default_config_path);

        Self::from_figment(
            Figment::new()
                .merge(Toml::file(&path))
                .merge(Env::prefixed("HEARTH_").split("__")),
        )
    }

    /// Parse config from an inline TOML string (no env overrides).
    pub fn from_toml_str(toml: &str) -> crate::error::Result<Self> {
        Self::from_figment(Figment::new().merge(Toml::string(toml)))
    }

    fn from_figment(figment: Figment) -> crate::error::Result<Self> {
        let config: HearthConfig = figment
            .extract()
            .map_err(|e| crate::error::HearthError::Config(e.to_string()))?;
        tracing::debug!(rules = config.rules.len(), "config loaded");
        Ok(config)
    }
}

fn default_config_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.hearth/hearth.toml", home)
}
