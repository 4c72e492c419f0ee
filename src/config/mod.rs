// src/config/mod.rs
//! Engine configuration: TOML file first, then `SYNC_*` environment overrides.

pub mod duration;
pub mod sources;

use anyhow::{anyhow, bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

pub use sources::{CheckMethod, FreshnessThresholds, SourceConfig, LOWEST_PRIORITY};

use duration::serde_str;

pub const DEFAULT_CONFIG_PATH: &str = "config/sync.toml";
pub const ENV_CONFIG_PATH: &str = "SYNC_CONFIG_PATH";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub monitor: MonitorConfig,
    #[serde(default)]
    pub health: HealthThresholds,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub ingest: IngestCommandConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub sources: Vec<SourceConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    #[serde(default = "default_max_parallel_jobs")]
    pub max_parallel_jobs: usize,
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    /// Deadline for a single ingest attempt.
    #[serde(with = "serde_str", default = "default_job_timeout")]
    pub job_timeout: Duration,
    #[serde(default = "default_true")]
    pub check_for_updates_first: bool,
    #[serde(default)]
    pub skip_if_no_update: bool,
    /// Failure streak at which a source's alert escalates to critical.
    #[serde(default = "default_max_consecutive_failures")]
    pub max_consecutive_failures: u32,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_parallel_jobs: default_max_parallel_jobs(),
            retry_attempts: default_retry_attempts(),
            retry_delay_ms: default_retry_delay_ms(),
            job_timeout: default_job_timeout(),
            check_for_updates_first: true,
            skip_if_no_update: false,
            max_consecutive_failures: default_max_consecutive_failures(),
        }
    }
}

impl OrchestratorConfig {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Five-field (`min hour dom mon dow`) or six/seven-field cron expression.
    #[serde(default = "default_cron")]
    pub cron: String,
    #[serde(default = "default_timezone")]
    pub timezone: String,
    #[serde(default)]
    pub run_on_init: bool,
    /// Self-stop after this many consecutive runs in which every job failed. 0 = never.
    #[serde(default)]
    pub stop_after_failed_runs: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            cron: default_cron(),
            timezone: default_timezone(),
            run_on_init: false,
            stop_after_failed_runs: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    #[serde(with = "serde_str", default = "default_request_timeout")]
    pub request_timeout: Duration,
    /// How often the update watcher wakes up to look for sources whose check interval elapsed.
    #[serde(with = "serde_str", default = "default_watch_tick")]
    pub watch_tick: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            request_timeout: default_request_timeout(),
            watch_tick: default_watch_tick(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthThresholds {
    /// Percent; below this the system is at least unhealthy.
    #[serde(default = "default_min_success_rate")]
    pub min_success_rate: f64,
    /// Percent; above this the system is at least degraded.
    #[serde(default = "default_max_error_rate")]
    pub max_error_rate: f64,
    #[serde(default = "default_max_consecutive_failures")]
    pub max_consecutive_failures: u32,
}

impl Default for HealthThresholds {
    fn default() -> Self {
        Self {
            min_success_rate: default_min_success_rate(),
            max_error_rate: default_max_error_rate(),
            max_consecutive_failures: default_max_consecutive_failures(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_store_path")]
    pub path: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
        }
    }
}

/// External importer invoked once per source; see `ingest::CommandIngestor`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IngestCommandConfig {
    #[serde(default)]
    pub program: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

fn default_max_parallel_jobs() -> usize {
    2
}
fn default_retry_attempts() -> u32 {
    3
}
fn default_retry_delay_ms() -> u64 {
    5_000
}
fn default_job_timeout() -> Duration {
    Duration::from_secs(30 * 60)
}
fn default_true() -> bool {
    true
}
fn default_max_consecutive_failures() -> u32 {
    3
}
fn default_cron() -> String {
    "0 2 * * *".to_string()
}
fn default_timezone() -> String {
    "America/New_York".to_string()
}
fn default_request_timeout() -> Duration {
    Duration::from_secs(30)
}
fn default_watch_tick() -> Duration {
    Duration::from_secs(60)
}
fn default_min_success_rate() -> f64 {
    80.0
}
fn default_max_error_rate() -> f64 {
    20.0
}
fn default_store_path() -> PathBuf {
    PathBuf::from("state/sync_status.json")
}
fn default_bind() -> String {
    "0.0.0.0:8080".to_string()
}

impl EngineConfig {
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let cfg: EngineConfig = toml::from_str(s).context("parsing engine config TOML")?;
        Ok(cfg)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading engine config from {}", path.display()))?;
        Self::from_toml_str(&content)
    }

    /// Load using env var + fallback, apply env overrides and validate:
    /// 1) $SYNC_CONFIG_PATH
    /// 2) config/sync.toml
    pub fn load_default() -> Result<Self> {
        let mut cfg = match std::env::var(ENV_CONFIG_PATH) {
            Ok(p) => {
                let pb = PathBuf::from(p);
                if !pb.exists() {
                    bail!("{ENV_CONFIG_PATH} points to non-existent path {}", pb.display());
                }
                Self::load_from(&pb)?
            }
            Err(_) => {
                let pb = PathBuf::from(DEFAULT_CONFIG_PATH);
                if pb.exists() {
                    Self::load_from(&pb)?
                } else {
                    tracing::warn!(path = DEFAULT_CONFIG_PATH, "no config file, using defaults");
                    Self::default()
                }
            }
        };
        cfg.apply_env_overrides();
        cfg.validate()?;
        Ok(cfg)
    }

    /// `SYNC_*` variables win over the file. Unparseable values are ignored with a warning.
    pub fn apply_env_overrides(&mut self) {
        let o = &mut self.orchestrator;
        if let Some(v) = env_parse::<usize>("SYNC_MAX_PARALLEL_JOBS") {
            o.max_parallel_jobs = v;
        }
        if let Some(v) = env_parse::<u32>("SYNC_RETRY_ATTEMPTS") {
            o.retry_attempts = v;
        }
        if let Some(v) = env_parse::<u64>("SYNC_RETRY_DELAY_MS") {
            o.retry_delay_ms = v;
        }
        if let Some(v) = env_bool("SYNC_CHECK_FOR_UPDATES_FIRST") {
            o.check_for_updates_first = v;
        }
        if let Some(v) = env_bool("SYNC_SKIP_IF_NO_UPDATE") {
            o.skip_if_no_update = v;
        }

        let s = &mut self.scheduler;
        if let Ok(v) = std::env::var("SYNC_CRON") {
            if !v.trim().is_empty() {
                s.cron = v.trim().to_string();
            }
        }
        if let Ok(v) = std::env::var("SYNC_TIMEZONE") {
            if !v.trim().is_empty() {
                s.timezone = v.trim().to_string();
            }
        }
        if let Some(v) = env_bool("SYNC_RUN_ON_INIT") {
            s.run_on_init = v;
        }

        if let Ok(v) = std::env::var("SYNC_BIND") {
            if !v.trim().is_empty() {
                self.server.bind = v.trim().to_string();
            }
        }
        if let Ok(v) = std::env::var("SYNC_STATUS_PATH") {
            if !v.trim().is_empty() {
                self.store.path = PathBuf::from(v.trim());
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.orchestrator.max_parallel_jobs == 0 {
            bail!("orchestrator.max_parallel_jobs must be at least 1");
        }
        let mut seen = HashSet::new();
        for src in &self.sources {
            src.validate()?;
            if !seen.insert(src.id.as_str()) {
                bail!("duplicate source id {:?}", src.id);
            }
        }
        crate::scheduler::parse_cron(&self.scheduler.cron)?;
        chrono_tz::Tz::from_str(&self.scheduler.timezone)
            .map_err(|e| anyhow!("invalid scheduler.timezone {:?}: {e}", self.scheduler.timezone))?;
        Ok(())
    }

    pub fn enabled_sources(&self) -> impl Iterator<Item = &SourceConfig> {
        self.sources.iter().filter(|s| s.enabled)
    }
}

fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    let raw = std::env::var(key).ok()?;
    match raw.trim().parse::<T>() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!(key, value = %raw, "ignoring unparseable env override");
            None
        }
    }
}

fn env_bool(key: &str) -> Option<bool> {
    let raw = std::env::var(key).ok()?;
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => {
            tracing::warn!(key, value = %raw, "ignoring unparseable env flag");
            None
        }
    }
}
