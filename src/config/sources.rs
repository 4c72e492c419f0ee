// src/config/sources.rs
use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use super::duration::serde_str;

/// How the monitor fingerprints a source without downloading it through the ingestor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CheckMethod {
    /// `Last-Modified` + `Content-Length` from a HEAD request.
    #[default]
    Head,
    /// Full body hash (fallback for servers without useful headers).
    Get,
    /// `ETag` header, falling back to the HEAD fingerprint when absent.
    /// A HEAD with no validators at all is fingerprinted by its body.
    Etag,
}

impl fmt::Display for CheckMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CheckMethod::Head => write!(f, "head"),
            CheckMethod::Get => write!(f, "get"),
            CheckMethod::Etag => write!(f, "etag"),
        }
    }
}

fn default_freshness() -> Duration {
    Duration::from_secs(24 * 3600)
}
fn default_stale() -> Duration {
    Duration::from_secs(168 * 3600)
}
fn default_critical() -> Duration {
    Duration::from_secs(336 * 3600)
}
fn default_check_interval() -> Duration {
    Duration::from_secs(6 * 3600)
}
fn default_origin() -> String {
    "apl".to_string()
}
fn default_priority() -> u32 {
    LOWEST_PRIORITY
}
fn default_true() -> bool {
    true
}

/// Sources without an explicit priority sort last.
pub const LOWEST_PRIORITY: u32 = u32::MAX;

/// Age thresholds; must satisfy `freshness < stale < critical`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FreshnessThresholds {
    #[serde(with = "serde_str", default = "default_freshness")]
    pub freshness: Duration,
    #[serde(with = "serde_str", default = "default_stale")]
    pub stale: Duration,
    #[serde(with = "serde_str", default = "default_critical")]
    pub critical: Duration,
}

impl Default for FreshnessThresholds {
    fn default() -> Self {
        Self {
            freshness: default_freshness(),
            stale: default_stale(),
            critical: default_critical(),
        }
    }
}

impl FreshnessThresholds {
    pub fn hours(freshness: u64, stale: u64, critical: u64) -> Self {
        Self {
            freshness: Duration::from_secs(freshness * 3600),
            stale: Duration::from_secs(stale * 3600),
            critical: Duration::from_secs(critical * 3600),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.freshness < self.stale && self.stale < self.critical) {
            bail!(
                "thresholds must satisfy freshness < stale < critical (got {:?} / {:?} / {:?})",
                self.freshness,
                self.stale,
                self.critical
            );
        }
        Ok(())
    }
}

/// One external feed, as declared by the operator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceConfig {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    pub check_url: String,
    #[serde(default)]
    pub check_method: CheckMethod,
    #[serde(with = "serde_str", default = "default_check_interval")]
    pub check_interval: Duration,
    #[serde(default, flatten)]
    pub thresholds: FreshnessThresholds,
    /// Lower number syncs first.
    #[serde(default = "default_priority")]
    pub priority: u32,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Second half of the status key; one feed may publish several lists.
    #[serde(default = "default_origin")]
    pub data_origin: String,
}

impl SourceConfig {
    pub fn new(id: impl Into<String>, check_url: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: None,
            check_url: check_url.into(),
            check_method: CheckMethod::default(),
            check_interval: default_check_interval(),
            thresholds: FreshnessThresholds::default(),
            priority: default_priority(),
            enabled: true,
            data_origin: default_origin(),
        }
    }

    pub fn with_priority(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_method(mut self, method: CheckMethod) -> Self {
        self.check_method = method;
        self
    }

    pub fn with_thresholds(mut self, thresholds: FreshnessThresholds) -> Self {
        self.thresholds = thresholds;
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }

    pub fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            bail!("source id must not be empty");
        }
        if self.check_url.trim().is_empty() {
            bail!("source {}: check_url must not be empty", self.id);
        }
        self.thresholds
            .validate()
            .map_err(|e| anyhow::anyhow!("source {}: {e}", self.id))
    }
}
