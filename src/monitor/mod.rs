// src/monitor/mod.rs
//! # Source Monitor
//! Cheap change detection (metadata fingerprint vs. last ingested fingerprint)
//! and freshness classification per source. Emits alerts; never ingests.
//!
//! A check records its fingerprint as the source's `current_hash` candidate.
//! Only a successful ingest (see `orchestrator`) moves a fingerprint into
//! `previous_hash`, and it moves the one taken before that ingest started, so
//! a newer candidate written mid-ingest still reads as an update afterwards.

pub mod freshness;
pub mod http;

use anyhow::Result;
use chrono::{DateTime, Utc};
use metrics::{counter, gauge};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::alerts::{AlertHub, Severity};
use crate::clock::Clock;
use crate::config::SourceConfig;
use crate::model::SyncError;
use crate::store::{modify_status, SyncStatusRepository};

pub use freshness::{classify, DataFreshnessStatus, FreshnessLevel};
pub use http::{HttpMetadataChecker, Metadata, MetadataChecker};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateCheck {
    pub source_id: String,
    pub has_update: bool,
    pub current_hash: Option<String>,
    pub previous_hash: Option<String>,
    pub last_modified: Option<String>,
    pub checked_at: DateTime<Utc>,
    pub error: Option<String>,
}

pub struct SourceMonitor {
    sources: Arc<Vec<SourceConfig>>,
    store: Arc<dyn SyncStatusRepository>,
    checker: Arc<dyn MetadataChecker>,
    alerts: Arc<AlertHub>,
    clock: Arc<dyn Clock>,
}

impl SourceMonitor {
    pub fn new(
        sources: Arc<Vec<SourceConfig>>,
        store: Arc<dyn SyncStatusRepository>,
        checker: Arc<dyn MetadataChecker>,
        alerts: Arc<AlertHub>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        crate::metrics::ensure_metrics_described();
        Self {
            sources,
            store,
            checker,
            alerts,
            clock,
        }
    }

    pub fn sources(&self) -> &[SourceConfig] {
        &self.sources
    }

    pub fn enabled_sources(&self) -> impl Iterator<Item = &SourceConfig> {
        self.sources.iter().filter(|s| s.enabled)
    }

    pub fn source(&self, id: &str) -> Result<&SourceConfig> {
        self.sources
            .iter()
            .find(|s| s.id == id)
            .ok_or_else(|| SyncError::UnknownSource(id.to_string()).into())
    }

    pub fn store(&self) -> &Arc<dyn SyncStatusRepository> {
        &self.store
    }

    pub fn alerts(&self) -> &Arc<AlertHub> {
        &self.alerts
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Fingerprint the upstream and compare it to the last ingested fingerprint.
    /// Network/store failures come back inside the result (and raise an `error` alert);
    /// only an unknown source id is an `Err`.
    pub async fn check_for_update(&self, source_id: &str) -> Result<UpdateCheck> {
        let src = self.source(source_id)?;
        let now = self.clock.now();

        let mut check = UpdateCheck {
            source_id: src.id.clone(),
            has_update: false,
            current_hash: None,
            previous_hash: None,
            last_modified: None,
            checked_at: now,
            error: None,
        };

        let meta = match self.checker.check(&src.check_url, src.check_method).await {
            Ok(m) => m,
            Err(e) => {
                let msg = format!("update check failed for {}: {e:#}", src.display_name());
                counter!("monitor_checks_total", "outcome" => "error").increment(1);
                self.alerts.emit(Severity::Error, Some(&src.id), msg.clone());
                check.error = Some(msg);
                return Ok(check);
            }
        };

        let stored = modify_status(self.store.as_ref(), &src.id, &src.data_origin, |row| {
            row.current_hash = Some(meta.hash.clone());
            row.last_checked_at = Some(now);
        })
        .await;

        let row = match stored {
            Ok(row) => row,
            Err(e) => {
                let msg = format!("status store unavailable for {}: {e:#}", src.id);
                counter!("monitor_checks_total", "outcome" => "error").increment(1);
                self.alerts.emit(Severity::Error, Some(&src.id), msg.clone());
                check.current_hash = Some(meta.hash);
                check.error = Some(msg);
                return Ok(check);
            }
        };

        check.has_update = row.previous_hash.as_deref() != Some(meta.hash.as_str());
        check.previous_hash = row.previous_hash;
        check.current_hash = Some(meta.hash);
        check.last_modified = meta.last_modified;

        let outcome = if check.has_update { "changed" } else { "unchanged" };
        counter!("monitor_checks_total", "outcome" => outcome).increment(1);
        tracing::debug!(target: "monitor", source = %src.id, has_update = check.has_update, "update check");
        Ok(check)
    }

    /// Classify freshness and alert on stale (warning) / critical or never-synced (critical).
    pub async fn check_freshness(&self, source_id: &str) -> Result<DataFreshnessStatus> {
        let status = self.assess_freshness(source_id).await?;
        let src = self.source(source_id)?;
        match status.level {
            FreshnessLevel::Critical => {
                self.alerts.emit(
                    Severity::Critical,
                    Some(&src.id),
                    format!(
                        "{} data is critically out of date ({:.1}h since last sync)",
                        src.display_name(),
                        status.age_hours.unwrap_or_default()
                    ),
                );
            }
            FreshnessLevel::Unknown => {
                let why = status.error.as_deref().unwrap_or("never synced");
                self.alerts.emit(
                    Severity::Critical,
                    Some(&src.id),
                    format!("{} freshness unknown: {why}", src.display_name()),
                );
            }
            FreshnessLevel::Stale => {
                self.alerts.emit(
                    Severity::Warning,
                    Some(&src.id),
                    format!(
                        "{} data is stale ({:.1}h since last sync)",
                        src.display_name(),
                        status.age_hours.unwrap_or_default()
                    ),
                );
            }
            FreshnessLevel::Fresh | FreshnessLevel::Aging => {}
        }
        Ok(status)
    }

    /// Same classification as [`check_freshness`](Self::check_freshness) with no alerts.
    pub async fn assess_freshness(&self, source_id: &str) -> Result<DataFreshnessStatus> {
        let src = self.source(source_id)?;
        let now = self.clock.now();
        let status = match self.store.get(&src.id, &src.data_origin).await {
            Ok(row) => {
                let last = row.and_then(|r| r.last_sync_at);
                DataFreshnessStatus::evaluate(&src.id, last, src.thresholds, now)
            }
            Err(e) => {
                let mut s = DataFreshnessStatus::evaluate(&src.id, None, src.thresholds, now);
                s.error = Some(format!("status store unavailable: {e:#}"));
                s
            }
        };
        if let Some(age) = status.age_hours {
            gauge!("monitor_source_age_hours", "source" => src.id.clone()).set(age);
        }
        Ok(status)
    }

    pub async fn check_all_updates(&self) -> Vec<UpdateCheck> {
        let mut out = Vec::new();
        for src in self.enabled_sources() {
            match self.check_for_update(&src.id).await {
                Ok(c) => out.push(c),
                Err(e) => tracing::warn!(target: "monitor", source = %src.id, "update check skipped: {e:#}"),
            }
        }
        out
    }

    pub async fn check_all_freshness(&self) -> Vec<DataFreshnessStatus> {
        let mut out = Vec::new();
        for src in self.enabled_sources() {
            match self.check_freshness(&src.id).await {
                Ok(s) => out.push(s),
                Err(e) => tracing::warn!(target: "monitor", source = %src.id, "freshness check skipped: {e:#}"),
            }
        }
        out
    }

    /// Alert-free variant used by the health report.
    pub async fn assess_all_freshness(&self) -> Vec<DataFreshnessStatus> {
        let mut out = Vec::new();
        for src in self.enabled_sources() {
            if let Ok(s) = self.assess_freshness(&src.id).await {
                out.push(s);
            }
        }
        out
    }

    /// Sources whose `check_interval` has elapsed since their last metadata check.
    async fn due_for_check(&self, now: DateTime<Utc>) -> Vec<String> {
        let mut due = Vec::new();
        for src in self.enabled_sources() {
            let last = match self.store.get(&src.id, &src.data_origin).await {
                Ok(row) => row.and_then(|r| r.last_checked_at),
                Err(_) => None,
            };
            let interval = chrono::Duration::from_std(src.check_interval)
                .unwrap_or_else(|_| chrono::Duration::hours(6));
            if last.map_or(true, |at| now - at >= interval) {
                due.push(src.id.clone());
            }
        }
        due
    }

    async fn candidate_hash(&self, source_id: &str) -> Option<String> {
        let src = self.source(source_id).ok()?;
        self.store
            .get(&src.id, &src.data_origin)
            .await
            .ok()
            .flatten()
            .and_then(|r| r.current_hash)
    }

    /// Background loop: check each source once its `check_interval` elapses and
    /// raise an `info` alert when a new upstream fingerprint shows up. A pending
    /// change is announced once, not on every interval. Runs until `cancel` fires.
    pub async fn run_update_watcher(self: Arc<Self>, tick: std::time::Duration, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(tick);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!(target: "monitor", "update watcher stopped");
                    return;
                }
                _ = ticker.tick() => {}
            }
            let now = self.clock.now();
            for id in self.due_for_check(now).await {
                let seen = self.candidate_hash(&id).await;
                if let Ok(check) = self.check_for_update(&id).await {
                    if check.has_update && check.current_hash != seen {
                        self.alerts.emit(
                            Severity::Info,
                            Some(&id),
                            format!("upstream change detected for {id}"),
                        );
                    }
                }
            }
        }
    }
}
