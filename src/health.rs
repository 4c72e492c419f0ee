// src/health.rs
//! System health report. Read-only: no alerts, no status writes.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::config::HealthThresholds;
use crate::monitor::{DataFreshnessStatus, FreshnessLevel};
use crate::orchestrator::SyncOrchestrator;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
    Critical,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FreshnessCounts {
    pub fresh: usize,
    pub aging: usize,
    pub stale: usize,
    pub critical: usize,
    pub unknown: usize,
}

impl FreshnessCounts {
    fn add(&mut self, level: FreshnessLevel) {
        match level {
            FreshnessLevel::Fresh => self.fresh += 1,
            FreshnessLevel::Aging => self.aging += 1,
            FreshnessLevel::Stale => self.stale += 1,
            FreshnessLevel::Critical => self.critical += 1,
            FreshnessLevel::Unknown => self.unknown += 1,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceHealth {
    pub freshness: DataFreshnessStatus,
    pub consecutive_failures: u32,
    /// Failure streak reached the configured threshold.
    pub repeated_failures: bool,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemHealthReport {
    pub status: HealthStatus,
    pub checked_at: DateTime<Utc>,
    pub sources: Vec<SourceHealth>,
    pub counts: FreshnessCounts,
    /// `None` until at least one job has been attempted.
    pub success_rate: Option<f64>,
    pub error_rate: Option<f64>,
    pub min_success_rate: f64,
    pub max_error_rate: f64,
    pub recommendations: Vec<String>,
}

pub struct HealthMonitor {
    orchestrator: Arc<SyncOrchestrator>,
    thresholds: HealthThresholds,
}

impl HealthMonitor {
    pub fn new(orchestrator: Arc<SyncOrchestrator>, thresholds: HealthThresholds) -> Self {
        Self {
            orchestrator,
            thresholds,
        }
    }

    pub async fn perform_health_check(&self) -> Result<SystemHealthReport> {
        let monitor = self.orchestrator.monitor();
        let freshness = monitor.assess_all_freshness().await;

        let mut sources = Vec::with_capacity(freshness.len());
        for f in freshness {
            let src = monitor.source(&f.source_id)?;
            let row = match monitor.store().get(&src.id, &src.data_origin).await {
                Ok(row) => row,
                Err(e) => {
                    tracing::warn!(target: "health", source = %src.id, "status row unavailable: {e:#}");
                    None
                }
            };
            let (streak, last_error) = row
                .map(|r| (r.consecutive_failures, r.last_error))
                .unwrap_or((0, None));
            sources.push(SourceHealth {
                freshness: f,
                consecutive_failures: streak,
                repeated_failures: streak >= self.thresholds.max_consecutive_failures,
                last_error,
            });
        }

        let counters = self.orchestrator.lifetime_counters();
        let report = build_report(
            sources,
            counters.success_rate(),
            counters.error_rate(),
            &self.thresholds,
            monitor.clock().now(),
        );
        tracing::debug!(target: "health", status = ?report.status, "health check");
        Ok(report)
    }
}

fn build_report(
    sources: Vec<SourceHealth>,
    success_rate: Option<f64>,
    error_rate: Option<f64>,
    t: &HealthThresholds,
    now: DateTime<Utc>,
) -> SystemHealthReport {
    let mut counts = FreshnessCounts::default();
    let mut recs = Vec::new();
    let mut status = HealthStatus::Healthy;
    let mut raise = |s: HealthStatus| status = status.max(s);

    for s in &sources {
        let f = &s.freshness;
        counts.add(f.level);
        match f.level {
            FreshnessLevel::Critical => {
                raise(HealthStatus::Critical);
                recs.push(format!(
                    "trigger manual sync for source {}: data is {:.0}h old (critical)",
                    f.source_id,
                    f.age_hours.unwrap_or_default()
                ));
            }
            FreshnessLevel::Stale => {
                raise(HealthStatus::Unhealthy);
                recs.push(format!(
                    "trigger manual sync for source {}: data is {:.0}h old (stale)",
                    f.source_id,
                    f.age_hours.unwrap_or_default()
                ));
            }
            FreshnessLevel::Unknown => {
                raise(HealthStatus::Unhealthy);
                recs.push(format!(
                    "trigger manual sync for source {}: it has never synced",
                    f.source_id
                ));
            }
            FreshnessLevel::Aging => raise(HealthStatus::Degraded),
            FreshnessLevel::Fresh => {}
        }
        if s.repeated_failures {
            raise(HealthStatus::Unhealthy);
            let last = s.last_error.as_deref().unwrap_or("unknown error");
            recs.push(format!(
                "investigate repeated failures on source {} ({} in a row, last error: {last})",
                f.source_id, s.consecutive_failures
            ));
        }
    }

    if let Some(rate) = success_rate {
        if rate < t.min_success_rate / 2.0 {
            raise(HealthStatus::Critical);
        } else if rate < t.min_success_rate {
            raise(HealthStatus::Unhealthy);
        }
        if rate < t.min_success_rate {
            recs.push(format!(
                "sync success rate {rate:.1}% is below {:.1}%; check importer logs",
                t.min_success_rate
            ));
        }
    }
    if let Some(rate) = error_rate {
        if rate > t.max_error_rate {
            raise(HealthStatus::Degraded);
            recs.push(format!(
                "sync error rate {rate:.1}% exceeds {:.1}%",
                t.max_error_rate
            ));
        }
    }

    SystemHealthReport {
        status,
        checked_at: now,
        sources,
        counts,
        success_rate,
        error_rate,
        min_success_rate: t.min_success_rate,
        max_error_rate: t.max_error_rate,
        recommendations: recs,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FreshnessThresholds;

    fn source(id: &str, age_h: Option<i64>, streak: u32) -> SourceHealth {
        let now = Utc::now();
        let last = age_h.map(|h| now - chrono::Duration::hours(h));
        SourceHealth {
            freshness: DataFreshnessStatus::evaluate(id, last, FreshnessThresholds::hours(24, 168, 336), now),
            consecutive_failures: streak,
            repeated_failures: streak >= 3,
            last_error: (streak > 0).then(|| "HTTP 503".to_string()),
        }
    }

    fn report(sources: Vec<SourceHealth>, success: Option<f64>, errors: Option<f64>) -> SystemHealthReport {
        build_report(sources, success, errors, &HealthThresholds::default(), Utc::now())
    }

    #[test]
    fn all_fresh_is_healthy() {
        let r = report(vec![source("MI", Some(1), 0), source("NC", Some(2), 0)], Some(100.0), Some(0.0));
        assert_eq!(r.status, HealthStatus::Healthy);
        assert_eq!(r.counts.fresh, 2);
        assert!(r.recommendations.is_empty());
    }

    #[test]
    fn aging_degrades() {
        let r = report(vec![source("MI", Some(30), 0)], None, None);
        assert_eq!(r.status, HealthStatus::Degraded);
        assert_eq!(r.counts.aging, 1);
    }

    #[test]
    fn stale_and_never_synced_are_unhealthy_with_sync_advice() {
        let r = report(vec![source("MI", Some(200), 0), source("FL", None, 0)], None, None);
        assert_eq!(r.status, HealthStatus::Unhealthy);
        assert_eq!(r.counts.stale, 1);
        assert_eq!(r.counts.unknown, 1);
        assert!(r.recommendations.iter().any(|s| s.contains("manual sync for source MI")));
        assert!(r.recommendations.iter().any(|s| s.contains("FL") && s.contains("never synced")));
    }

    #[test]
    fn critical_age_is_critical() {
        let r = report(vec![source("MI", Some(400), 0)], Some(100.0), None);
        assert_eq!(r.status, HealthStatus::Critical);
    }

    #[test]
    fn failure_streak_recommends_investigation() {
        let r = report(vec![source("OR", Some(1), 3)], None, None);
        assert_eq!(r.status, HealthStatus::Unhealthy);
        assert!(r.recommendations[0].contains("investigate repeated failures on source OR"));
        assert!(r.recommendations[0].contains("HTTP 503"));
    }

    #[test]
    fn rates_against_thresholds() {
        let fresh = || vec![source("MI", Some(1), 0)];
        assert_eq!(report(fresh(), Some(70.0), Some(10.0)).status, HealthStatus::Unhealthy);
        assert_eq!(report(fresh(), Some(30.0), Some(10.0)).status, HealthStatus::Critical);
        assert_eq!(report(fresh(), Some(85.0), Some(25.0)).status, HealthStatus::Degraded);
    }
}
