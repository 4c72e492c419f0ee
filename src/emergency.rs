// src/emergency.rs
//! Out-of-band forced syncs (formula shortage, policy change, operator override...).
//!
//! Sources in a request run one after another, in request order, and each one
//! still goes through the orchestrator's shared pool and per-source lock.

use anyhow::Result;
use chrono::{DateTime, Utc};
use metrics::counter;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use uuid::Uuid;

use crate::alerts::Severity;
use crate::buffer::BoundedBuffer;
use crate::model::{JobStatus, JobSummary, SyncJob};
use crate::orchestrator::{SyncMode, SyncOrchestrator};

pub const EMERGENCY_HISTORY_CAPACITY: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmergencyReason {
    FormulaShortage,
    PolicyChange,
    ManualOverride,
    DataCorruption,
    PushNotification,
    UserReport,
    ScheduledCheck,
}

impl EmergencyReason {
    pub fn as_str(self) -> &'static str {
        match self {
            EmergencyReason::FormulaShortage => "formula_shortage",
            EmergencyReason::PolicyChange => "policy_change",
            EmergencyReason::ManualOverride => "manual_override",
            EmergencyReason::DataCorruption => "data_corruption",
            EmergencyReason::PushNotification => "push_notification",
            EmergencyReason::UserReport => "user_report",
            EmergencyReason::ScheduledCheck => "scheduled_check",
        }
    }
}

impl fmt::Display for EmergencyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmergencyPriority {
    Low,
    Medium,
    High,
    Critical,
}

impl EmergencyPriority {
    pub fn as_str(self) -> &'static str {
        match self {
            EmergencyPriority::Low => "low",
            EmergencyPriority::Medium => "medium",
            EmergencyPriority::High => "high",
            EmergencyPriority::Critical => "critical",
        }
    }
}

impl fmt::Display for EmergencyPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmergencySyncRequest {
    pub id: Uuid,
    /// Resolved targets, in execution order.
    pub sources: Vec<String>,
    pub reason: EmergencyReason,
    pub priority: EmergencyPriority,
    pub requested_by: String,
    pub notes: Option<String>,
    pub requested_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmergencySyncResult {
    pub request: EmergencySyncRequest,
    /// One job per requested source, same order as `request.sources`.
    pub jobs: Vec<SyncJob>,
    pub summary: JobSummary,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: u64,
    /// Every requested source completed.
    pub success: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EmergencyStatistics {
    pub total_requests: usize,
    pub active_requests: usize,
    pub successful_requests: usize,
    pub failed_requests: usize,
    pub by_reason: BTreeMap<String, usize>,
    pub by_priority: BTreeMap<String, usize>,
    pub average_duration_ms: u64,
    pub total_entries_added: u64,
    pub total_entries_updated: u64,
}

impl EmergencyStatistics {
    fn from_results<'a>(results: impl Iterator<Item = &'a EmergencySyncResult>, active: usize) -> Self {
        let mut s = EmergencyStatistics {
            active_requests: active,
            ..Default::default()
        };
        let mut duration = 0u64;
        for r in results {
            s.total_requests += 1;
            if r.success {
                s.successful_requests += 1;
            } else {
                s.failed_requests += 1;
            }
            *s.by_reason.entry(r.request.reason.to_string()).or_default() += 1;
            *s.by_priority.entry(r.request.priority.to_string()).or_default() += 1;
            duration += r.duration_ms;
            s.total_entries_added += r.summary.total_entries_added;
            s.total_entries_updated += r.summary.total_entries_updated;
        }
        if s.total_requests > 0 {
            s.average_duration_ms = duration / s.total_requests as u64;
        }
        s
    }
}

/// Removes the request from the active set however the trigger ends.
struct ActiveGuard<'a> {
    active: &'a Mutex<HashMap<Uuid, EmergencySyncRequest>>,
    id: Uuid,
}

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        if let Ok(mut a) = self.active.lock() {
            a.remove(&self.id);
        }
    }
}

pub struct EmergencyTrigger {
    orchestrator: Arc<SyncOrchestrator>,
    active: Mutex<HashMap<Uuid, EmergencySyncRequest>>,
    history: Mutex<BoundedBuffer<EmergencySyncResult>>,
}

impl EmergencyTrigger {
    pub fn new(orchestrator: Arc<SyncOrchestrator>) -> Self {
        Self {
            orchestrator,
            active: Mutex::new(HashMap::new()),
            history: Mutex::new(BoundedBuffer::with_capacity(EMERGENCY_HISTORY_CAPACITY)),
        }
    }

    /// Force-sync `sources` (all enabled sources, by priority, when empty).
    /// Unknown source ids reject the whole request before anything runs.
    pub async fn trigger(
        &self,
        sources: &[String],
        reason: EmergencyReason,
        priority: EmergencyPriority,
        requested_by: &str,
        notes: Option<String>,
    ) -> Result<EmergencySyncResult> {
        let monitor = self.orchestrator.monitor();
        let targets: Vec<String> = if sources.is_empty() {
            let mut enabled: Vec<_> = monitor.enabled_sources().collect();
            enabled.sort_by_key(|s| s.priority);
            enabled.into_iter().map(|s| s.id.clone()).collect()
        } else {
            for id in sources {
                monitor.source(id)?;
            }
            sources.to_vec()
        };

        let started_at = monitor.clock().now();
        let request = EmergencySyncRequest {
            id: Uuid::new_v4(),
            sources: targets.clone(),
            reason,
            priority,
            requested_by: requested_by.to_string(),
            notes,
            requested_at: started_at,
        };

        self.active
            .lock()
            .expect("active requests poisoned")
            .insert(request.id, request.clone());
        let _active = ActiveGuard {
            active: &self.active,
            id: request.id,
        };

        counter!("emergency_requests_total", "reason" => reason.as_str()).increment(1);
        let severity = if priority >= EmergencyPriority::High {
            Severity::Warning
        } else {
            Severity::Info
        };
        monitor.alerts().emit(
            severity,
            None,
            format!(
                "emergency sync ({reason}, {priority}) requested by {requested_by} for {}",
                targets.join(", ")
            ),
        );
        tracing::warn!(
            target: "emergency",
            request = %request.id,
            reason = reason.as_str(),
            priority = priority.as_str(),
            requested_by,
            sources = targets.len(),
            "emergency sync started"
        );

        let t0 = Instant::now();
        let mut jobs = Vec::with_capacity(targets.len());
        for id in &targets {
            let job = match self.orchestrator.sync_state_with(id, SyncMode::Forced).await {
                Ok(job) => job,
                Err(e) => {
                    let mut j = SyncJob::pending(id.clone());
                    j.start(monitor.clock().now());
                    j.error = Some(format!("{e:#}"));
                    j.finish(JobStatus::Failed, monitor.clock().now());
                    j
                }
            };
            tracing::info!(target: "emergency", request = %request.id, source = %id, status = %job.status, "emergency job done");
            jobs.push(job);
        }

        let summary = JobSummary::from_jobs(&jobs);
        let result = EmergencySyncResult {
            success: summary.completed == jobs.len(),
            summary,
            jobs,
            started_at,
            finished_at: monitor.clock().now(),
            duration_ms: t0.elapsed().as_millis() as u64,
            request,
        };

        tracing::info!(
            target: "emergency",
            request = %result.request.id,
            success = result.success,
            completed = result.summary.completed,
            failed = result.summary.failed,
            duration_ms = result.duration_ms,
            "emergency sync finished"
        );
        self.history
            .lock()
            .expect("emergency history poisoned")
            .push(result.clone());
        Ok(result)
    }

    pub async fn trigger_formula_shortage(
        &self,
        sources: &[String],
        requested_by: &str,
        notes: Option<String>,
    ) -> Result<EmergencySyncResult> {
        self.trigger(
            sources,
            EmergencyReason::FormulaShortage,
            EmergencyPriority::Critical,
            requested_by,
            notes,
        )
        .await
    }

    pub async fn trigger_policy_change(
        &self,
        sources: &[String],
        requested_by: &str,
        notes: Option<String>,
    ) -> Result<EmergencySyncResult> {
        self.trigger(
            sources,
            EmergencyReason::PolicyChange,
            EmergencyPriority::High,
            requested_by,
            notes,
        )
        .await
    }

    pub async fn trigger_manual_override(
        &self,
        sources: &[String],
        requested_by: &str,
        priority: EmergencyPriority,
        notes: Option<String>,
    ) -> Result<EmergencySyncResult> {
        self.trigger(sources, EmergencyReason::ManualOverride, priority, requested_by, notes)
            .await
    }

    pub async fn trigger_push_notification(
        &self,
        sources: &[String],
        notes: Option<String>,
    ) -> Result<EmergencySyncResult> {
        self.trigger(
            sources,
            EmergencyReason::PushNotification,
            EmergencyPriority::High,
            "push-notification",
            notes,
        )
        .await
    }

    pub fn get_active_requests(&self) -> Vec<EmergencySyncRequest> {
        let mut v: Vec<_> = self
            .active
            .lock()
            .expect("active requests poisoned")
            .values()
            .cloned()
            .collect();
        v.sort_by_key(|r| r.requested_at);
        v
    }

    /// Most recent `limit` results, newest first.
    pub fn get_history(&self, limit: usize) -> Vec<EmergencySyncResult> {
        let h = self.history.lock().expect("emergency history poisoned");
        h.iter().rev().take(limit).cloned().collect()
    }

    pub fn get_statistics(&self) -> EmergencyStatistics {
        let active = self.active.lock().expect("active requests poisoned").len();
        let h = self.history.lock().expect("emergency history poisoned");
        EmergencyStatistics::from_results(h.iter(), active)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(reason: EmergencyReason, priority: EmergencyPriority, ok: bool) -> EmergencySyncResult {
        let now = Utc::now();
        EmergencySyncResult {
            request: EmergencySyncRequest {
                id: Uuid::new_v4(),
                sources: vec!["MI".into()],
                reason,
                priority,
                requested_by: "ops".into(),
                notes: None,
                requested_at: now,
            },
            jobs: vec![],
            summary: JobSummary {
                total_entries_added: 5,
                ..Default::default()
            },
            started_at: now,
            finished_at: now,
            duration_ms: 100,
            success: ok,
        }
    }

    #[test]
    fn statistics_break_down_by_reason_and_priority() {
        let rs = [
            result(EmergencyReason::FormulaShortage, EmergencyPriority::Critical, true),
            result(EmergencyReason::FormulaShortage, EmergencyPriority::Critical, false),
            result(EmergencyReason::PolicyChange, EmergencyPriority::High, true),
        ];
        let s = EmergencyStatistics::from_results(rs.iter(), 1);
        assert_eq!(s.total_requests, 3);
        assert_eq!(s.active_requests, 1);
        assert_eq!(s.successful_requests, 2);
        assert_eq!(s.failed_requests, 1);
        assert_eq!(s.by_reason["formula_shortage"], 2);
        assert_eq!(s.by_reason["policy_change"], 1);
        assert_eq!(s.by_priority["critical"], 2);
        assert_eq!(s.total_entries_added, 15);
        assert_eq!(s.average_duration_ms, 100);
    }

    #[test]
    fn reasons_serialize_snake_case() {
        let v = serde_json::to_value(EmergencyReason::PushNotification).unwrap();
        assert_eq!(v, "push_notification");
        let p: EmergencyPriority = serde_json::from_value("medium".into()).unwrap();
        assert_eq!(p, EmergencyPriority::Medium);
        assert!(EmergencyPriority::Critical > EmergencyPriority::High);
    }
}
