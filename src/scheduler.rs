// src/scheduler.rs
//! Recurring trigger for [`SyncOrchestrator::sync_all`].
//!
//! At most one run executes at a time. A firing (cron or manual) that lands
//! while a run is in flight is dropped and counted, never queued.

use anyhow::Result;
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use cron::Schedule;
use metrics::{counter, gauge};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::buffer::BoundedBuffer;
use crate::config::SchedulerConfig;
use crate::model::{JobSummary, SyncError, SyncJob};
use crate::monitor::FreshnessLevel;
use crate::orchestrator::SyncOrchestrator;
use crate::store::modify_status;

pub const HISTORY_CAPACITY: usize = 100;

/// Parse a cron expression. Classic 5-field expressions get a leading seconds field.
pub fn parse_cron(expr: &str) -> Result<Schedule> {
    let trimmed = expr.trim();
    let full = if trimmed.split_whitespace().count() == 5 {
        format!("0 {trimmed}")
    } else {
        trimmed.to_string()
    };
    Schedule::from_str(&full)
        .map_err(|e| SyncError::InvalidConfig(format!("cron expression `{expr}`: {e}")).into())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunTrigger {
    Scheduled,
    Manual,
    Startup,
}

impl RunTrigger {
    fn as_str(self) -> &'static str {
        match self {
            RunTrigger::Scheduled => "scheduled",
            RunTrigger::Manual => "manual",
            RunTrigger::Startup => "startup",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobHistoryEntry {
    pub id: Uuid,
    pub trigger: RunTrigger,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub jobs: Vec<SyncJob>,
    pub summary: JobSummary,
    /// Set when the run itself could not start (not for per-source failures).
    pub error: Option<String>,
}

impl JobHistoryEntry {
    /// A run succeeds when no job in it failed.
    pub fn succeeded(&self) -> bool {
        self.error.is_none() && self.summary.failed == 0
    }

    /// Nothing completed and at least one job failed (or the run never started).
    fn fully_failed(&self) -> bool {
        self.error.is_some() || (self.summary.completed == 0 && self.summary.failed > 0)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SchedulerStatistics {
    pub total_runs: u64,
    pub successful_runs: u64,
    pub failed_runs: u64,
    pub dropped_firings: u64,
    pub success_rate: f64,
    pub average_duration_ms: u64,
    pub total_entries_added: u64,
    pub total_entries_updated: u64,
    pub last_run_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerStatus {
    /// The recurring timer is armed.
    pub started: bool,
    /// A run is executing right now.
    pub executing: bool,
    pub cron: String,
    pub timezone: String,
    pub next_run_at: Option<DateTime<Utc>>,
    pub last_run_at: Option<DateTime<Utc>>,
    pub consecutive_failed_runs: u32,
}

#[derive(Default)]
struct Totals {
    runs: u64,
    successful: u64,
    failed: u64,
    dropped: u64,
    duration_ms: u64,
    added: u64,
    updated: u64,
}

struct SchedulerState {
    history: BoundedBuffer<JobHistoryEntry>,
    totals: Totals,
    consecutive_failed_runs: u32,
    next_run_at: Option<DateTime<Utc>>,
    last_run_at: Option<DateTime<Utc>>,
}

/// Clears the in-flight flag when a run ends, including on panic.
struct RunGuard<'a>(&'a AtomicBool);

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct SyncScheduler {
    orchestrator: Arc<SyncOrchestrator>,
    config: SchedulerConfig,
    schedule: Schedule,
    tz: Tz,
    executing: AtomicBool,
    state: Mutex<SchedulerState>,
    timer: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl SyncScheduler {
    pub fn new(orchestrator: Arc<SyncOrchestrator>, config: SchedulerConfig) -> Result<Self> {
        let schedule = parse_cron(&config.cron)?;
        let tz = Tz::from_str(&config.timezone).map_err(|e| {
            SyncError::InvalidConfig(format!("timezone `{}`: {e}", config.timezone))
        })?;
        Ok(Self {
            orchestrator,
            config,
            schedule,
            tz,
            executing: AtomicBool::new(false),
            state: Mutex::new(SchedulerState {
                history: BoundedBuffer::with_capacity(HISTORY_CAPACITY),
                totals: Totals::default(),
                consecutive_failed_runs: 0,
                next_run_at: None,
                last_run_at: None,
            }),
            timer: Mutex::new(None),
        })
    }

    fn now(&self) -> DateTime<Utc> {
        self.orchestrator.monitor().clock().now()
    }

    /// Next firing strictly after `after`, in UTC.
    pub fn next_fire_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedule
            .after(&after.with_timezone(&self.tz))
            .next()
            .map(|t| t.with_timezone(&Utc))
    }

    /// Arm the recurring timer. Calling it while already started is a no-op.
    pub fn start(self: &Arc<Self>) {
        let mut timer = self.timer.lock().expect("scheduler timer poisoned");
        if timer.is_some() {
            tracing::debug!(target: "scheduler", "start called while already started");
            return;
        }
        let cancel = CancellationToken::new();
        let this = Arc::clone(self);
        let token = cancel.clone();
        let handle = tokio::spawn(async move { this.timer_loop(token).await });
        *timer = Some((cancel, handle));
        tracing::info!(
            target: "scheduler",
            cron = %self.config.cron,
            timezone = %self.config.timezone,
            run_on_init = self.config.run_on_init,
            "scheduler started"
        );
    }

    /// Disarm the timer. A run already executing finishes on its own.
    pub fn stop(&self) {
        let taken = self.timer.lock().expect("scheduler timer poisoned").take();
        if let Some((cancel, _handle)) = taken {
            cancel.cancel();
            self.state.lock().expect("scheduler state poisoned").next_run_at = None;
            tracing::info!(target: "scheduler", "scheduler stopped");
        }
    }

    pub fn is_started(&self) -> bool {
        self.timer.lock().expect("scheduler timer poisoned").is_some()
    }

    async fn timer_loop(self: Arc<Self>, cancel: CancellationToken) {
        if self.config.run_on_init {
            self.fire(RunTrigger::Startup);
        }
        let mut after = self.now();
        loop {
            let Some(next) = self.next_fire_after(after) else {
                tracing::warn!(target: "scheduler", cron = %self.config.cron, "schedule has no upcoming firings");
                return;
            };
            self.publish_next_run(next).await;
            let wait = (next - self.now()).to_std().unwrap_or_default();
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(wait) => {}
            }
            self.fire(RunTrigger::Scheduled);
            // never fire the same slot twice, even if the clock reads early
            after = self.now().max(next);
        }
    }

    /// Runs detached so the timer keeps ticking and can observe (and drop) overlaps.
    fn fire(self: &Arc<Self>, trigger: RunTrigger) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            if this.execute(trigger).await.is_ok() {
                this.maybe_self_stop();
            }
        });
    }

    async fn publish_next_run(&self, next: DateTime<Utc>) {
        self.state.lock().expect("scheduler state poisoned").next_run_at = Some(next);
        let monitor = self.orchestrator.monitor();
        for src in monitor.enabled_sources() {
            let res = modify_status(monitor.store().as_ref(), &src.id, &src.data_origin, |row| {
                row.next_scheduled_at = Some(next);
            })
            .await;
            if let Err(e) = res {
                tracing::warn!(target: "scheduler", source = %src.id, "could not record next run: {e:#}");
            }
        }
    }

    fn maybe_self_stop(&self) {
        let limit = self.config.stop_after_failed_runs;
        if limit == 0 {
            return;
        }
        let streak = self
            .state
            .lock()
            .expect("scheduler state poisoned")
            .consecutive_failed_runs;
        if streak >= limit {
            self.orchestrator.monitor().alerts().emit(
                crate::alerts::Severity::Critical,
                None,
                format!("scheduler stopped after {streak} consecutive failed runs"),
            );
            self.stop();
        }
    }

    /// Run immediately, outside the schedule. Fails with [`SyncError::AlreadyRunning`]
    /// when a run is in flight.
    pub async fn trigger_manual(&self) -> Result<JobHistoryEntry> {
        self.execute(RunTrigger::Manual).await
    }

    async fn execute(&self, trigger: RunTrigger) -> Result<JobHistoryEntry> {
        if self
            .executing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            counter!("scheduler_dropped_firings_total").increment(1);
            self.state.lock().expect("scheduler state poisoned").totals.dropped += 1;
            tracing::warn!(target: "scheduler", trigger = trigger.as_str(), "run already in progress, firing dropped");
            return Err(SyncError::AlreadyRunning.into());
        }
        let _guard = RunGuard(&self.executing);

        counter!("scheduler_runs_total", "trigger" => trigger.as_str()).increment(1);
        let started_at = self.now();
        let t0 = Instant::now();
        tracing::info!(target: "scheduler", trigger = trigger.as_str(), "scheduled sync run starting");

        let (jobs, error) = match self.orchestrator.sync_all(&[]).await {
            Ok(jobs) => (jobs, None),
            Err(e) => {
                tracing::error!(target: "scheduler", "sync run failed to start: {e:#}");
                (Vec::new(), Some(format!("{e:#}")))
            }
        };
        let entry = JobHistoryEntry {
            id: Uuid::new_v4(),
            trigger,
            started_at,
            finished_at: self.now(),
            duration_ms: t0.elapsed().as_millis() as u64,
            summary: JobSummary::from_jobs(&jobs),
            jobs,
            error,
        };

        // monitoring only; never changes job outcomes
        for s in self.orchestrator.monitor().check_all_freshness().await {
            let age = s
                .age_hours
                .map(|h| format!("{h:.1}h"))
                .unwrap_or_else(|| "never".into());
            match s.level {
                FreshnessLevel::Fresh | FreshnessLevel::Aging => {
                    tracing::info!(target: "scheduler", source = %s.source_id, level = %s.level, age = %age, "freshness")
                }
                _ => tracing::warn!(target: "scheduler", source = %s.source_id, level = %s.level, age = %age, "freshness"),
            }
        }

        {
            let mut st = self.state.lock().expect("scheduler state poisoned");
            let t = &mut st.totals;
            t.runs += 1;
            if entry.succeeded() {
                t.successful += 1;
            } else {
                t.failed += 1;
            }
            t.duration_ms += entry.duration_ms;
            t.added += entry.summary.total_entries_added;
            t.updated += entry.summary.total_entries_updated;
            if entry.fully_failed() {
                st.consecutive_failed_runs += 1;
            } else {
                st.consecutive_failed_runs = 0;
            }
            st.last_run_at = Some(entry.finished_at);
            st.history.push(entry.clone());
        }
        gauge!("scheduler_last_run_ts").set(entry.finished_at.timestamp() as f64);

        tracing::info!(
            target: "scheduler",
            trigger = trigger.as_str(),
            completed = entry.summary.completed,
            failed = entry.summary.failed,
            skipped = entry.summary.skipped,
            duration_ms = entry.duration_ms,
            "scheduled sync run finished"
        );
        Ok(entry)
    }

    pub fn get_status(&self) -> SchedulerStatus {
        let st = self.state.lock().expect("scheduler state poisoned");
        SchedulerStatus {
            started: self.is_started(),
            executing: self.executing.load(Ordering::Acquire),
            cron: self.config.cron.clone(),
            timezone: self.config.timezone.clone(),
            next_run_at: st.next_run_at,
            last_run_at: st.last_run_at,
            consecutive_failed_runs: st.consecutive_failed_runs,
        }
    }

    /// Retained runs, oldest first.
    pub fn get_history(&self) -> Vec<JobHistoryEntry> {
        self.state
            .lock()
            .expect("scheduler state poisoned")
            .history
            .to_vec()
    }

    pub fn get_statistics(&self) -> SchedulerStatistics {
        let st = self.state.lock().expect("scheduler state poisoned");
        let t = &st.totals;
        SchedulerStatistics {
            total_runs: t.runs,
            successful_runs: t.successful,
            failed_runs: t.failed,
            dropped_firings: t.dropped,
            success_rate: if t.runs == 0 {
                100.0
            } else {
                t.successful as f64 * 100.0 / t.runs as f64
            },
            average_duration_ms: if t.runs == 0 { 0 } else { t.duration_ms / t.runs },
            total_entries_added: t.added,
            total_entries_updated: t.updated,
            last_run_at: st.last_run_at,
        }
    }
}
