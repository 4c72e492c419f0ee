// src/orchestrator.rs
//! # Sync Orchestrator
//! Runs ingest jobs for a set of sources: optional update pre-check, priority
//! queue (lower number first, ties by declaration order), `max_parallel_jobs`
//! workers, per-job retry with attempt history.
//!
//! Every ingest, whether it comes from a scheduled run or an emergency request,
//! takes a permit from one shared semaphore and holds the source's lock, so the
//! same source is never ingested twice at once and total ingest concurrency is
//! bounded process-wide.

use anyhow::Result;
use chrono::{DateTime, Utc};
use metrics::{counter, histogram};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::alerts::Severity;
use crate::config::{OrchestratorConfig, SourceConfig};
use crate::ingest::Ingestor;
use crate::model::{AttemptRecord, JobStatus, JobSummary, LastSyncOutcome, SyncError, SyncJob};
use crate::monitor::{SourceMonitor, UpdateCheck};
use crate::store::modify_status;

/// Whether a job may be short-circuited by `skip_if_no_update`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
    /// Honors `skip_if_no_update`.
    Routine,
    /// Always ingests (emergency and manual overrides).
    Forced,
}

/// Counters over the orchestrator's lifetime (all runs, all entry points).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LifetimeCounters {
    pub completed: u64,
    pub failed: u64,
    pub skipped: u64,
    pub cancelled: u64,
}

impl LifetimeCounters {
    fn record(&mut self, status: JobStatus) {
        match status {
            JobStatus::Completed => self.completed += 1,
            JobStatus::Failed => self.failed += 1,
            JobStatus::Skipped => self.skipped += 1,
            JobStatus::Cancelled => self.cancelled += 1,
            JobStatus::Pending | JobStatus::Running => {}
        }
    }

    /// Percent of attempted (non-skipped) jobs that completed; `None` before any ran.
    pub fn success_rate(&self) -> Option<f64> {
        let attempted = self.completed + self.failed + self.cancelled;
        (attempted > 0).then(|| self.completed as f64 * 100.0 / attempted as f64)
    }

    pub fn error_rate(&self) -> Option<f64> {
        let attempted = self.completed + self.failed + self.cancelled;
        (attempted > 0).then(|| self.failed as f64 * 100.0 / attempted as f64)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorStatus {
    pub running: Vec<SyncJob>,
    pub last_run: Vec<SyncJob>,
    pub last_run_started_at: Option<DateTime<Utc>>,
    pub last_run_finished_at: Option<DateTime<Utc>>,
    pub max_parallel_jobs: usize,
    pub available_permits: usize,
    pub lifetime: LifetimeCounters,
}

#[derive(Default)]
struct RunState {
    running: HashMap<Uuid, SyncJob>,
    last_run: Vec<SyncJob>,
    last_run_started_at: Option<DateTime<Utc>>,
    last_run_finished_at: Option<DateTime<Utc>>,
    lifetime: LifetimeCounters,
}

struct QueuedJob {
    source: SourceConfig,
    precheck: Option<UpdateCheck>,
}

pub struct SyncOrchestrator {
    monitor: Arc<SourceMonitor>,
    ingestor: Arc<dyn Ingestor>,
    settings: OrchestratorConfig,
    pool: Arc<Semaphore>,
    source_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    cancel: Mutex<CancellationToken>,
    state: Mutex<RunState>,
}

impl SyncOrchestrator {
    pub fn new(
        monitor: Arc<SourceMonitor>,
        ingestor: Arc<dyn Ingestor>,
        settings: OrchestratorConfig,
    ) -> Self {
        let workers = settings.max_parallel_jobs.max(1);
        Self {
            monitor,
            ingestor,
            pool: Arc::new(Semaphore::new(workers)),
            settings,
            source_locks: Mutex::new(HashMap::new()),
            cancel: Mutex::new(CancellationToken::new()),
            state: Mutex::new(RunState::default()),
        }
    }

    pub fn monitor(&self) -> &Arc<SourceMonitor> {
        &self.monitor
    }

    pub fn settings(&self) -> &OrchestratorConfig {
        &self.settings
    }

    fn now(&self) -> DateTime<Utc> {
        self.monitor.clock().now()
    }

    /// Token for new work; cancelled (and replaced) by [`cancel_all`](Self::cancel_all).
    fn run_token(&self) -> CancellationToken {
        self.cancel
            .lock()
            .expect("cancel mutex poisoned")
            .child_token()
    }

    /// Cancel every job in flight. Jobs still queued end as `cancelled`; later calls run normally.
    pub fn cancel_all(&self) {
        let mut guard = self.cancel.lock().expect("cancel mutex poisoned");
        guard.cancel();
        *guard = CancellationToken::new();
        tracing::warn!(target: "sync", "all in-flight sync jobs cancelled");
    }

    fn source_lock(&self, id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.source_locks.lock().expect("source lock map poisoned");
        locks
            .entry(id.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Single-source sync honoring `skip_if_no_update`.
    pub async fn sync_state(&self, source_id: &str) -> Result<SyncJob> {
        self.sync_state_with(source_id, SyncMode::Routine).await
    }

    /// Single-source sync. Only an unknown source id is an `Err`; sync failures are in the job.
    pub async fn sync_state_with(&self, source_id: &str, mode: SyncMode) -> Result<SyncJob> {
        let src = self.monitor.source(source_id)?.clone();
        let token = self.run_token();
        Ok(self.run_job(&src, mode, None, None, &token).await)
    }

    /// Sync `source_ids` (all enabled sources when empty) through the worker pool.
    /// Returns one job per source in dequeue order. Unknown ids fail the call up front.
    pub async fn sync_all(self: &Arc<Self>, source_ids: &[String]) -> Result<Vec<SyncJob>> {
        let sources: Vec<SourceConfig> = if source_ids.is_empty() {
            self.monitor.enabled_sources().cloned().collect()
        } else {
            source_ids
                .iter()
                .map(|id| self.monitor.source(id).cloned())
                .collect::<Result<_>>()?
        };

        let started_at = self.now();
        {
            let mut st = self.state.lock().expect("run state poisoned");
            st.last_run_started_at = Some(started_at);
        }

        let mut prechecks: HashMap<String, UpdateCheck> = HashMap::new();
        if self.settings.check_for_updates_first {
            for src in &sources {
                match self.monitor.check_for_update(&src.id).await {
                    Ok(c) => {
                        tracing::info!(
                            target: "sync",
                            source = %src.id,
                            has_update = c.has_update,
                            error = c.error.as_deref().unwrap_or(""),
                            "pre-check"
                        );
                        prechecks.insert(src.id.clone(), c);
                    }
                    Err(e) => tracing::warn!(target: "sync", source = %src.id, "pre-check failed: {e:#}"),
                }
            }
        }

        let mut ordered = sources;
        // stable: equal priorities keep declaration order
        ordered.sort_by_key(|s| s.priority);
        let queue: VecDeque<QueuedJob> = ordered
            .into_iter()
            .map(|source| {
                let precheck = prechecks.remove(&source.id);
                QueuedJob { source, precheck }
            })
            .collect();
        let expected: Vec<String> = queue.iter().map(|q| q.source.id.clone()).collect();
        let queue = Arc::new(Mutex::new((queue, 0usize)));

        tracing::info!(
            target: "sync",
            jobs = expected.len(),
            workers = self.settings.max_parallel_jobs,
            "sync run started"
        );

        let token = self.run_token();
        let mut workers = JoinSet::new();
        for worker in 0..self.settings.max_parallel_jobs.max(1) {
            let this = Arc::clone(self);
            let queue = Arc::clone(&queue);
            let token = token.clone();
            workers.spawn(async move {
                let mut done = Vec::new();
                loop {
                    let next = {
                        let mut q = queue.lock().expect("job queue poisoned");
                        let (jobs, pos) = &mut *q;
                        jobs.pop_front().map(|j| {
                            let p = *pos;
                            *pos += 1;
                            (j, p)
                        })
                    };
                    let Some((job, position)) = next else { break };
                    tracing::debug!(target: "sync", worker, source = %job.source.id, position, "dequeued");
                    let result = this
                        .run_job(&job.source, SyncMode::Routine, job.precheck, Some(position), &token)
                        .await;
                    done.push(result);
                }
                done
            });
        }

        let mut results = Vec::with_capacity(expected.len());
        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok(mut jobs) => results.append(&mut jobs),
                Err(e) => tracing::error!(target: "sync", "sync worker crashed: {e}"),
            }
        }

        // a crashed worker loses its job; report it rather than drop the source
        for id in &expected {
            if !results.iter().any(|j| &j.source_id == id) {
                let mut lost = SyncJob::pending(id.clone());
                lost.start(self.now());
                lost.error = Some("sync worker crashed".to_string());
                lost.finish(JobStatus::Failed, self.now());
                results.push(lost);
            }
        }
        results.sort_by_key(|j| j.queue_position.unwrap_or(usize::MAX));

        let summary = JobSummary::from_jobs(&results);
        tracing::info!(
            target: "sync",
            completed = summary.completed,
            failed = summary.failed,
            skipped = summary.skipped,
            cancelled = summary.cancelled,
            added = summary.total_entries_added,
            updated = summary.total_entries_updated,
            success_rate = summary.success_rate,
            "sync run finished"
        );

        let mut st = self.state.lock().expect("run state poisoned");
        st.last_run = results.clone();
        st.last_run_finished_at = Some(self.now());
        Ok(results)
    }

    pub fn get_status(&self) -> OrchestratorStatus {
        let st = self.state.lock().expect("run state poisoned");
        OrchestratorStatus {
            running: st.running.values().cloned().collect(),
            last_run: st.last_run.clone(),
            last_run_started_at: st.last_run_started_at,
            last_run_finished_at: st.last_run_finished_at,
            max_parallel_jobs: self.settings.max_parallel_jobs,
            available_permits: self.pool.available_permits(),
            lifetime: st.lifetime.clone(),
        }
    }

    /// Aggregates over the most recent `sync_all` run.
    pub fn get_summary(&self) -> JobSummary {
        let st = self.state.lock().expect("run state poisoned");
        JobSummary::from_jobs(&st.last_run)
    }

    pub fn lifetime_counters(&self) -> LifetimeCounters {
        self.state.lock().expect("run state poisoned").lifetime.clone()
    }

    fn track_running(&self, job: &SyncJob) {
        let mut st = self.state.lock().expect("run state poisoned");
        st.running.insert(job.id, job.clone());
    }

    fn finish_job(&self, job: &mut SyncJob, status: JobStatus) {
        job.finish(status, self.now());
        counter!("sync_jobs_total", "status" => status.as_str()).increment(1);
        histogram!("sync_job_duration_ms").record(job.duration_ms as f64);

        let mut st = self.state.lock().expect("run state poisoned");
        st.running.remove(&job.id);
        st.lifetime.record(status);
    }

    fn cancelled(&self, mut job: SyncJob) -> SyncJob {
        if job.started_at.is_none() {
            job.start(self.now());
        }
        job.error.get_or_insert_with(|| "cancelled".to_string());
        self.finish_job(&mut job, JobStatus::Cancelled);
        tracing::warn!(target: "sync", source = %job.source_id, "sync cancelled");
        job
    }

    async fn acquire_permit(&self, token: &CancellationToken) -> Option<OwnedSemaphorePermit> {
        tokio::select! {
            biased;
            _ = token.cancelled() => None,
            p = Arc::clone(&self.pool).acquire_owned() => p.ok(),
        }
    }

    async fn run_job(
        &self,
        src: &SourceConfig,
        mode: SyncMode,
        precheck: Option<UpdateCheck>,
        queue_position: Option<usize>,
        token: &CancellationToken,
    ) -> SyncJob {
        let mut job = SyncJob::pending(src.id.clone());
        job.queue_position = queue_position;

        let lock = self.source_lock(&src.id);
        let _source_guard = tokio::select! {
            biased;
            _ = token.cancelled() => return self.cancelled(job),
            g = lock.lock_owned() => g,
        };

        // The fingerprint this job gates on is the one it records as ingested.
        let check = match precheck {
            Some(c) => Some(c),
            None => match self.monitor.check_for_update(&src.id).await {
                Ok(c) => Some(c),
                Err(e) => {
                    tracing::warn!(target: "sync", source = %src.id, "update check failed: {e:#}");
                    None
                }
            },
        };
        let gated_hash = check.as_ref().and_then(|c| c.current_hash.clone());

        if mode == SyncMode::Routine && self.settings.skip_if_no_update {
            match &check {
                Some(c) if c.error.is_none() && !c.has_update => {
                    job.start(self.now());
                    self.finish_job(&mut job, JobStatus::Skipped);
                    tracing::info!(target: "sync", source = %src.id, "no upstream change, skipped");
                    return job;
                }
                Some(c) if c.error.is_none() => {}
                _ => {
                    tracing::warn!(target: "sync", source = %src.id, "update check failed, syncing anyway");
                }
            }
        }

        let Some(mut _permit) = self.acquire_permit(token).await else {
            return self.cancelled(job);
        };

        job.start(self.now());
        self.track_running(&job);
        tracing::info!(target: "sync", source = %src.id, "sync started");

        let max_retries = self.settings.retry_attempts;
        let mut attempt: u32 = 0;
        let outcome = loop {
            let started_at = self.now();
            let t0 = Instant::now();
            let res = tokio::select! {
                biased;
                _ = token.cancelled() => None,
                r = tokio::time::timeout(self.settings.job_timeout, self.ingestor.ingest(&src.id)) => Some(r),
            };
            let elapsed = t0.elapsed().as_millis() as u64;

            let err = match res {
                None => {
                    job.attempts.push(AttemptRecord {
                        attempt,
                        started_at,
                        duration_ms: elapsed,
                        error: Some("cancelled".into()),
                    });
                    break None;
                }
                Some(Ok(Ok(stats))) => {
                    job.attempts.push(AttemptRecord {
                        attempt,
                        started_at,
                        duration_ms: elapsed,
                        error: None,
                    });
                    break Some(Ok(stats));
                }
                Some(Ok(Err(e))) => format!("{e:#}"),
                Some(Err(_)) => format!("ingest timed out after {:?}", self.settings.job_timeout),
            };

            tracing::warn!(target: "sync", source = %src.id, attempt, error = %err, "ingest attempt failed");
            job.attempts.push(AttemptRecord {
                attempt,
                started_at,
                duration_ms: elapsed,
                error: Some(err.clone()),
            });
            job.error = Some(err.clone());

            if attempt >= max_retries {
                break Some(Err(err));
            }
            attempt += 1;
            job.retry_count = attempt;
            counter!("sync_retries_total").increment(1);

            // give the slot back while backing off
            drop(_permit);
            let slept = tokio::select! {
                biased;
                _ = token.cancelled() => false,
                _ = tokio::time::sleep(self.settings.retry_delay()) => true,
            };
            if !slept {
                break None;
            }
            _permit = match self.acquire_permit(token).await {
                Some(p) => p,
                None => break None,
            };
        };

        match outcome {
            None => self.cancelled(job),
            Some(Ok(stats)) => {
                job.entries_processed = stats.valid_entries;
                job.entries_added = stats.additions;
                job.entries_updated = stats.updates;
                job.error = None;
                let now = self.now();
                let persisted = modify_status(
                    self.monitor.store().as_ref(),
                    &src.id,
                    &src.data_origin,
                    |row| {
                        row.last_sync_at = Some(now);
                        row.last_attempt_at = Some(now);
                        row.last_status = Some(LastSyncOutcome::Success);
                        row.consecutive_failures = 0;
                        row.entries_processed = job.entries_processed;
                        row.entries_added = stats.additions;
                        row.entries_updated = stats.updates;
                        row.entries_removed = stats.removals;
                        if gated_hash.is_some() {
                            row.previous_hash = gated_hash.clone();
                        }
                        row.last_error = None;
                    },
                )
                .await;
                if let Err(e) = persisted {
                    let msg = format!("sync of {} succeeded but status update failed: {e:#}", src.id);
                    self.monitor.alerts().emit(Severity::Error, Some(&src.id), msg.clone());
                    job.error = Some(msg);
                }
                for w in stats.warnings.iter().take(5) {
                    tracing::debug!(target: "sync", source = %src.id, warning = %w, "ingest warning");
                }
                self.finish_job(&mut job, JobStatus::Completed);
                tracing::info!(
                    target: "sync",
                    source = %src.id,
                    added = job.entries_added,
                    updated = job.entries_updated,
                    retries = job.retry_count,
                    duration_ms = job.duration_ms,
                    "sync completed"
                );
                job
            }
            Some(Err(last_error)) => {
                let now = self.now();
                let row = modify_status(
                    self.monitor.store().as_ref(),
                    &src.id,
                    &src.data_origin,
                    |row| {
                        row.last_attempt_at = Some(now);
                        row.last_status = Some(LastSyncOutcome::Failure);
                        row.consecutive_failures += 1;
                        row.last_error = Some(last_error.clone());
                    },
                )
                .await;
                self.finish_job(&mut job, JobStatus::Failed);

                let summary = job
                    .failure_summary()
                    .unwrap_or_else(|| format!("failed: {last_error}"));
                self.monitor.alerts().emit(
                    Severity::Error,
                    Some(&src.id),
                    format!("sync of {} {summary}", src.display_name()),
                );
                match row {
                    Ok(row) if row.consecutive_failures >= self.settings.max_consecutive_failures => {
                        self.monitor.alerts().emit(
                            Severity::Critical,
                            Some(&src.id),
                            format!(
                                "{} has failed {} consecutive syncs; investigate the source",
                                src.display_name(),
                                row.consecutive_failures
                            ),
                        );
                    }
                    Ok(_) => {}
                    Err(e) => tracing::error!(target: "sync", source = %src.id, "status update failed: {e:#}"),
                }
                job
            }
        }
    }
}

/// True when `err` came from naming a source that is not configured.
pub fn is_unknown_source(err: &anyhow::Error) -> bool {
    matches!(err.downcast_ref::<SyncError>(), Some(SyncError::UnknownSource(_)))
}
