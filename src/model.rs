// src/model.rs
//! Records shared across the monitor, orchestrator, scheduler and emergency path.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

/// Hard faults out of the orchestration entry points. Per-source sync failures are
/// never reported this way; they end up in the job's status.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("unknown source {0:?}")]
    UnknownSource(String),
    #[error("a run is already in progress")]
    AlreadyRunning,
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LastSyncOutcome {
    Success,
    Failure,
}

/// Persistent per-(source, origin) row. Owned by the repository; the core only reads and upserts it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncStatus {
    pub source_id: String,
    pub data_origin: String,
    pub last_sync_at: Option<DateTime<Utc>>,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub last_status: Option<LastSyncOutcome>,
    pub consecutive_failures: u32,
    pub entries_processed: u64,
    pub entries_added: u64,
    pub entries_updated: u64,
    pub entries_removed: u64,
    /// Latest fingerprint observed by a metadata check (candidate).
    pub current_hash: Option<String>,
    /// Fingerprint of the content last ingested successfully.
    pub previous_hash: Option<String>,
    pub last_checked_at: Option<DateTime<Utc>>,
    pub next_scheduled_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl SyncStatus {
    pub fn new(source_id: impl Into<String>, data_origin: impl Into<String>) -> Self {
        Self {
            source_id: source_id.into(),
            data_origin: data_origin.into(),
            last_sync_at: None,
            last_attempt_at: None,
            last_status: None,
            consecutive_failures: 0,
            entries_processed: 0,
            entries_added: 0,
            entries_updated: 0,
            entries_removed: 0,
            current_hash: None,
            previous_hash: None,
            last_checked_at: None,
            next_scheduled_at: None,
            last_error: None,
        }
    }
}

/// What the ingest collaborator reports for one source. All-or-nothing per call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestStats {
    pub total_rows: u64,
    pub valid_entries: u64,
    pub invalid_entries: u64,
    pub additions: u64,
    pub updates: u64,
    pub removals: u64,
    pub duration_ms: u64,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Skipped => "skipped",
            JobStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One ingest attempt inside a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub attempt: u32,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub error: Option<String>,
}

/// One orchestration attempt (with retries) for a single source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncJob {
    pub id: Uuid,
    pub source_id: String,
    pub status: JobStatus,
    /// Order in which the job left the queue (0-based); `None` for direct calls.
    pub queue_position: Option<usize>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub duration_ms: u64,
    pub entries_processed: u64,
    pub entries_added: u64,
    pub entries_updated: u64,
    pub error: Option<String>,
    pub retry_count: u32,
    pub attempts: Vec<AttemptRecord>,
}

impl SyncJob {
    pub fn pending(source_id: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            source_id: source_id.into(),
            status: JobStatus::Pending,
            queue_position: None,
            started_at: None,
            finished_at: None,
            duration_ms: 0,
            entries_processed: 0,
            entries_added: 0,
            entries_updated: 0,
            error: None,
            retry_count: 0,
            attempts: Vec::new(),
        }
    }

    pub fn start(&mut self, now: DateTime<Utc>) {
        self.status = JobStatus::Running;
        self.started_at = Some(now);
    }

    pub fn finish(&mut self, status: JobStatus, now: DateTime<Utc>) {
        self.status = status;
        self.finished_at = Some(now);
        if let Some(started) = self.started_at {
            self.duration_ms = (now - started).num_milliseconds().max(0) as u64;
        }
    }

    /// "failed after 4 attempts, last error: ..." style summary.
    pub fn failure_summary(&self) -> Option<String> {
        if self.status != JobStatus::Failed {
            return None;
        }
        let last = self
            .attempts
            .iter()
            .rev()
            .find_map(|a| a.error.as_deref())
            .or(self.error.as_deref())
            .unwrap_or("unknown error");
        Some(format!(
            "failed after {} attempts, last error: {last}",
            self.attempts.len()
        ))
    }
}

/// Aggregate over a set of jobs (one orchestrator run, an emergency request, ...).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobSummary {
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub cancelled: usize,
    pub total_entries_added: u64,
    pub total_entries_updated: u64,
    pub average_duration_ms: u64,
    /// Percent of non-skipped jobs that completed; 100 when nothing ran.
    pub success_rate: f64,
}

impl JobSummary {
    pub fn from_jobs(jobs: &[SyncJob]) -> Self {
        let mut s = JobSummary {
            total: jobs.len(),
            ..Default::default()
        };
        let mut duration_sum = 0u64;
        for j in jobs {
            match j.status {
                JobStatus::Completed => s.completed += 1,
                JobStatus::Failed => s.failed += 1,
                JobStatus::Skipped => s.skipped += 1,
                JobStatus::Cancelled => s.cancelled += 1,
                JobStatus::Pending | JobStatus::Running => {}
            }
            s.total_entries_added += j.entries_added;
            s.total_entries_updated += j.entries_updated;
            duration_sum += j.duration_ms;
        }
        if !jobs.is_empty() {
            s.average_duration_ms = duration_sum / jobs.len() as u64;
        }
        let attempted = s.completed + s.failed + s.cancelled;
        s.success_rate = if attempted == 0 {
            100.0
        } else {
            s.completed as f64 * 100.0 / attempted as f64
        };
        s
    }
}
