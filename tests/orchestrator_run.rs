// tests/orchestrator_run.rs
//
// Orchestrator behavior through the public API:
// - end-to-end run over four sources
// - bounded concurrency, priority dequeue order
// - retry loop with attempt history, terminal failure, escalation
// - skip-if-unchanged, timeouts, cancellation, unknown ids

mod support;

use std::sync::Arc;
use std::time::Duration;

use apl_sync::alerts::Severity;
use apl_sync::clock::Clock;
use apl_sync::config::OrchestratorConfig;
use apl_sync::model::LastSyncOutcome;
use apl_sync::store::SyncStatusRepository;
use apl_sync::{JobStatus, SyncError};
use support::{fast_orchestrator, harness, ids, source, url_for, Behavior, StubIngestor};

#[tokio::test]
async fn four_state_run_completes_and_records_status() {
    // declared out of order; priority decides the queue
    let h = harness(
        vec![
            source("OR").with_priority(4),
            source("FL").with_priority(3),
            source("MI").with_priority(1),
            source("NC").with_priority(2),
        ],
        fast_orchestrator(),
        StubIngestor::new(Behavior::Upsert { added: 10, updated: 5 }),
    );
    for id in ["MI", "NC", "FL", "OR"] {
        h.checker.set_hash(&url_for(id), &format!("{id}-v1"));
    }

    let jobs = h.engine.orchestrator.sync_all(&[]).await.expect("sync_all");
    assert_eq!(jobs.len(), 4);
    assert!(jobs.iter().all(|j| j.status == JobStatus::Completed));
    let order: Vec<_> = jobs.iter().map(|j| j.source_id.as_str()).collect();
    assert_eq!(order, ["MI", "NC", "FL", "OR"]);
    assert_eq!(
        jobs.iter().map(|j| j.queue_position).collect::<Vec<_>>(),
        [Some(0), Some(1), Some(2), Some(3)]
    );

    let summary = h.engine.orchestrator.get_summary();
    assert_eq!(summary.completed, 4);
    assert_eq!(summary.total_entries_added, 40);
    assert_eq!(summary.total_entries_updated, 20);
    assert_eq!(summary.success_rate, 100.0);

    for id in ["MI", "NC", "FL", "OR"] {
        let row = h.store.get(id, "apl").await.unwrap().expect("status row");
        assert_eq!(row.last_status, Some(LastSyncOutcome::Success));
        assert_eq!(row.last_sync_at, Some(h.clock.now()));
        assert_eq!(row.entries_added, 10);
        assert_eq!(row.entries_updated, 5);
        assert_eq!(row.consecutive_failures, 0);
        // the pre-check fingerprint is promoted once the ingest succeeds
        let expected = format!("{id}-v1");
        assert_eq!(row.previous_hash.as_deref(), Some(expected.as_str()));
        assert_eq!(row.current_hash.as_deref(), Some(expected.as_str()));
    }

    let status = h.engine.orchestrator.get_status();
    assert!(status.running.is_empty());
    assert_eq!(status.last_run.len(), 4);
    assert_eq!(status.available_permits, 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn at_most_max_parallel_jobs_ingest_at_once() {
    let h = harness(
        ["A", "B", "C", "D", "E"].into_iter().map(source).collect(),
        OrchestratorConfig {
            max_parallel_jobs: 2,
            ..fast_orchestrator()
        },
        StubIngestor::new(Behavior::Add(1)).with_delay(Duration::from_millis(60)),
    );

    let jobs = h.engine.orchestrator.sync_all(&[]).await.unwrap();
    assert_eq!(jobs.len(), 5);
    assert!(jobs.iter().all(|j| j.status == JobStatus::Completed));
    assert_eq!(h.ingestor.peak_concurrency(), 2);
}

#[tokio::test]
async fn lower_priority_number_dequeues_first() {
    let h = harness(
        vec![
            source("A").with_priority(3),
            source("B").with_priority(1),
            source("C").with_priority(2),
        ],
        OrchestratorConfig {
            max_parallel_jobs: 1,
            ..fast_orchestrator()
        },
        StubIngestor::new(Behavior::Add(1)),
    );

    let jobs = h.engine.orchestrator.sync_all(&[]).await.unwrap();
    let order: Vec<_> = jobs.iter().map(|j| j.source_id.as_str()).collect();
    assert_eq!(order, ["B", "C", "A"]);
    assert_eq!(
        jobs.iter().map(|j| j.queue_position).collect::<Vec<_>>(),
        [Some(0), Some(1), Some(2)]
    );
    assert_eq!(h.ingestor.calls(), ids(&["B", "C", "A"]));
}

#[tokio::test]
async fn equal_priorities_keep_declaration_order() {
    let h = harness(
        vec![source("X"), source("Y").with_priority(5), source("Z")],
        OrchestratorConfig {
            max_parallel_jobs: 1,
            ..fast_orchestrator()
        },
        StubIngestor::new(Behavior::Add(1)),
    );
    h.engine.orchestrator.sync_all(&[]).await.unwrap();
    assert_eq!(h.ingestor.calls(), ids(&["Y", "X", "Z"]));
}

#[tokio::test]
async fn persistent_failure_exhausts_retries_with_history() {
    let h = harness(
        vec![source("OR")],
        OrchestratorConfig {
            retry_attempts: 3,
            retry_delay_ms: 1,
            ..Default::default()
        },
        StubIngestor::new(Behavior::Fail("HTTP 503 from state portal".into())),
    );

    let job = h.engine.orchestrator.sync_state("OR").await.unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.retry_count, 3);
    assert_eq!(job.attempts.len(), 4);
    assert!(job.attempts.iter().all(|a| a.error.is_some()));
    assert_eq!(h.ingestor.call_count("OR"), 4);
    let summary = job.failure_summary().expect("failure summary");
    assert!(summary.starts_with("failed after 4 attempts"), "{summary}");
    assert!(summary.contains("HTTP 503"));

    let row = h.store.get("OR", "apl").await.unwrap().unwrap();
    assert_eq!(row.last_status, Some(LastSyncOutcome::Failure));
    assert_eq!(row.consecutive_failures, 1);
    assert!(row.last_sync_at.is_none());
    assert!(row.last_error.unwrap().contains("HTTP 503"));

    let alert = &h.engine.alerts.recent(1)[0];
    assert_eq!(alert.severity, Severity::Error);
    assert_eq!(alert.source_id.as_deref(), Some("OR"));
}

#[tokio::test]
async fn transient_failures_recover_within_retry_budget() {
    let h = harness(
        vec![source("FL")],
        fast_orchestrator(),
        StubIngestor::new(Behavior::FlakyThenAdd(2, 7)),
    );

    let job = h.engine.orchestrator.sync_state("FL").await.unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.retry_count, 2);
    assert_eq!(job.attempts.len(), 3);
    assert!(job.attempts[0].error.is_some());
    assert!(job.attempts[2].error.is_none());
    assert_eq!(job.entries_added, 7);
    assert!(job.error.is_none());
}

#[tokio::test]
async fn failure_streak_escalates_to_critical() {
    let h = harness(
        vec![source("NC")],
        OrchestratorConfig {
            retry_attempts: 0,
            max_consecutive_failures: 2,
            ..fast_orchestrator()
        },
        StubIngestor::new(Behavior::Fail("parse error".into())),
    );

    h.engine.orchestrator.sync_state("NC").await.unwrap();
    assert!(h
        .engine
        .alerts
        .recent(10)
        .iter()
        .all(|a| a.severity != Severity::Critical));

    h.engine.orchestrator.sync_state("NC").await.unwrap();
    let latest = &h.engine.alerts.recent(1)[0];
    assert_eq!(latest.severity, Severity::Critical);
    assert!(latest.message.contains("2 consecutive"));

    // a success resets the streak
    h.ingestor.set("NC", Behavior::Add(1));
    h.engine.orchestrator.sync_state("NC").await.unwrap();
    let row = h.store.get("NC", "apl").await.unwrap().unwrap();
    assert_eq!(row.consecutive_failures, 0);
}

#[tokio::test]
async fn unchanged_upstream_is_skipped_when_enabled() {
    let h = harness(
        vec![source("MI")],
        OrchestratorConfig {
            skip_if_no_update: true,
            ..fast_orchestrator()
        },
        StubIngestor::new(Behavior::Add(3)),
    );
    h.checker.set_hash(&url_for("MI"), "v1");

    // first sight: no previous fingerprint, so it ingests
    let first = h.engine.orchestrator.sync_state("MI").await.unwrap();
    assert_eq!(first.status, JobStatus::Completed);

    let second = h.engine.orchestrator.sync_state("MI").await.unwrap();
    assert_eq!(second.status, JobStatus::Skipped);
    assert_eq!(h.ingestor.call_count("MI"), 1);

    h.checker.set_hash(&url_for("MI"), "v2");
    let third = h.engine.orchestrator.sync_state("MI").await.unwrap();
    assert_eq!(third.status, JobStatus::Completed);
    assert_eq!(h.ingestor.call_count("MI"), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn change_seen_mid_ingest_is_not_marked_ingested() {
    let h = harness(
        vec![source("MI")],
        OrchestratorConfig {
            skip_if_no_update: true,
            ..fast_orchestrator()
        },
        StubIngestor::new(Behavior::Add(1)).with_delay(Duration::from_millis(300)),
    );
    h.checker.set_hash(&url_for("MI"), "v1");

    let orch = Arc::clone(&h.engine.orchestrator);
    let first = tokio::spawn(async move { orch.sync_state("MI").await });
    tokio::time::sleep(Duration::from_millis(100)).await;
    h.checker.set_hash(&url_for("MI"), "v2");
    let seen = h.engine.monitor.check_for_update("MI").await.unwrap();
    assert!(seen.has_update);

    assert_eq!(first.await.unwrap().unwrap().status, JobStatus::Completed);
    let row = h.store.get("MI", "apl").await.unwrap().unwrap();
    assert_eq!(row.previous_hash.as_deref(), Some("v1"));
    assert_eq!(row.current_hash.as_deref(), Some("v2"));

    let second = h.engine.orchestrator.sync_state("MI").await.unwrap();
    assert_eq!(second.status, JobStatus::Completed);
    assert_eq!(h.ingestor.call_count("MI"), 2);
    let row = h.store.get("MI", "apl").await.unwrap().unwrap();
    assert_eq!(row.previous_hash.as_deref(), Some("v2"));
}

#[tokio::test]
async fn direct_sync_records_the_fingerprint_it_ingested() {
    let h = harness(
        vec![source("MI")],
        OrchestratorConfig {
            check_for_updates_first: false,
            skip_if_no_update: false,
            ..fast_orchestrator()
        },
        StubIngestor::new(Behavior::Add(1)),
    );
    h.checker.set_hash(&url_for("MI"), "v1");
    h.engine.orchestrator.sync_state("MI").await.unwrap();
    h.checker.set_hash(&url_for("MI"), "v2");
    h.engine.orchestrator.sync_state("MI").await.unwrap();

    let row = h.store.get("MI", "apl").await.unwrap().unwrap();
    assert_eq!(row.previous_hash.as_deref(), Some("v2"));
    assert!(!h.engine.monitor.check_for_update("MI").await.unwrap().has_update);
}

#[tokio::test]
async fn failed_update_check_does_not_block_sync() {
    let h = harness(
        vec![source("MI")],
        OrchestratorConfig {
            skip_if_no_update: true,
            ..fast_orchestrator()
        },
        StubIngestor::new(Behavior::Add(3)),
    );
    h.checker.set_error(&url_for("MI"), "dns failure");

    let job = h.engine.orchestrator.sync_state("MI").await.unwrap();
    assert_eq!(job.status, JobStatus::Completed);
}

#[tokio::test]
async fn slow_ingest_hits_the_job_deadline() {
    let h = harness(
        vec![source("MI")],
        OrchestratorConfig {
            retry_attempts: 0,
            job_timeout: Duration::from_millis(30),
            ..fast_orchestrator()
        },
        StubIngestor::new(Behavior::Add(1)).with_delay(Duration::from_secs(5)),
    );

    let job = h.engine.orchestrator.sync_state("MI").await.unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert!(job.error.unwrap().contains("timed out"));
}

#[tokio::test]
async fn cancel_all_ends_jobs_as_cancelled() {
    let h = harness(
        vec![source("MI"), source("NC"), source("FL")],
        OrchestratorConfig {
            max_parallel_jobs: 1,
            ..fast_orchestrator()
        },
        StubIngestor::new(Behavior::Add(1)).with_delay(Duration::from_secs(10)),
    );

    let orch = Arc::clone(&h.engine.orchestrator);
    let run = tokio::spawn(async move { orch.sync_all(&[]).await });
    tokio::time::sleep(Duration::from_millis(50)).await;
    h.engine.orchestrator.cancel_all();

    let jobs = run.await.expect("join").expect("sync_all");
    assert_eq!(jobs.len(), 3);
    assert!(jobs.iter().all(|j| j.status == JobStatus::Cancelled));
    assert_eq!(h.engine.orchestrator.get_summary().cancelled, 3);
    assert_eq!(h.engine.orchestrator.lifetime_counters().cancelled, 3);
    // only the job that was running ever reached the ingestor
    assert_eq!(h.ingestor.calls(), ids(&["MI"]));
}

#[tokio::test]
async fn unknown_source_is_a_hard_error() {
    let h = harness(vec![source("MI")], fast_orchestrator(), StubIngestor::new(Behavior::Add(1)));

    let err = h.engine.orchestrator.sync_all(&ids(&["MI", "ZZ"])).await.unwrap_err();
    assert!(matches!(err.downcast_ref::<SyncError>(), Some(SyncError::UnknownSource(id)) if id == "ZZ"));
    assert!(h.ingestor.calls().is_empty());

    let err = h.engine.orchestrator.sync_state("ZZ").await.unwrap_err();
    assert!(apl_sync::orchestrator::is_unknown_source(&err));
}

#[tokio::test]
async fn disabled_sources_are_left_out_of_full_runs() {
    let h = harness(
        vec![source("MI"), source("NC").disabled()],
        fast_orchestrator(),
        StubIngestor::new(Behavior::Add(1)),
    );
    let jobs = h.engine.orchestrator.sync_all(&[]).await.unwrap();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].source_id, "MI");
}
