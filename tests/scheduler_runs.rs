// tests/scheduler_runs.rs
//
// Scheduler: non-overlap, history/statistics, timer firing, run-on-init,
// self-stop after repeated fully-failed runs.

mod support;

use std::sync::Arc;
use std::time::Duration;

use apl_sync::config::{EngineConfig, SchedulerConfig};
use apl_sync::scheduler::RunTrigger;
use apl_sync::store::SyncStatusRepository;
use apl_sync::SyncError;
use support::{fast_orchestrator, harness, harness_with_config, source, Behavior, Harness, StubIngestor};

fn scheduled(cron: &str, run_on_init: bool, stop_after: u32, ingestor: StubIngestor) -> Harness {
    let config = EngineConfig {
        orchestrator: fast_orchestrator(),
        scheduler: SchedulerConfig {
            cron: cron.into(),
            timezone: "UTC".into(),
            run_on_init,
            stop_after_failed_runs: stop_after,
        },
        sources: vec![source("MI")],
        ..Default::default()
    };
    harness_with_config(config, ingestor)
}

async fn wait_until(mut cond: impl FnMut() -> bool, limit: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + limit;
    while tokio::time::Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    cond()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn overlapping_trigger_is_dropped_not_queued() {
    let h = harness(
        vec![source("MI")],
        fast_orchestrator(),
        StubIngestor::new(Behavior::Add(5)).with_delay(Duration::from_millis(200)),
    );
    let sched = Arc::clone(&h.engine.scheduler);

    let first = tokio::spawn({
        let sched = Arc::clone(&sched);
        async move { sched.trigger_manual().await }
    });
    assert!(wait_until(|| sched.get_status().executing, Duration::from_secs(2)).await);

    let err = sched.trigger_manual().await.unwrap_err();
    assert!(matches!(err.downcast_ref::<SyncError>(), Some(SyncError::AlreadyRunning)));

    let entry = first.await.expect("join").expect("first run");
    assert_eq!(entry.trigger, RunTrigger::Manual);
    assert_eq!(entry.summary.completed, 1);

    assert_eq!(h.ingestor.call_count("MI"), 1);
    assert_eq!(sched.get_history().len(), 1);
    let stats = sched.get_statistics();
    assert_eq!(stats.total_runs, 1);
    assert_eq!(stats.dropped_firings, 1);
    assert!(!sched.get_status().executing);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn timer_firing_during_a_run_is_dropped() {
    // every second; one run outlasts the next slot
    let h = scheduled(
        "* * * * * *",
        false,
        0,
        StubIngestor::new(Behavior::Add(1)).with_delay(Duration::from_secs(3)),
    );
    let sched = Arc::clone(&h.engine.scheduler);
    sched.start();

    assert!(wait_until(|| sched.get_statistics().dropped_firings >= 1, Duration::from_secs(8)).await);
    sched.stop();
    assert!(wait_until(|| !sched.get_status().executing, Duration::from_secs(5)).await);

    let history = sched.get_history();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].trigger, RunTrigger::Scheduled);
    assert_eq!(sched.get_statistics().total_runs, 1);
    assert_eq!(h.ingestor.call_count("MI"), 1);
}

#[tokio::test]
async fn statistics_accumulate_across_runs() {
    let h = harness(
        vec![source("MI"), source("NC")],
        fast_orchestrator(),
        StubIngestor::new(Behavior::Add(10)),
    );
    let sched = &h.engine.scheduler;

    sched.trigger_manual().await.unwrap();
    h.ingestor.set("NC", Behavior::Fail("bad sheet".into()));
    let second = sched.trigger_manual().await.unwrap();
    assert_eq!(second.summary.failed, 1);
    assert!(!second.succeeded());

    let stats = sched.get_statistics();
    assert_eq!(stats.total_runs, 2);
    assert_eq!(stats.successful_runs, 1);
    assert_eq!(stats.failed_runs, 1);
    assert_eq!(stats.success_rate, 50.0);
    assert_eq!(stats.total_entries_added, 30);

    let history = sched.get_history();
    assert_eq!(history.len(), 2);
    assert!(history[0].started_at <= history[1].started_at);
    // a partially failed run does not count toward the self-stop streak
    assert_eq!(sched.get_status().consecutive_failed_runs, 0);
}

#[tokio::test]
async fn history_keeps_the_last_hundred_runs() {
    let h = harness(vec![source("MI")], fast_orchestrator(), StubIngestor::new(Behavior::Add(1)));
    for _ in 0..105 {
        h.engine.scheduler.trigger_manual().await.unwrap();
    }
    assert_eq!(h.engine.scheduler.get_history().len(), 100);
    assert_eq!(h.engine.scheduler.get_statistics().total_runs, 105);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn timer_fires_and_publishes_next_run() {
    let h = scheduled("* * * * * *", false, 0, StubIngestor::new(Behavior::Add(1)));
    let sched = Arc::clone(&h.engine.scheduler);
    sched.start();
    assert!(sched.get_status().started);

    assert!(wait_until(|| !sched.get_history().is_empty(), Duration::from_secs(5)).await);
    sched.stop();
    assert!(!sched.get_status().started);

    let entry = &sched.get_history()[0];
    assert_eq!(entry.trigger, RunTrigger::Scheduled);
    let row = h.store.get("MI", "apl").await.unwrap().expect("row");
    assert!(row.next_scheduled_at.is_some());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn run_on_init_fires_immediately() {
    // yearly; only the startup run can happen during the test
    let h = scheduled("0 0 1 1 *", true, 0, StubIngestor::new(Behavior::Add(1)));
    let sched = Arc::clone(&h.engine.scheduler);
    sched.start();
    assert!(wait_until(|| sched.get_history().len() == 1, Duration::from_secs(3)).await);
    assert_eq!(sched.get_history()[0].trigger, RunTrigger::Startup);
    assert!(sched.get_status().next_run_at.is_some());
    sched.stop();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn repeated_total_failure_stops_the_scheduler() {
    let h = scheduled(
        "0 0 1 1 *",
        true,
        1,
        StubIngestor::new(Behavior::Fail("portal down".into())),
    );
    let sched = Arc::clone(&h.engine.scheduler);
    sched.start();
    assert!(wait_until(|| !sched.get_status().started, Duration::from_secs(3)).await);
    assert_eq!(sched.get_status().consecutive_failed_runs, 1);
    assert!(h
        .engine
        .alerts
        .recent(10)
        .iter()
        .any(|a| a.message.contains("scheduler stopped")));
}
