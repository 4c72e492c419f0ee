use anyhow::{Context, Result};
use axum::{routing::get, Router};
use metrics::{describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use once_cell::sync::OnceCell;

/// One-time metrics registration (so series show up on /metrics).
pub fn ensure_metrics_described() {
    static ONCE: OnceCell<()> = OnceCell::new();
    ONCE.get_or_init(|| {
        describe_counter!("sync_jobs_total", "Terminal sync jobs by status.");
        describe_histogram!("sync_job_duration_ms", "Wall time of a sync job in milliseconds.");
        describe_counter!("sync_retries_total", "Ingest retries after a failed attempt.");
        describe_counter!("monitor_checks_total", "Metadata checks by outcome.");
        describe_gauge!(
            "monitor_source_age_hours",
            "Hours since the last successful sync, per source."
        );
        describe_counter!("alerts_emitted_total", "Alerts emitted by severity.");
        describe_counter!("scheduler_runs_total", "Orchestrator runs started by the scheduler.");
        describe_counter!(
            "scheduler_dropped_firings_total",
            "Firings dropped because a run was already in progress."
        );
        describe_gauge!(
            "scheduler_last_run_ts",
            "Unix ts when the scheduler last finished a run."
        );
        describe_counter!("emergency_requests_total", "Emergency sync requests by reason.");
    });
}

pub struct Metrics {
    pub handle: PrometheusHandle,
}

impl Metrics {
    /// Install the process-wide Prometheus recorder.
    pub fn init() -> Result<Self> {
        let handle = PrometheusBuilder::new()
            .install_recorder()
            .context("prometheus: install recorder")?;
        ensure_metrics_described();
        Ok(Self { handle })
    }

    /// Returns a router exposing `/metrics` with the Prometheus exposition format.
    pub fn router(&self) -> Router {
        let handle = self.handle.clone();
        Router::new().route(
            "/metrics",
            get(move || {
                let h = handle.clone();
                async move { h.render() }
            }),
        )
    }
}
