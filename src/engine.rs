// src/engine.rs
//! Wiring: builds every component from an [`EngineConfig`] plus the external
//! collaborators, so the binary and the tests assemble the system the same way.

use anyhow::Result;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::alerts::{AlertHub, AlertSink};
use crate::api::{self, AppState};
use crate::clock::Clock;
use crate::config::EngineConfig;
use crate::emergency::EmergencyTrigger;
use crate::health::HealthMonitor;
use crate::ingest::Ingestor;
use crate::monitor::{MetadataChecker, SourceMonitor};
use crate::orchestrator::SyncOrchestrator;
use crate::scheduler::SyncScheduler;
use crate::store::SyncStatusRepository;

pub struct Engine {
    pub config: EngineConfig,
    pub alerts: Arc<AlertHub>,
    pub monitor: Arc<SourceMonitor>,
    pub orchestrator: Arc<SyncOrchestrator>,
    pub scheduler: Arc<SyncScheduler>,
    pub emergency: Arc<EmergencyTrigger>,
    pub health: Arc<HealthMonitor>,
    shutdown: CancellationToken,
}

impl Engine {
    pub fn build(
        config: EngineConfig,
        store: Arc<dyn SyncStatusRepository>,
        checker: Arc<dyn MetadataChecker>,
        ingestor: Arc<dyn Ingestor>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config.validate()?;
        let alerts = Arc::new(AlertHub::new());
        let monitor = Arc::new(SourceMonitor::new(
            Arc::new(config.sources.clone()),
            store,
            checker,
            alerts.clone(),
            clock,
        ));
        let orchestrator = Arc::new(SyncOrchestrator::new(
            monitor.clone(),
            ingestor,
            config.orchestrator.clone(),
        ));
        let scheduler = Arc::new(SyncScheduler::new(orchestrator.clone(), config.scheduler.clone())?);
        let emergency = Arc::new(EmergencyTrigger::new(orchestrator.clone()));
        let health = Arc::new(HealthMonitor::new(orchestrator.clone(), config.health.clone()));

        tracing::info!(
            sources = config.sources.len(),
            enabled = config.enabled_sources().count(),
            max_parallel_jobs = config.orchestrator.max_parallel_jobs,
            "engine assembled"
        );
        Ok(Self {
            config,
            alerts,
            monitor,
            orchestrator,
            scheduler,
            emergency,
            health,
            shutdown: CancellationToken::new(),
        })
    }

    pub fn app_state(&self) -> AppState {
        AppState {
            orchestrator: self.orchestrator.clone(),
            scheduler: self.scheduler.clone(),
            emergency: self.emergency.clone(),
            health: self.health.clone(),
            alerts: self.alerts.clone(),
        }
    }

    pub fn router(&self) -> axum::Router {
        api::create_router(self.app_state())
    }

    pub fn attach_sink(&self, sink: Arc<dyn AlertSink>) -> JoinHandle<()> {
        self.alerts.spawn_sink(sink, self.shutdown.child_token())
    }

    /// Start the cron scheduler and the per-source update watcher.
    pub fn start_background(&self) -> JoinHandle<()> {
        self.scheduler.start();
        tokio::spawn(
            self.monitor
                .clone()
                .run_update_watcher(self.config.monitor.watch_tick, self.shutdown.child_token()),
        )
    }

    /// Stop timers, cancel in-flight jobs, and release sinks.
    pub fn shutdown(&self) {
        self.scheduler.stop();
        self.orchestrator.cancel_all();
        self.shutdown.cancel();
    }
}
