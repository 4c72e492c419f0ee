//! Sync engine binary.
//! Loads config, assembles the engine, starts the scheduler and update watcher,
//! and serves the admin API plus `/metrics`.

use anyhow::{Context, Result};
use std::sync::Arc;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use apl_sync::clock::SystemClock;
use apl_sync::config::EngineConfig;
use apl_sync::ingest::CommandIngestor;
use apl_sync::metrics::Metrics;
use apl_sync::monitor::HttpMetadataChecker;
use apl_sync::notify::{LogSink, NotifierMux};
use apl_sync::store::JsonFileStatusStore;
use apl_sync::Engine;

/// Compact text logs by default; JSON lines when SYNC_LOG_FORMAT=json.
fn init_tracing() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("apl_sync=info,warn"));
    let json = std::env::var("SYNC_LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json"));

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(fmt::layer().json().with_target(true)).init();
    } else {
        registry.with(fmt::layer().compact()).init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // .env is optional (local/dev).
    let _ = dotenvy::dotenv();
    init_tracing();

    let config = EngineConfig::load_default()?;
    let metrics = Metrics::init()?;

    let store = Arc::new(JsonFileStatusStore::open(&config.store.path).await?);
    let checker = Arc::new(HttpMetadataChecker::new(config.monitor.request_timeout)?);
    let program = config
        .ingest
        .program
        .clone()
        .context("ingest.program is not configured; set it in the config file")?;
    let ingestor = Arc::new(CommandIngestor::new(program, config.ingest.args.clone()));
    let bind = config.server.bind.clone();

    let engine = Engine::build(config, store, checker, ingestor, Arc::new(SystemClock))?;
    engine.attach_sink(Arc::new(LogSink));
    let mux = NotifierMux::from_env();
    if mux.channel_count() > 0 {
        engine.attach_sink(Arc::new(mux));
    }
    let watcher = engine.start_background();

    let app = engine.router().merge(metrics.router());
    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .with_context(|| format!("binding {bind}"))?;
    tracing::info!(%bind, "admin API listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown requested");
        })
        .await
        .context("serving admin API")?;

    engine.shutdown();
    let _ = watcher.await;
    Ok(())
}
