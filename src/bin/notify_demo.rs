//! Demo that pushes a few alerts through the hub and multiplexer (log only when no channel is configured).

use std::sync::Arc;

use apl_sync::alerts::{AlertHub, Severity};
use apl_sync::notify::LogSink;
use apl_sync::NotifierMux;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() {
    let _ = dotenvy::dotenv();
    tracing_subscriber::fmt().with_target(false).init();

    let hub = AlertHub::new();
    let cancel = CancellationToken::new();
    let mux = NotifierMux::from_env();
    let mut sinks = vec![hub.spawn_sink(Arc::new(LogSink), cancel.clone())];
    if mux.channel_count() > 0 {
        sinks.push(hub.spawn_sink(Arc::new(mux), cancel.clone()));
    }

    let seq = [
        (Severity::Info, "upstream change detected for MI"),
        (Severity::Warning, "NC data is stale (170.2h since last sync)"),
        (Severity::Warning, "NC data is stale (171.0h since last sync)"),
        (Severity::Critical, "OR has failed 3 consecutive syncs; investigate the source"),
    ];

    for (severity, msg) in seq {
        let source = msg.split_whitespace().next();
        hub.emit(severity, source, msg);
        tokio::time::sleep(std::time::Duration::from_millis(400)).await;
    }

    cancel.cancel();
    for s in sinks {
        let _ = s.await;
    }
    println!("notify-demo done");
}
