// src/lib.rs
// Public library surface for the binary and integration tests.

pub mod alerts;
pub mod api;
pub mod buffer;
pub mod clock;
pub mod config;
pub mod emergency;
pub mod engine;
pub mod health;
pub mod ingest;
pub mod metrics;
pub mod model;
pub mod monitor;
pub mod orchestrator;
pub mod scheduler;
pub mod store;

// Outbound alert channels (Slack, Discord, SMTP)
pub mod notify;

// ---- Re-exports for stable public API ----
pub use crate::api::create_router;
pub use crate::config::{EngineConfig, SourceConfig};
pub use crate::engine::Engine;
pub use crate::model::{JobStatus, SyncError, SyncJob, SyncStatus};
pub use crate::notify::NotifierMux;
