// tests/support/mod.rs
//
// In-memory doubles for the engine's collaborators plus a builder that wires
// them into an `Engine` the same way the binary does.
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use chrono::{TimeZone, Utc};
use parking_lot::Mutex;

use apl_sync::clock::{Clock, ManualClock};
use apl_sync::config::{CheckMethod, EngineConfig, OrchestratorConfig, SourceConfig};
use apl_sync::ingest::Ingestor;
use apl_sync::model::IngestStats;
use apl_sync::monitor::{Metadata, MetadataChecker};
use apl_sync::store::MemoryStatusStore;
use apl_sync::Engine;

#[derive(Debug, Clone)]
pub enum Behavior {
    /// Succeeds with this many additions.
    Add(u64),
    /// Always fails with this message.
    Fail(String),
    /// Fails this many times, then succeeds with the additions.
    FlakyThenAdd(u32, u64),
    /// Succeeds with this many additions and updates.
    Upsert { added: u64, updated: u64 },
}

/// Scripted ingestor that records call order and peak concurrency.
pub struct StubIngestor {
    delay: Duration,
    default: Behavior,
    plan: Mutex<HashMap<String, Behavior>>,
    attempts: Mutex<HashMap<String, u32>>,
    calls: Mutex<Vec<String>>,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

impl StubIngestor {
    pub fn new(default: Behavior) -> Self {
        Self {
            delay: Duration::ZERO,
            default,
            plan: Mutex::new(HashMap::new()),
            attempts: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn set(&self, source: &str, b: Behavior) {
        self.plan.lock().insert(source.to_string(), b);
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    pub fn call_count(&self, source: &str) -> usize {
        self.calls.lock().iter().filter(|s| *s == source).count()
    }

    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait::async_trait]
impl Ingestor for StubIngestor {
    async fn ingest(&self, source_id: &str) -> Result<IngestStats> {
        self.calls.lock().push(source_id.to_string());
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        let _guard = InFlight(&self.in_flight);

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        let behavior = self
            .plan
            .lock()
            .get(source_id)
            .cloned()
            .unwrap_or_else(|| self.default.clone());
        let attempt = {
            let mut a = self.attempts.lock();
            let n = a.entry(source_id.to_string()).or_insert(0);
            *n += 1;
            *n
        };
        let ok = |adds: u64| IngestStats {
            total_rows: adds,
            valid_entries: adds,
            additions: adds,
            ..Default::default()
        };
        match behavior {
            Behavior::Add(n) => Ok(ok(n)),
            Behavior::Fail(msg) => Err(anyhow!(msg)),
            Behavior::FlakyThenAdd(fails, _) if attempt <= fails => {
                Err(anyhow!("transient failure #{attempt}"))
            }
            Behavior::FlakyThenAdd(_, n) => Ok(ok(n)),
            Behavior::Upsert { added, updated } => Ok(IngestStats {
                total_rows: added + updated,
                valid_entries: added + updated,
                additions: added,
                updates: updated,
                ..Default::default()
            }),
        }
    }
}

/// Metadata checker keyed by URL. Unknown URLs hash to "h0".
#[derive(Default)]
pub struct StubChecker {
    hashes: Mutex<HashMap<String, Result<String, String>>>,
}

impl StubChecker {
    pub fn set_hash(&self, url: &str, hash: &str) {
        self.hashes.lock().insert(url.to_string(), Ok(hash.to_string()));
    }

    pub fn set_error(&self, url: &str, err: &str) {
        self.hashes.lock().insert(url.to_string(), Err(err.to_string()));
    }
}

#[async_trait::async_trait]
impl MetadataChecker for StubChecker {
    async fn check(&self, url: &str, _method: CheckMethod) -> Result<Metadata> {
        let entry = self
            .hashes
            .lock()
            .get(url)
            .cloned()
            .unwrap_or_else(|| Ok("h0".to_string()));
        match entry {
            Ok(hash) => Ok(Metadata {
                hash,
                last_modified: None,
                size: None,
            }),
            Err(e) => Err(anyhow!(e)),
        }
    }
}

pub fn url_for(id: &str) -> String {
    format!("https://apl.example.gov/{}.csv", id.to_lowercase())
}

pub fn source(id: &str) -> SourceConfig {
    SourceConfig::new(id, url_for(id))
}

pub fn fast_orchestrator() -> OrchestratorConfig {
    OrchestratorConfig {
        retry_delay_ms: 5,
        ..Default::default()
    }
}

pub struct Harness {
    pub engine: Engine,
    pub store: Arc<MemoryStatusStore>,
    pub checker: Arc<StubChecker>,
    pub ingestor: Arc<StubIngestor>,
    pub clock: Arc<ManualClock>,
}

pub fn start_time() -> chrono::DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap()
}

pub fn harness(sources: Vec<SourceConfig>, orchestrator: OrchestratorConfig, ingestor: StubIngestor) -> Harness {
    let config = EngineConfig {
        orchestrator,
        sources,
        ..Default::default()
    };
    harness_with_config(config, ingestor)
}

pub fn harness_with_config(config: EngineConfig, ingestor: StubIngestor) -> Harness {
    let store = Arc::new(MemoryStatusStore::new());
    let checker = Arc::new(StubChecker::default());
    let ingestor = Arc::new(ingestor);
    let clock = Arc::new(ManualClock::new(start_time()));
    let engine = Engine::build(
        config,
        store.clone(),
        checker.clone(),
        ingestor.clone(),
        clock.clone() as Arc<dyn Clock>,
    )
    .expect("engine builds from test config");
    Harness {
        engine,
        store,
        checker,
        ingestor,
        clock,
    }
}

pub fn ids(list: &[&str]) -> Vec<String> {
    list.iter().map(|s| s.to_string()).collect()
}
