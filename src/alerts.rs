// src/alerts.rs
//! Alert hub: the core emits structured `MonitorAlert`s here; subscribers
//! (log, webhooks, email, dashboards) attach through a broadcast channel.

use chrono::{DateTime, Utc};
use metrics::counter;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::buffer::BoundedBuffer;

pub const ALERT_BUFFER_CAPACITY: usize = 1_000;
const CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Error,
    Critical,
}

impl Severity {
    pub fn as_str(self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Error => "error",
            Severity::Critical => "critical",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitorAlert {
    pub id: Uuid,
    pub severity: Severity,
    pub source_id: Option<String>,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    pub acknowledged: bool,
}

/// Something that wants every alert (webhook, mailer, pager...).
#[async_trait::async_trait]
pub trait AlertSink: Send + Sync {
    async fn emit(&self, alert: &MonitorAlert) -> anyhow::Result<()>;
    fn name(&self) -> &'static str;
}

#[derive(Debug)]
pub struct AlertHub {
    recent: Mutex<BoundedBuffer<MonitorAlert>>,
    tx: broadcast::Sender<MonitorAlert>,
}

impl Default for AlertHub {
    fn default() -> Self {
        Self::new()
    }
}

impl AlertHub {
    pub fn new() -> Self {
        Self::with_capacity(ALERT_BUFFER_CAPACITY)
    }

    pub fn with_capacity(cap: usize) -> Self {
        let (tx, _rx) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            recent: Mutex::new(BoundedBuffer::with_capacity(cap)),
            tx,
        }
    }

    /// Record and broadcast an alert. Fire-and-forget: no subscriber is required.
    pub fn emit(
        &self,
        severity: Severity,
        source_id: Option<&str>,
        message: impl Into<String>,
    ) -> MonitorAlert {
        let alert = MonitorAlert {
            id: Uuid::new_v4(),
            severity,
            source_id: source_id.map(str::to_string),
            message: message.into(),
            timestamp: Utc::now(),
            acknowledged: false,
        };

        let source = alert.source_id.as_deref().unwrap_or("-");
        match severity {
            Severity::Info => tracing::info!(target: "alerts", source, "{}", alert.message),
            Severity::Warning => tracing::warn!(target: "alerts", source, "{}", alert.message),
            Severity::Error | Severity::Critical => {
                tracing::error!(target: "alerts", source, severity = %severity, "{}", alert.message)
            }
        }
        counter!("alerts_emitted_total", "severity" => severity.as_str()).increment(1);

        self.recent
            .lock()
            .expect("alert buffer mutex poisoned")
            .push(alert.clone());
        // Err only means nobody is listening right now.
        let _ = self.tx.send(alert.clone());
        alert
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MonitorAlert> {
        self.tx.subscribe()
    }

    /// Returns false if the alert is unknown (never emitted or already evicted).
    pub fn acknowledge(&self, id: Uuid) -> bool {
        let mut recent = self.recent.lock().expect("alert buffer mutex poisoned");
        let found = match recent.iter_mut().find(|a| a.id == id) {
            Some(a) => {
                a.acknowledged = true;
                true
            }
            None => false,
        };
        found
    }

    /// Up to `n` most recent alerts, newest first.
    pub fn recent(&self, n: usize) -> Vec<MonitorAlert> {
        let recent = self.recent.lock().expect("alert buffer mutex poisoned");
        recent.iter().rev().take(n).cloned().collect()
    }

    pub fn unacknowledged(&self) -> Vec<MonitorAlert> {
        let recent = self.recent.lock().expect("alert buffer mutex poisoned");
        recent.iter().filter(|a| !a.acknowledged).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.recent.lock().expect("alert buffer mutex poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Forward every alert to `sink` until `cancel` fires. Sink errors are logged, not fatal.
    pub fn spawn_sink(&self, sink: Arc<dyn AlertSink>, cancel: CancellationToken) -> JoinHandle<()> {
        let mut rx = self.subscribe();
        tokio::spawn(async move {
            loop {
                let alert = tokio::select! {
                    _ = cancel.cancelled() => return,
                    res = rx.recv() => res,
                };
                match alert {
                    Ok(alert) => {
                        if let Err(e) = sink.emit(&alert).await {
                            tracing::warn!(sink = sink.name(), error = %format!("{e:#}"), "alert sink failed");
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!(sink = sink.name(), skipped = n, "alert sink lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => return,
                }
            }
        })
    }
}
