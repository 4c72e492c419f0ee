// src/notify/mod.rs
//! Outbound alert delivery. `NotifierMux` is itself an `AlertSink`: attach it to the
//! `AlertHub` and it fans out to every configured channel, rate-limited per source.

pub mod antiflutter;
pub mod discord;
pub mod email;
pub mod slack;

use anyhow::Result;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::alerts::{AlertSink, MonitorAlert, Severity};
use antiflutter::AntiFlutter;

/// Logs every alert it receives; useful as the default channel.
pub struct LogSink;

#[async_trait::async_trait]
impl AlertSink for LogSink {
    async fn emit(&self, alert: &MonitorAlert) -> Result<()> {
        tracing::info!(
            target: "notify",
            id = %alert.id,
            severity = %alert.severity,
            source = alert.source_id.as_deref().unwrap_or("-"),
            "{}",
            alert.message
        );
        Ok(())
    }

    fn name(&self) -> &'static str {
        "log"
    }
}

pub struct NotifierMux {
    channels: Vec<Arc<dyn AlertSink>>,
    min_severity: Severity,
    gate: Mutex<AntiFlutter>,
}

impl NotifierMux {
    pub fn new(channels: Vec<Arc<dyn AlertSink>>, min_severity: Severity, cooldown_secs: i64) -> Self {
        Self {
            channels,
            min_severity,
            gate: Mutex::new(AntiFlutter::new(cooldown_secs)),
        }
    }

    /// Slack / Discord / SMTP from env; channels whose vars are unset are skipped.
    /// ALERT_COOLDOWN_SECS (default 3h) rate-limits repeats per source.
    pub fn from_env() -> Self {
        let mut channels: Vec<Arc<dyn AlertSink>> = Vec::new();
        if let Some(s) = slack::SlackNotifier::from_env() {
            channels.push(Arc::new(s));
        }
        if let Some(d) = discord::DiscordNotifier::from_env() {
            channels.push(Arc::new(d));
        }
        match email::EmailSender::from_env() {
            Ok(Some(e)) => channels.push(Arc::new(e)),
            Ok(None) => {}
            Err(e) => tracing::warn!("email notifier disabled: {e:#}"),
        }

        let cooldown: i64 = std::env::var("ALERT_COOLDOWN_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(10_800); // 3h

        tracing::info!(
            channels = ?channels.iter().map(|c| c.name()).collect::<Vec<_>>(),
            cooldown,
            "notifier mux configured"
        );
        Self::new(channels, Severity::Warning, cooldown)
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }
}

#[async_trait::async_trait]
impl AlertSink for NotifierMux {
    async fn emit(&self, alert: &MonitorAlert) -> Result<()> {
        if alert.severity < self.min_severity || self.channels.is_empty() {
            return Ok(());
        }
        let key = alert.source_id.as_deref().unwrap_or("system");
        {
            let mut gate = self.gate.lock().await;
            if !gate.should_alert(key, alert.severity, alert.timestamp) {
                tracing::debug!(source = key, "suppressed by antiflutter");
                return Ok(());
            }
            gate.record_alert(key, alert.severity, alert.timestamp);
        }

        for ch in &self.channels {
            if let Err(e) = ch.emit(alert).await {
                tracing::warn!(channel = ch.name(), "notify failed: {e:#}");
            }
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "mux"
    }
}
