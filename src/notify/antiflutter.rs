// src/notify/antiflutter.rs
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::HashMap;

use crate::alerts::Severity;

/// Cooldown gate to prevent notification spam, tracked per (source, severity).
/// - First alert for a pair always allowed.
/// - Inside cooldown, a repeat of the same pair is suppressed; other severities
///   for that source have their own clock.
/// - State is updated explicitly via `record_alert` after a send.
#[derive(Debug, Clone, Default)]
pub struct AntiFlutter {
    cooldown: ChronoDuration,
    last: HashMap<(String, Severity), DateTime<Utc>>,
}

impl AntiFlutter {
    /// `cooldown_secs` < 0 is treated as 0 (no cooldown).
    pub fn new(cooldown_secs: i64) -> Self {
        let secs = cooldown_secs.max(0);
        Self {
            cooldown: ChronoDuration::seconds(secs),
            last: HashMap::new(),
        }
    }

    /// Check if we may alert at `now`. Does NOT mutate state.
    pub fn should_alert(&self, source: &str, severity: Severity, now: DateTime<Utc>) -> bool {
        match self.last.get(&(source.to_string(), severity)) {
            None => true,
            Some(ts) => now.signed_duration_since(*ts) >= self.cooldown,
        }
    }

    pub fn record_alert(&mut self, source: &str, severity: Severity, now: DateTime<Utc>) {
        self.last.insert((source.to_string(), severity), now);
    }
}
