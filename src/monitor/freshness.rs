// src/monitor/freshness.rs
//! Freshness classification. Pure; the caller supplies `now`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::config::FreshnessThresholds;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FreshnessLevel {
    Fresh,
    Aging,
    Stale,
    Critical,
    /// Never synced. Alerted as if critical.
    Unknown,
}

impl FreshnessLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            FreshnessLevel::Fresh => "fresh",
            FreshnessLevel::Aging => "aging",
            FreshnessLevel::Stale => "stale",
            FreshnessLevel::Critical => "critical",
            FreshnessLevel::Unknown => "unknown",
        }
    }
}

impl fmt::Display for FreshnessLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// First match wins: critical, stale, fresh (inclusive), otherwise aging.
pub fn classify(age: std::time::Duration, t: &FreshnessThresholds) -> FreshnessLevel {
    if age > t.critical {
        FreshnessLevel::Critical
    } else if age > t.stale {
        FreshnessLevel::Stale
    } else if age <= t.freshness {
        FreshnessLevel::Fresh
    } else {
        FreshnessLevel::Aging
    }
}

/// Derived on demand; never persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataFreshnessStatus {
    pub source_id: String,
    pub level: FreshnessLevel,
    pub last_sync_at: Option<DateTime<Utc>>,
    pub age_hours: Option<f64>,
    pub thresholds: FreshnessThresholds,
    pub checked_at: DateTime<Utc>,
    /// Set when the status row could not be read.
    pub error: Option<String>,
}

impl DataFreshnessStatus {
    pub fn evaluate(
        source_id: &str,
        last_sync_at: Option<DateTime<Utc>>,
        thresholds: FreshnessThresholds,
        now: DateTime<Utc>,
    ) -> Self {
        let (level, age_hours) = match last_sync_at {
            None => (FreshnessLevel::Unknown, None),
            Some(at) => {
                // future timestamps (clock skew) count as zero age
                let age = (now - at).to_std().unwrap_or_default();
                (classify(age, &thresholds), Some(age.as_secs_f64() / 3600.0))
            }
        };
        Self {
            source_id: source_id.to_string(),
            level,
            last_sync_at,
            age_hours,
            thresholds,
            checked_at: now,
            error: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    const H: u64 = 3600;

    fn t() -> FreshnessThresholds {
        FreshnessThresholds::hours(24, 168, 336)
    }

    #[test]
    fn boundaries_are_inclusive_on_lower_edge() {
        assert_eq!(classify(Duration::from_secs(0), &t()), FreshnessLevel::Fresh);
        assert_eq!(classify(Duration::from_secs(24 * H), &t()), FreshnessLevel::Fresh);
        assert_eq!(classify(Duration::from_secs(24 * H + 1), &t()), FreshnessLevel::Aging);
        assert_eq!(classify(Duration::from_secs(168 * H), &t()), FreshnessLevel::Aging);
        assert_eq!(classify(Duration::from_secs(168 * H + 1), &t()), FreshnessLevel::Stale);
        assert_eq!(classify(Duration::from_secs(336 * H), &t()), FreshnessLevel::Stale);
        assert_eq!(classify(Duration::from_secs(336 * H + 1), &t()), FreshnessLevel::Critical);
    }

    #[test]
    fn never_synced_is_unknown() {
        let s = DataFreshnessStatus::evaluate("MI", None, t(), Utc::now());
        assert_eq!(s.level, FreshnessLevel::Unknown);
        assert!(s.age_hours.is_none());
    }

    #[test]
    fn future_sync_time_is_fresh() {
        let now = Utc::now();
        let s = DataFreshnessStatus::evaluate("MI", Some(now + chrono::Duration::hours(1)), t(), now);
        assert_eq!(s.level, FreshnessLevel::Fresh);
        assert_eq!(s.age_hours, Some(0.0));
    }
}
