//! The single source of "now" shared by foreground calls and background tasks.
//!
//! Lease expiry, heartbeat timeouts and checkpoint ordering all compare
//! timestamps produced by the same [`Clock`], so a sweep and an acquire
//! running concurrently can never disagree about whether a lease is live.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use parking_lot::Mutex;

use crate::errors::ValidationError;

/// Implementations return millisecond precision, the resolution timestamps
/// are persisted at.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        truncate_ms(Utc::now())
    }
}

/// Hand-driven clock for deterministic lease and heartbeat tests.
#[derive(Clone, Debug)]
pub struct ManualClock {
    now: Arc<Mutex<DateTime<Utc>>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Arc::new(Mutex::new(start)),
        }
    }

    pub fn advance(&self, by: Duration) {
        let delta = chrono::Duration::from_std(by).unwrap_or_else(|_| chrono::Duration::days(36_500));
        let mut now = self.now.lock();
        *now += delta;
    }

    pub fn advance_ms(&self, ms: u64) {
        self.advance(Duration::from_millis(ms));
    }

    pub fn set(&self, to: DateTime<Utc>) {
        *self.now.lock() = to;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new(Utc::now())
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        truncate_ms(*self.now.lock())
    }
}

pub fn system_clock() -> Arc<dyn Clock> {
    Arc::new(SystemClock)
}

/// Render a timestamp as fixed-width RFC 3339 (millisecond precision, `Z`).
/// Fixed width keeps lexicographic order equal to chronological order,
/// which the store relies on for `expires_at < ?` comparisons.
pub fn format_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub fn parse_ts(raw: &str) -> Result<DateTime<Utc>, ValidationError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| ValidationError::new("timestamp", format!("not ISO-8601 ({raw}): {e}")))
}

/// Drop sub-millisecond precision.
pub fn truncate_ms(ts: DateTime<Utc>) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ts.timestamp_millis()).unwrap_or(ts)
}

/// Upper bound applied to TTL arithmetic (100 years).
const MAX_OFFSET_MS: u64 = 100 * 365 * 24 * 60 * 60 * 1000;

/// `ts + ms`, clamped instead of panicking on absurd TTLs.
pub fn add_ms(ts: DateTime<Utc>, ms: u64) -> DateTime<Utc> {
    let ms = i64::try_from(ms.min(MAX_OFFSET_MS)).unwrap_or(i64::MAX);
    ts.checked_add_signed(chrono::Duration::milliseconds(ms))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Milliseconds from `earlier` to `later`, clamped at zero.
pub fn elapsed_ms(earlier: DateTime<Utc>, later: DateTime<Utc>) -> u64 {
    u64::try_from((later - earlier).num_milliseconds()).unwrap_or(0)
}
