//! Bounded retry for store writes that hit transient SQLite faults.

use std::time::Duration;

use rand::Rng;
use tracing::warn;

use crate::error::StoreError;

const JITTER_FACTOR: f64 = 0.2;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 25,
            max_delay_ms: 500,
        }
    }
}

impl RetryPolicy {
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }
}

/// `min(max, base * 2^attempt)` scaled by `1 ± jitter`, with `random` in `[0, 1)`.
#[must_use]
#[allow(
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss
)]
pub fn backoff_delay_ms(attempt: u32, policy: &RetryPolicy, random: f64) -> u64 {
    let exponential = policy.base_delay_ms.saturating_mul(1u64 << attempt.min(31));
    let capped = exponential.min(policy.max_delay_ms);
    let jitter = 1.0 + (random * 2.0 - 1.0) * JITTER_FACTOR;
    ((capped as f64) * jitter).round().max(0.0) as u64
}

/// Run `op` until it succeeds, fails with a non-retryable error, or the
/// attempt budget is spent. Blocks the calling thread between attempts.
pub fn with_retry<T, F>(policy: &RetryPolicy, op_name: &str, mut op: F) -> Result<T, StoreError>
where
    F: FnMut() -> Result<T, StoreError>,
{
    let attempts = policy.max_attempts.max(1);
    let mut attempt = 0;
    loop {
        match op() {
            Ok(value) => return Ok(value),
            Err(err) if err.is_retryable() && attempt + 1 < attempts => {
                let delay = backoff_delay_ms(attempt, policy, rand::thread_rng().gen::<f64>());
                warn!(
                    op = op_name,
                    attempt = attempt + 1,
                    delay_ms = delay,
                    error = %err,
                    "retrying store operation"
                );
                std::thread::sleep(Duration::from_millis(delay));
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    fn fast() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            base_delay_ms: 1,
            max_delay_ms: 2,
        }
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = RetryPolicy::default();
        assert_eq!(backoff_delay_ms(0, &policy, 0.5), 25);
        assert_eq!(backoff_delay_ms(1, &policy, 0.5), 50);
        assert_eq!(backoff_delay_ms(10, &policy, 0.5), 500);
    }

    #[test]
    fn backoff_jitter_bounds() {
        let policy = RetryPolicy::default();
        assert_eq!(backoff_delay_ms(0, &policy, 0.0), 20);
        assert!(backoff_delay_ms(0, &policy, 0.999) <= 30);
    }

    #[test]
    fn retries_storage_errors_until_success() {
        let calls = Cell::new(0);
        let result = with_retry(&fast(), "test", || {
            calls.set(calls.get() + 1);
            if calls.get() < 3 {
                Err(StoreError::Storage("database is locked".into()))
            } else {
                Ok(7)
            }
        });
        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.get(), 3);
    }

    #[test]
    fn gives_up_after_budget() {
        let calls = Cell::new(0);
        let result: Result<(), _> = with_retry(&fast(), "test", || {
            calls.set(calls.get() + 1);
            Err(StoreError::Storage("disk I/O error".into()))
        });
        assert!(matches!(result, Err(StoreError::Storage(_))));
        assert_eq!(calls.get(), 3);
    }

    #[test]
    fn does_not_retry_conflicts() {
        let calls = Cell::new(0);
        let result: Result<(), _> = with_retry(&fast(), "test", || {
            calls.set(calls.get() + 1);
            Err(StoreError::Conflict("dup".into()))
        });
        assert!(matches!(result, Err(StoreError::Conflict(_))));
        assert_eq!(calls.get(), 1);
    }
}
