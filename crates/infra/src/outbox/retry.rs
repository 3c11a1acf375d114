//! Retry policy and backoff for failed deliveries.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Default cap on failed attempts before a message is abandoned.
pub const DEFAULT_MAX_RETRY_ATTEMPTS: u32 = 3;

/// Default backoff unit; the delay after the n-th failure is `unit * 2^n`.
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_secs(60);

// 2^20 minutes is roughly two years; anything beyond is indistinguishable from "never".
const MAX_BACKOFF_EXPONENT: u32 = 20;

/// Exponential backoff with a hard attempt cap.
///
/// With the defaults, the first failure schedules the next attempt 2 minutes
/// out, the second 4 minutes, the third 8 minutes, and after the third the
/// message is no longer due.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Failed attempts allowed before the message is permanently failed.
    pub max_attempts: u32,
    /// Backoff unit.
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_RETRY_ATTEMPTS,
            base_delay: DEFAULT_BASE_DELAY,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
        }
    }

    /// Delay to wait once `retry_count` failures have been recorded.
    ///
    /// `retry_count` is the already-incremented count: 1 after the first failure.
    pub fn delay_for_retry(&self, retry_count: u32) -> Duration {
        let factor = 2_u32.saturating_pow(retry_count.min(MAX_BACKOFF_EXPONENT));
        self.base_delay.saturating_mul(factor)
    }

    /// Earliest time the next attempt may happen after a failure at `failed_at`.
    pub fn next_retry_at(&self, failed_at: DateTime<Utc>, retry_count: u32) -> DateTime<Utc> {
        let delay = chrono::Duration::from_std(self.delay_for_retry(retry_count))
            .unwrap_or_else(|_| chrono::Duration::weeks(52 * 100));
        failed_at
            .checked_add_signed(delay)
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    /// Whether a message with `retry_count` failures may still be attempted.
    pub fn should_retry(&self, retry_count: u32) -> bool {
        retry_count < self.max_attempts
    }
}
