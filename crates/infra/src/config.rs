//! Outbox configuration loading and representation.

use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use crate::outbox::{
    DEFAULT_BASE_DELAY, DEFAULT_BATCH_SIZE, DEFAULT_CLAIM_LEASE, DEFAULT_MAX_RETRY_ATTEMPTS,
    RetryPolicy,
};

pub const ENV_BATCH_SIZE: &str = "OUTBOX_BATCH_SIZE";
pub const ENV_MAX_RETRY_ATTEMPTS: &str = "OUTBOX_MAX_RETRY_ATTEMPTS";
pub const ENV_BASE_BACKOFF_SECS: &str = "OUTBOX_BASE_BACKOFF_SECS";
pub const ENV_POLL_INTERVAL_MS: &str = "OUTBOX_POLL_INTERVAL_MS";
pub const ENV_CLAIM_LEASE_SECS: &str = "OUTBOX_CLAIM_LEASE_SECS";
pub const ENV_DATABASE_URL: &str = "DATABASE_URL";

/// Default delay between processor cycles.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("invalid {key}={value:?}: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

/// Outbox processor and hosting-loop settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboxConfig {
    /// Messages claimed per cycle.
    pub batch_size: usize,
    /// Failed attempts before a message is abandoned.
    pub max_retry_attempts: u32,
    /// Backoff unit; the n-th failure waits `base_backoff * 2^n`.
    pub base_backoff: Duration,
    /// Delay between cycles of the hosting loop.
    pub poll_interval: Duration,
    /// How long a claimed message stays hidden from other processors.
    pub claim_lease: Duration,
    /// Postgres connection string; `None` selects the in-memory store.
    pub database_url: Option<String>,
}

impl Default for OutboxConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            max_retry_attempts: DEFAULT_MAX_RETRY_ATTEMPTS,
            base_backoff: DEFAULT_BASE_DELAY,
            poll_interval: DEFAULT_POLL_INTERVAL,
            claim_lease: DEFAULT_CLAIM_LEASE,
            database_url: None,
        }
    }
}

impl OutboxConfig {
    /// Read settings from the process environment. Unset keys keep their defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read settings through `lookup`, which returns the raw value of a key.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();

        Ok(Self {
            batch_size: parse_positive(&lookup, ENV_BATCH_SIZE)?.unwrap_or(defaults.batch_size),
            max_retry_attempts: parse_positive(&lookup, ENV_MAX_RETRY_ATTEMPTS)?
                .unwrap_or(defaults.max_retry_attempts),
            base_backoff: parse_positive(&lookup, ENV_BASE_BACKOFF_SECS)?
                .map(Duration::from_secs)
                .unwrap_or(defaults.base_backoff),
            poll_interval: parse_positive(&lookup, ENV_POLL_INTERVAL_MS)?
                .map(Duration::from_millis)
                .unwrap_or(defaults.poll_interval),
            claim_lease: parse_positive(&lookup, ENV_CLAIM_LEASE_SECS)?
                .map(Duration::from_secs)
                .unwrap_or(defaults.claim_lease),
            database_url: lookup(ENV_DATABASE_URL).filter(|url| !url.trim().is_empty()),
        })
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_max_retry_attempts(mut self, max: u32) -> Self {
        self.max_retry_attempts = max;
        self
    }

    pub fn with_base_backoff(mut self, base: Duration) -> Self {
        self.base_backoff = base;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_claim_lease(mut self, lease: Duration) -> Self {
        self.claim_lease = lease;
        self
    }

    pub fn with_database_url(mut self, url: impl Into<String>) -> Self {
        self.database_url = Some(url.into());
        self
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_retry_attempts, self.base_backoff)
    }
}

fn parse_positive<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
) -> Result<Option<T>, ConfigError>
where
    T: FromStr + PartialEq + Default,
    T::Err: std::fmt::Display,
{
    let Some(raw) = lookup(key) else {
        return Ok(None);
    };

    let value = raw.trim().parse::<T>().map_err(|e| ConfigError::Invalid {
        key,
        value: raw.clone(),
        reason: e.to_string(),
    })?;

    if value == T::default() {
        return Err(ConfigError::Invalid {
            key,
            value: raw,
            reason: "must be greater than zero".to_string(),
        });
    }

    Ok(Some(value))
}
