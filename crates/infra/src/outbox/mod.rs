//! Transactional outbox.
//!
//! Command handlers write an `OutboxMessage` in the same transaction as the
//! business change. `OutboxProcessor` instances later claim due messages,
//! dispatch them, and record the outcome. Delivery is at-least-once; an
//! idempotency key turns repeated intents into no-ops.
//!
//! A message is **due** when it is unprocessed, has failed fewer than
//! `max_attempts` times, and its `next_retry_at` (if any) has passed.

pub mod error;
pub mod message;
pub mod postgres;
pub mod processor;
pub mod retry;
pub mod store;

pub use error::{OutboxError, OutboxStoreError};
pub use message::{OutboxMessage, OutboxMessageParts};
pub use postgres::PostgresOutboxStore;
pub use processor::{CycleReport, DEFAULT_BATCH_SIZE, OutboxProcessor};
pub use retry::{DEFAULT_BASE_DELAY, DEFAULT_MAX_RETRY_ATTEMPTS, RetryPolicy};
pub use store::{DEFAULT_CLAIM_LEASE, InMemoryOutboxStore, OutboxStats, OutboxStore};
