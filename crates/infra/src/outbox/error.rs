//! Outbox error model.
//!
//! Two layers: `OutboxStoreError` is whatever the persistence boundary reports,
//! `OutboxError` is what the processor surfaces to its host. Dispatch and
//! deserialization failures never appear here; they become retry state on the
//! message instead.

use sprintforge_core::{DomainError, MessageId};
use sprintforge_events::SerializationError;
use thiserror::Error;

/// Outbox store operation error.
#[derive(Debug, Clone, Error)]
pub enum OutboxStoreError {
    #[error("outbox message not found: {0}")]
    NotFound(MessageId),

    #[error("outbox message already exists: {0}")]
    AlreadyExists(MessageId),

    /// Only permanently failed, unprocessed messages can be requeued.
    #[error("outbox message cannot be requeued: {0}")]
    NotRequeueable(MessageId),

    #[error("storage error: {0}")]
    Storage(String),
}

impl From<sqlx::Error> for OutboxStoreError {
    fn from(err: sqlx::Error) -> Self {
        OutboxStoreError::Storage(err.to_string())
    }
}

#[derive(Debug, Error)]
pub enum OutboxError {
    /// Persisting or loading failed; the cycle is aborted.
    #[error(transparent)]
    Store(#[from] OutboxStoreError),

    /// `mark_processed`/`record_failure` on a message that is already terminal.
    #[error("outbox message already processed: {0}")]
    AlreadyProcessed(MessageId),

    #[error(transparent)]
    Domain(#[from] DomainError),

    /// Encoding a new event for the outbox failed (write side only).
    #[error(transparent)]
    Serialization(#[from] SerializationError),
}

impl OutboxError {
    /// Whether the hosting loop should expect the failure to clear on its own.
    pub fn is_store_failure(&self) -> bool {
        matches!(self, OutboxError::Store(_))
    }
}
