//! Outbox storage boundary and the in-memory implementation.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use sprintforge_core::MessageId;

use super::error::OutboxStoreError;
use super::message::OutboxMessage;
use super::retry::DEFAULT_MAX_RETRY_ATTEMPTS;

/// Default time a claimed message stays invisible to other processors.
pub const DEFAULT_CLAIM_LEASE: Duration = Duration::from_secs(60);

/// Outbox counters for operators.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct OutboxStats {
    /// Unprocessed and still retryable.
    pub pending: usize,
    pub processed: usize,
    /// Unprocessed with retries exhausted.
    pub failed: usize,
}

/// Persistence boundary for outbox messages.
///
/// Claiming contract: `fetch_due` hands each returned message to exactly one
/// caller until that caller `save`s or `release`s it, or until the claim lease
/// lapses. A processed row is write-once: saving over it keeps the original
/// `processed_at`.
#[async_trait]
pub trait OutboxStore: Send + Sync {
    /// Insert a new message.
    async fn insert(&self, message: &OutboxMessage) -> Result<(), OutboxStoreError>;

    /// Claim up to `limit` messages that are due at `now`, oldest first.
    async fn fetch_due(
        &self,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<OutboxMessage>, OutboxStoreError>;

    /// Persist the delivery state of a message and drop its claim.
    async fn save(&self, message: &OutboxMessage) -> Result<(), OutboxStoreError>;

    /// Drop the claim on messages that were fetched but not attempted.
    async fn release(&self, ids: &[MessageId]) -> Result<(), OutboxStoreError>;

    /// The processed message carrying `key`, if any.
    async fn find_by_idempotency_key(
        &self,
        key: &str,
    ) -> Result<Option<OutboxMessage>, OutboxStoreError>;

    async fn get(&self, id: MessageId) -> Result<Option<OutboxMessage>, OutboxStoreError>;

    async fn stats(&self) -> Result<OutboxStats, OutboxStoreError>;

    /// Permanently failed messages, oldest first.
    async fn list_failed(&self, limit: usize) -> Result<Vec<OutboxMessage>, OutboxStoreError>;

    /// Operator reset of a permanently failed message.
    async fn requeue(&self, id: MessageId) -> Result<OutboxMessage, OutboxStoreError>;
}

#[async_trait]
impl<S: OutboxStore + ?Sized> OutboxStore for Arc<S> {
    async fn insert(&self, message: &OutboxMessage) -> Result<(), OutboxStoreError> {
        (**self).insert(message).await
    }

    async fn fetch_due(
        &self,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<OutboxMessage>, OutboxStoreError> {
        (**self).fetch_due(limit, now).await
    }

    async fn save(&self, message: &OutboxMessage) -> Result<(), OutboxStoreError> {
        (**self).save(message).await
    }

    async fn release(&self, ids: &[MessageId]) -> Result<(), OutboxStoreError> {
        (**self).release(ids).await
    }

    async fn find_by_idempotency_key(
        &self,
        key: &str,
    ) -> Result<Option<OutboxMessage>, OutboxStoreError> {
        (**self).find_by_idempotency_key(key).await
    }

    async fn get(&self, id: MessageId) -> Result<Option<OutboxMessage>, OutboxStoreError> {
        (**self).get(id).await
    }

    async fn stats(&self) -> Result<OutboxStats, OutboxStoreError> {
        (**self).stats().await
    }

    async fn list_failed(&self, limit: usize) -> Result<Vec<OutboxMessage>, OutboxStoreError> {
        (**self).list_failed(limit).await
    }

    async fn requeue(&self, id: MessageId) -> Result<OutboxMessage, OutboxStoreError> {
        (**self).requeue(id).await
    }
}

#[derive(Debug, Default)]
struct Rows {
    messages: HashMap<MessageId, OutboxMessage>,
    /// Claim leases, keyed by message id.
    leases: HashMap<MessageId, DateTime<Utc>>,
}

/// In-memory outbox store.
///
/// Intended for tests/dev. Claiming happens under a single write lock, so two
/// processors sharing one store never receive the same message while its lease
/// is live.
#[derive(Debug)]
pub struct InMemoryOutboxStore {
    rows: RwLock<Rows>,
    max_retry_attempts: u32,
    claim_lease: Duration,
}

impl Default for InMemoryOutboxStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryOutboxStore {
    pub fn new() -> Self {
        Self {
            rows: RwLock::new(Rows::default()),
            max_retry_attempts: DEFAULT_MAX_RETRY_ATTEMPTS,
            claim_lease: DEFAULT_CLAIM_LEASE,
        }
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    pub fn with_max_retry_attempts(mut self, max: u32) -> Self {
        self.max_retry_attempts = max;
        self
    }

    pub fn with_claim_lease(mut self, lease: Duration) -> Self {
        self.claim_lease = lease;
        self
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, Rows>, OutboxStoreError> {
        self.rows
            .read()
            .map_err(|_| OutboxStoreError::Storage("lock poisoned".to_string()))
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, Rows>, OutboxStoreError> {
        self.rows
            .write()
            .map_err(|_| OutboxStoreError::Storage("lock poisoned".to_string()))
    }

    fn lease_until(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        chrono::Duration::from_std(self.claim_lease)
            .ok()
            .and_then(|lease| now.checked_add_signed(lease))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }
}

#[async_trait]
impl OutboxStore for InMemoryOutboxStore {
    async fn insert(&self, message: &OutboxMessage) -> Result<(), OutboxStoreError> {
        let mut rows = self.write()?;
        if rows.messages.contains_key(&message.id()) {
            return Err(OutboxStoreError::AlreadyExists(message.id()));
        }
        rows.messages.insert(message.id(), message.clone());
        Ok(())
    }

    async fn fetch_due(
        &self,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<OutboxMessage>, OutboxStoreError> {
        if limit == 0 {
            return Ok(vec![]);
        }

        let mut rows = self.write()?;
        let Rows { messages, leases } = &mut *rows;

        let mut due: Vec<&OutboxMessage> = messages
            .values()
            .filter(|m| m.is_due(now, self.max_retry_attempts))
            .filter(|m| leases.get(&m.id()).is_none_or(|until| *until <= now))
            .collect();
        due.sort_by_key(|m| (m.created_at(), m.id()));
        due.truncate(limit);

        let claimed: Vec<OutboxMessage> = due.into_iter().cloned().collect();
        let until = self.lease_until(now);
        for m in &claimed {
            leases.insert(m.id(), until);
        }

        Ok(claimed)
    }

    async fn save(&self, message: &OutboxMessage) -> Result<(), OutboxStoreError> {
        let mut rows = self.write()?;
        let stored = rows
            .messages
            .get_mut(&message.id())
            .ok_or(OutboxStoreError::NotFound(message.id()))?;
        stored.apply_delivery_state(message);
        rows.leases.remove(&message.id());
        Ok(())
    }

    async fn release(&self, ids: &[MessageId]) -> Result<(), OutboxStoreError> {
        let mut rows = self.write()?;
        for id in ids {
            rows.leases.remove(id);
        }
        Ok(())
    }

    async fn find_by_idempotency_key(
        &self,
        key: &str,
    ) -> Result<Option<OutboxMessage>, OutboxStoreError> {
        let rows = self.read()?;
        Ok(rows
            .messages
            .values()
            .filter(|m| m.is_processed() && m.idempotency_key() == Some(key))
            .min_by_key(|m| (m.processed_at(), m.id()))
            .cloned())
    }

    async fn get(&self, id: MessageId) -> Result<Option<OutboxMessage>, OutboxStoreError> {
        Ok(self.read()?.messages.get(&id).cloned())
    }

    async fn stats(&self) -> Result<OutboxStats, OutboxStoreError> {
        let rows = self.read()?;
        let mut stats = OutboxStats::default();
        for m in rows.messages.values() {
            if m.is_processed() {
                stats.processed += 1;
            } else if m.is_exhausted(self.max_retry_attempts) {
                stats.failed += 1;
            } else {
                stats.pending += 1;
            }
        }
        Ok(stats)
    }

    async fn list_failed(&self, limit: usize) -> Result<Vec<OutboxMessage>, OutboxStoreError> {
        let rows = self.read()?;
        let mut failed: Vec<_> = rows
            .messages
            .values()
            .filter(|m| m.is_exhausted(self.max_retry_attempts))
            .cloned()
            .collect();
        failed.sort_by_key(|m| (m.created_at(), m.id()));
        failed.truncate(limit);
        Ok(failed)
    }

    async fn requeue(&self, id: MessageId) -> Result<OutboxMessage, OutboxStoreError> {
        let mut rows = self.write()?;
        let max = self.max_retry_attempts;
        let message = rows
            .messages
            .get_mut(&id)
            .ok_or(OutboxStoreError::NotFound(id))?;
        if !message.is_exhausted(max) {
            return Err(OutboxStoreError::NotRequeueable(id));
        }
        message.reset_for_requeue();
        let requeued = message.clone();
        rows.leases.remove(&id);
        Ok(requeued)
    }
}
