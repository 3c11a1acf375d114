//! The outbox message: an intent to publish plus its delivery state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use sprintforge_core::{DomainError, DomainResult, Entity, MessageId};
use sprintforge_events::EventSerializer;

use super::error::OutboxError;
use super::retry::RetryPolicy;

/// Unit of reliable delivery.
///
/// `event_type`, `payload`, `idempotency_key` and `created_at` never change
/// after creation. The delivery fields (`processed_at`, `retry_count`,
/// `next_retry_at`, `error`) only move through the transitions below.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboxMessage {
    id: MessageId,
    event_type: String,
    payload: Vec<u8>,
    idempotency_key: Option<String>,
    created_at: DateTime<Utc>,

    processed_at: Option<DateTime<Utc>>,
    retry_count: u32,
    next_retry_at: Option<DateTime<Utc>>,
    error: Option<String>,
}

/// Raw column values, used by stores to rebuild a message.
#[derive(Debug, Clone)]
pub struct OutboxMessageParts {
    pub id: MessageId,
    pub event_type: String,
    pub payload: Vec<u8>,
    pub idempotency_key: Option<String>,
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    pub retry_count: u32,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl OutboxMessage {
    /// Create a pending message stamped with the current time.
    pub fn create(
        event_type: impl Into<String>,
        payload: Vec<u8>,
        idempotency_key: Option<String>,
    ) -> DomainResult<Self> {
        Self::create_at(event_type, payload, idempotency_key, Utc::now())
    }

    /// Create a pending message with an explicit creation time.
    pub fn create_at(
        event_type: impl Into<String>,
        payload: Vec<u8>,
        idempotency_key: Option<String>,
        created_at: DateTime<Utc>,
    ) -> DomainResult<Self> {
        let event_type = event_type.into();
        if event_type.trim().is_empty() {
            return Err(DomainError::validation("outbox event_type must not be empty"));
        }
        if idempotency_key.as_deref().is_some_and(|k| k.trim().is_empty()) {
            return Err(DomainError::validation(
                "outbox idempotency_key must not be blank when present",
            ));
        }

        Ok(Self {
            id: MessageId::new(),
            event_type,
            payload,
            idempotency_key,
            created_at,
            processed_at: None,
            retry_count: 0,
            next_retry_at: None,
            error: None,
        })
    }

    /// Serialize a typed event and wrap it in a pending message.
    pub fn from_event<S: EventSerializer>(
        serializer: &S,
        event: &S::Event,
        idempotency_key: Option<String>,
    ) -> Result<Self, OutboxError> {
        let serialized = serializer.serialize(event)?;
        Ok(Self::create(
            serialized.event_type,
            serialized.payload,
            idempotency_key,
        )?)
    }

    /// Rebuild a message from stored columns (no validation, no defaults).
    pub fn from_parts(parts: OutboxMessageParts) -> Self {
        Self {
            id: parts.id,
            event_type: parts.event_type,
            payload: parts.payload,
            idempotency_key: parts.idempotency_key,
            created_at: parts.created_at,
            processed_at: parts.processed_at,
            retry_count: parts.retry_count,
            next_retry_at: parts.next_retry_at,
            error: parts.error,
        }
    }

    pub fn id(&self) -> MessageId {
        self.id
    }

    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn idempotency_key(&self) -> Option<&str> {
        self.idempotency_key.as_deref()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn processed_at(&self) -> Option<DateTime<Utc>> {
        self.processed_at
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    pub fn next_retry_at(&self) -> Option<DateTime<Utc>> {
        self.next_retry_at
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    /// Mark delivered now.
    pub fn mark_processed(&mut self) -> Result<(), OutboxError> {
        self.mark_processed_at(Utc::now())
    }

    /// Mark delivered at `now`. Processing twice is a caller bug.
    pub fn mark_processed_at(&mut self, now: DateTime<Utc>) -> Result<(), OutboxError> {
        if self.is_processed() {
            return Err(OutboxError::AlreadyProcessed(self.id));
        }
        self.processed_at = Some(now);
        Ok(())
    }

    /// Record a failed attempt now, using the default retry policy.
    pub fn record_failure(&mut self, error: impl Into<String>) -> Result<(), OutboxError> {
        self.record_failure_at(error, Utc::now(), &RetryPolicy::default())
    }

    /// Record a failed attempt at `now`.
    ///
    /// Increments `retry_count` first, then schedules the next attempt from the
    /// new count: `now + base * 2^retry_count`.
    pub fn record_failure_at(
        &mut self,
        error: impl Into<String>,
        now: DateTime<Utc>,
        policy: &RetryPolicy,
    ) -> Result<(), OutboxError> {
        if self.is_processed() {
            return Err(OutboxError::AlreadyProcessed(self.id));
        }
        self.retry_count = self.retry_count.saturating_add(1);
        self.error = Some(error.into());
        self.next_retry_at = Some(policy.next_retry_at(now, self.retry_count));
        Ok(())
    }

    pub fn is_processed(&self) -> bool {
        self.processed_at.is_some()
    }

    /// Failed often enough that no further attempt will be made.
    pub fn is_exhausted(&self, max_retry_attempts: u32) -> bool {
        !self.is_processed() && self.retry_count >= max_retry_attempts
    }

    pub fn is_terminal(&self, max_retry_attempts: u32) -> bool {
        self.is_processed() || self.is_exhausted(max_retry_attempts)
    }

    /// Eligible for a delivery attempt at `now`.
    pub fn is_due(&self, now: DateTime<Utc>, max_retry_attempts: u32) -> bool {
        !self.is_processed()
            && self.retry_count < max_retry_attempts
            && self.next_retry_at.is_none_or(|at| at <= now)
    }

    /// Copy the delivery state of `other` (same id) onto `self`.
    ///
    /// Stores use this so an update can never rewrite the immutable fields, and
    /// so a processed row stays exactly as it was first recorded.
    pub(crate) fn apply_delivery_state(&mut self, other: &OutboxMessage) {
        debug_assert_eq!(self.id, other.id);
        if self.is_processed() {
            return;
        }
        self.processed_at = other.processed_at;
        self.retry_count = other.retry_count;
        self.next_retry_at = other.next_retry_at;
        self.error = other.error.clone();
    }

    /// Operator requeue of a permanently failed message.
    pub(crate) fn reset_for_requeue(&mut self) {
        self.retry_count = 0;
        self.next_retry_at = None;
        self.error = None;
    }
}

impl Entity for OutboxMessage {
    type Id = MessageId;

    fn id(&self) -> &MessageId {
        &self.id
    }

    fn kind() -> &'static str {
        "outbox_message"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    const MAX: u32 = 3;

    fn pending() -> OutboxMessage {
        OutboxMessage::create("project.created", b"{}".to_vec(), None).unwrap()
    }

    #[test]
    fn create_starts_pending_and_due() {
        let msg = pending();

        assert_eq!(msg.retry_count(), 0);
        assert!(msg.processed_at().is_none());
        assert!(msg.next_retry_at().is_none());
        assert!(msg.error().is_none());
        assert!(msg.is_due(Utc::now(), MAX));
        assert!(!msg.is_terminal(MAX));
    }

    #[test]
    fn create_rejects_empty_event_type_and_blank_key() {
        assert!(OutboxMessage::create("  ", vec![], None).is_err());
        assert!(OutboxMessage::create("project.created", vec![], Some(" ".into())).is_err());
    }

    #[test]
    fn mark_processed_is_terminal_and_not_repeatable() {
        let mut msg = pending();
        msg.mark_processed().unwrap();

        assert!(msg.is_processed());
        assert!(msg.is_terminal(MAX));
        assert!(!msg.is_due(Utc::now() + Duration::days(1), MAX));

        let err = msg.mark_processed().unwrap_err();
        assert!(matches!(err, OutboxError::AlreadyProcessed(id) if id == msg.id()));
    }

    #[test]
    fn record_failure_backs_off_from_post_increment_count() {
        let policy = RetryPolicy::default();
        let mut msg = pending();
        let t0 = Utc::now();

        msg.record_failure_at("smtp down", t0, &policy).unwrap();
        assert_eq!(msg.retry_count(), 1);
        assert_eq!(msg.error(), Some("smtp down"));
        assert_eq!(msg.next_retry_at(), Some(t0 + Duration::minutes(2)));
        assert!(!msg.is_due(t0 + Duration::minutes(1), MAX));
        assert!(msg.is_due(t0 + Duration::minutes(2), MAX));

        let t1 = t0 + Duration::minutes(2);
        msg.record_failure_at("smtp still down", t1, &policy).unwrap();
        assert_eq!(msg.retry_count(), 2);
        assert_eq!(msg.error(), Some("smtp still down"));
        assert_eq!(msg.next_retry_at(), Some(t1 + Duration::minutes(4)));

        let t2 = t1 + Duration::minutes(4);
        msg.record_failure_at("gave up", t2, &policy).unwrap();
        assert_eq!(msg.retry_count(), 3);
        assert_eq!(msg.next_retry_at(), Some(t2 + Duration::minutes(8)));
        assert!(msg.is_exhausted(MAX));
        assert!(!msg.is_due(t2 + Duration::days(365), MAX));
    }

    #[test]
    fn record_failure_after_processing_is_rejected() {
        let mut msg = pending();
        msg.mark_processed().unwrap();

        assert!(msg.record_failure("late").is_err());
        assert_eq!(msg.retry_count(), 0);
    }

    #[test]
    fn entity_identity_matches_message_id() {
        let msg = pending();

        assert_eq!(Entity::id(&msg), &msg.id());
        assert_eq!(<OutboxMessage as Entity>::kind(), "outbox_message");
    }

    #[test]
    fn delivery_state_of_processed_row_is_write_once() {
        let mut stored = pending();
        let first = Utc::now();
        stored.mark_processed_at(first).unwrap();

        let mut racer = stored.clone();
        racer.processed_at = Some(first + Duration::seconds(5));
        stored.apply_delivery_state(&racer);

        assert_eq!(stored.processed_at(), Some(first));
    }
}
