//! Outbox processor: poll, claim, dispatch, record.

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use sprintforge_core::MessageId;
use sprintforge_events::{Dispatcher, EventSerializer};

use super::error::OutboxError;
use super::message::OutboxMessage;
use super::retry::RetryPolicy;
use super::store::OutboxStore;

/// Default number of messages claimed per cycle.
pub const DEFAULT_BATCH_SIZE: usize = 20;

/// What one `run_once` cycle did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct CycleReport {
    /// Messages claimed from the store.
    pub fetched: usize,
    /// Dispatched successfully.
    pub processed: usize,
    /// Skipped because their idempotency key was already delivered.
    pub duplicates: usize,
    /// Failed and rescheduled.
    pub retried: usize,
    /// Failed for the last time.
    pub exhausted: usize,
    /// Claimed but handed back because the cycle was cancelled.
    pub released: usize,
    pub cancelled: bool,
}

impl CycleReport {
    pub fn attempted(&self) -> usize {
        self.processed + self.duplicates + self.retried + self.exhausted
    }
}

/// Delivers due outbox messages.
///
/// Any number of processors may share one store; the store's claim contract
/// keeps them from working on the same message at the same time. Within one
/// processor messages are handled strictly in sequence, oldest first, and each
/// outcome is persisted before the next message is touched.
pub struct OutboxProcessor<S, Z, D> {
    store: S,
    serializer: Z,
    dispatcher: D,
    batch_size: usize,
    retry_policy: RetryPolicy,
    name: String,
}

impl<S, Z, D> OutboxProcessor<S, Z, D>
where
    S: OutboxStore,
    Z: EventSerializer,
    D: Dispatcher<Z::Event>,
{
    pub fn new(store: S, serializer: Z, dispatcher: D) -> Self {
        Self {
            store,
            serializer,
            dispatcher,
            batch_size: DEFAULT_BATCH_SIZE,
            retry_policy: RetryPolicy::default(),
            name: "outbox-processor".to_string(),
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry_policy
    }

    /// Run one poll-claim-dispatch-record cycle against the wall clock.
    ///
    /// Dispatch and deserialization failures are recorded on the message and
    /// never returned. A store failure aborts the cycle: the message it was
    /// working on keeps its previous state, and its claim and the claims on
    /// the rest of the batch are released so the next cycle picks them up.
    pub async fn run_once(&self, cancel: &CancellationToken) -> Result<CycleReport, OutboxError> {
        self.cycle(Utc::now(), Utc::now, cancel).await
    }

    /// Same as [`run_once`](Self::run_once) with every timestamp pinned to `now`.
    pub async fn run_once_at(
        &self,
        now: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Result<CycleReport, OutboxError> {
        self.cycle(now, || now, cancel).await
    }

    async fn cycle(
        &self,
        now: DateTime<Utc>,
        clock: impl Fn() -> DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Result<CycleReport, OutboxError> {
        let mut report = CycleReport::default();

        if cancel.is_cancelled() {
            report.cancelled = true;
            return Ok(report);
        }

        let batch = self.store.fetch_due(self.batch_size, now).await?;
        report.fetched = batch.len();
        if batch.is_empty() {
            return Ok(report);
        }
        debug!(processor = %self.name, fetched = batch.len(), "claimed outbox messages");

        let mut remaining = batch.into_iter();
        while let Some(mut message) = remaining.next() {
            if cancel.is_cancelled() {
                let mut unattempted: Vec<MessageId> = vec![message.id()];
                unattempted.extend(remaining.map(|m| m.id()));
                self.store.release(&unattempted).await?;
                report.released = unattempted.len();
                report.cancelled = true;
                info!(
                    processor = %self.name,
                    released = report.released,
                    "outbox cycle cancelled"
                );
                break;
            }

            if let Err(err) = self.process(&mut message, &clock, cancel, &mut report).await {
                let mut unclaimed: Vec<MessageId> = vec![message.id()];
                unclaimed.extend(remaining.map(|m| m.id()));
                if let Err(release_err) = self.store.release(&unclaimed).await {
                    warn!(
                        processor = %self.name,
                        error = %release_err,
                        count = unclaimed.len(),
                        "failed to release outbox claims after aborted cycle"
                    );
                }
                return Err(err);
            }
        }

        Ok(report)
    }

    async fn process(
        &self,
        message: &mut OutboxMessage,
        clock: &impl Fn() -> DateTime<Utc>,
        cancel: &CancellationToken,
        report: &mut CycleReport,
    ) -> Result<(), OutboxError> {
        if let Some(key) = message.idempotency_key().map(str::to_owned) {
            if let Some(original) = self.store.find_by_idempotency_key(&key).await? {
                if original.id() != message.id() {
                    message.mark_processed_at(clock())?;
                    self.store.save(message).await?;
                    report.duplicates += 1;
                    debug!(
                        processor = %self.name,
                        message_id = %message.id(),
                        original_id = %original.id(),
                        idempotency_key = %key,
                        "duplicate outbox message skipped"
                    );
                    return Ok(());
                }
            }
        }

        let outcome = match self
            .serializer
            .deserialize(message.event_type(), message.payload())
        {
            Ok(event) => self
                .dispatcher
                .dispatch(&event, cancel)
                .await
                .map_err(|e| e.to_string()),
            Err(e) => Err(e.to_string()),
        };

        match outcome {
            Ok(()) => {
                message.mark_processed_at(clock())?;
                self.store.save(message).await?;
                report.processed += 1;
                debug!(
                    processor = %self.name,
                    message_id = %message.id(),
                    event_type = message.event_type(),
                    "outbox message delivered"
                );
            }
            Err(reason) => {
                message.record_failure_at(reason, clock(), &self.retry_policy)?;
                self.store.save(message).await?;

                if self.retry_policy.should_retry(message.retry_count()) {
                    report.retried += 1;
                    warn!(
                        processor = %self.name,
                        message_id = %message.id(),
                        event_type = message.event_type(),
                        retry_count = message.retry_count(),
                        next_retry_at = ?message.next_retry_at(),
                        error = message.error().unwrap_or_default(),
                        "outbox delivery failed; will retry"
                    );
                } else {
                    report.exhausted += 1;
                    error!(
                        processor = %self.name,
                        message_id = %message.id(),
                        event_type = message.event_type(),
                        retry_count = message.retry_count(),
                        error = message.error().unwrap_or_default(),
                        "outbox delivery failed permanently"
                    );
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outbox::store::InMemoryOutboxStore;
    use async_trait::async_trait;
    use sprintforge_core::{ProjectId, UserId};
    use sprintforge_events::{DispatchError, JsonEventSerializer, ProjectEvent};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Counts dispatches and cancels `token` after the first one.
    struct CancelAfterFirst {
        calls: AtomicUsize,
        token: CancellationToken,
    }

    #[async_trait]
    impl Dispatcher<ProjectEvent> for CancelAfterFirst {
        async fn dispatch(
            &self,
            _event: &ProjectEvent,
            _cancel: &CancellationToken,
        ) -> Result<(), DispatchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.token.cancel();
            Ok(())
        }
    }

    struct AlwaysOk;

    #[async_trait]
    impl Dispatcher<ProjectEvent> for AlwaysOk {
        async fn dispatch(
            &self,
            _event: &ProjectEvent,
            _cancel: &CancellationToken,
        ) -> Result<(), DispatchError> {
            Ok(())
        }
    }

    fn project_created_message(created_at: DateTime<Utc>) -> OutboxMessage {
        let event = ProjectEvent::ProjectCreated {
            project_id: ProjectId::new(),
            name: "Apollo".to_string(),
            owner_id: UserId::new(),
            occurred_at: created_at,
        };
        let serializer = JsonEventSerializer::<ProjectEvent>::new();
        let stored = serializer.serialize(&event).unwrap();
        OutboxMessage::create_at(stored.event_type, stored.payload, None, created_at).unwrap()
    }

    #[tokio::test]
    async fn empty_store_yields_empty_report() {
        let processor = OutboxProcessor::new(
            InMemoryOutboxStore::arc(),
            JsonEventSerializer::<ProjectEvent>::new(),
            AlwaysOk,
        );

        let report = processor.run_once(&CancellationToken::new()).await.unwrap();

        assert_eq!(report, CycleReport::default());
    }

    #[tokio::test]
    async fn cancelled_token_claims_nothing() {
        let store = InMemoryOutboxStore::arc();
        let msg = project_created_message(Utc::now());
        store.insert(&msg).await.unwrap();
        let processor = OutboxProcessor::new(
            store.clone(),
            JsonEventSerializer::<ProjectEvent>::new(),
            AlwaysOk,
        );
        let token = CancellationToken::new();
        token.cancel();

        let report = processor.run_once(&token).await.unwrap();

        assert!(report.cancelled);
        assert_eq!(report.fetched, 0);
        assert_eq!(store.fetch_due(10, Utc::now()).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn cancellation_mid_batch_releases_the_rest() {
        let store = InMemoryOutboxStore::arc();
        let t0 = Utc::now() - chrono::Duration::minutes(1);
        for i in 0..3 {
            store
                .insert(&project_created_message(t0 + chrono::Duration::seconds(i)))
                .await
                .unwrap();
        }
        let token = CancellationToken::new();
        let dispatcher = Arc::new(CancelAfterFirst {
            calls: AtomicUsize::new(0),
            token: token.clone(),
        });
        let processor = OutboxProcessor::new(
            store.clone(),
            JsonEventSerializer::<ProjectEvent>::new(),
            dispatcher.clone(),
        );

        let report = processor.run_once(&token).await.unwrap();

        assert_eq!(dispatcher.calls.load(Ordering::SeqCst), 1);
        assert_eq!(report.fetched, 3);
        assert_eq!(report.processed, 1);
        assert_eq!(report.released, 2);
        assert!(report.cancelled);
        // Released messages are immediately claimable by the next cycle.
        assert_eq!(store.fetch_due(10, Utc::now()).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn batch_size_limits_one_cycle() {
        let store = InMemoryOutboxStore::arc();
        let t0 = Utc::now() - chrono::Duration::minutes(1);
        for i in 0..5 {
            store
                .insert(&project_created_message(t0 + chrono::Duration::seconds(i)))
                .await
                .unwrap();
        }
        let processor = OutboxProcessor::new(
            store.clone(),
            JsonEventSerializer::<ProjectEvent>::new(),
            AlwaysOk,
        )
        .with_batch_size(2);
        let token = CancellationToken::new();

        let first = processor.run_once(&token).await.unwrap();
        let second = processor.run_once(&token).await.unwrap();
        let third = processor.run_once(&token).await.unwrap();

        assert_eq!(first.processed, 2);
        assert_eq!(second.processed, 2);
        assert_eq!(third.processed, 1);
        assert_eq!(store.stats().await.unwrap().processed, 5);
    }
}
