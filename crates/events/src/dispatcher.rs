//! Event dispatch (mechanics only).
//!
//! The outbox processor hands every materialized event to a `Dispatcher`. What
//! happens next (in-process handlers, a broker, an HTTP webhook) is the
//! dispatcher's business; the processor only cares whether it succeeded.
//!
//! Delivery is **at-least-once**: a handler may see the same event twice after a
//! crash or a lapsed claim, so handlers must be idempotent.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::Event;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DispatchError {
    #[error("handler {handler} failed: {reason}")]
    Handler { handler: String, reason: String },

    #[error("handler {handler} timed out after {after:?}")]
    Timeout { handler: String, after: Duration },
}

/// Delivers a materialized event.
///
/// The cancellation token is advisory: implementations may use it to abandon
/// long waits, but an outcome must still be returned so it can be recorded.
#[async_trait]
pub trait Dispatcher<E>: Send + Sync {
    async fn dispatch(&self, event: &E, cancel: &CancellationToken) -> Result<(), DispatchError>;
}

#[async_trait]
impl<E, D> Dispatcher<E> for Arc<D>
where
    E: Sync,
    D: Dispatcher<E> + ?Sized,
{
    async fn dispatch(&self, event: &E, cancel: &CancellationToken) -> Result<(), DispatchError> {
        (**self).dispatch(event, cancel).await
    }
}

/// Consumes one or more event types.
#[async_trait]
pub trait EventHandler<E>: Send + Sync {
    /// Handler name (used in errors and logs).
    fn name(&self) -> &str;

    async fn handle(&self, event: &E) -> anyhow::Result<()>;
}

/// Dispatcher that fans an event out to registered handlers, in registration order.
///
/// Handlers are registered against a pattern:
/// - exact type: `"project.task.assigned"`
/// - category: `"project.task.*"` matches every type starting with `project.task.`
/// - wildcard: `"*"`
///
/// The first failing handler aborts the dispatch; the whole event is retried
/// later, which is why handlers must tolerate replays. No matching handler is
/// not an error.
pub struct HandlerDispatcher<E> {
    handlers: Vec<(String, Arc<dyn EventHandler<E>>)>,
    timeout: Option<Duration>,
}

impl<E> HandlerDispatcher<E> {
    pub fn new() -> Self {
        Self {
            handlers: Vec::new(),
            timeout: None,
        }
    }

    /// Bound each handler invocation; an elapsed bound counts as a failure.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn register(&mut self, pattern: impl Into<String>, handler: Arc<dyn EventHandler<E>>) {
        self.handlers.push((pattern.into(), handler));
    }

    pub fn handler_count(&self) -> usize {
        self.handlers.len()
    }

    fn matching(&self, event_type: &str) -> Vec<&Arc<dyn EventHandler<E>>> {
        self.handlers
            .iter()
            .filter(|(pattern, _)| pattern_matches(pattern, event_type))
            .map(|(_, h)| h)
            .collect()
    }
}

impl<E> Default for HandlerDispatcher<E> {
    fn default() -> Self {
        Self::new()
    }
}

fn pattern_matches(pattern: &str, event_type: &str) -> bool {
    if pattern == "*" || pattern == event_type {
        return true;
    }
    match pattern.strip_suffix(".*") {
        Some(prefix) => event_type
            .strip_prefix(prefix)
            .is_some_and(|rest| rest.starts_with('.')),
        None => false,
    }
}

#[async_trait]
impl<E: Event> Dispatcher<E> for HandlerDispatcher<E> {
    async fn dispatch(&self, event: &E, _cancel: &CancellationToken) -> Result<(), DispatchError> {
        let event_type = event.event_type();
        let handlers = self.matching(event_type);

        if handlers.is_empty() {
            debug!(event_type, "no handler registered; treating as delivered");
            return Ok(());
        }

        for handler in handlers {
            let outcome = match self.timeout {
                Some(after) => match tokio::time::timeout(after, handler.handle(event)).await {
                    Ok(res) => res,
                    Err(_) => {
                        warn!(event_type, handler = handler.name(), ?after, "handler timed out");
                        return Err(DispatchError::Timeout {
                            handler: handler.name().to_string(),
                            after,
                        });
                    }
                },
                None => handler.handle(event).await,
            };

            if let Err(err) = outcome {
                return Err(DispatchError::Handler {
                    handler: handler.name().to_string(),
                    reason: format!("{err:#}"),
                });
            }
            debug!(event_type, handler = handler.name(), "handler completed");
        }

        Ok(())
    }
}
