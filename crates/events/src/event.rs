use chrono::{DateTime, Utc};

/// A domain event.
///
/// Events are facts: immutable once recorded, versioned for schema evolution,
/// and identified by a stable type name that the outbox stores next to the payload.
pub trait Event: Clone + core::fmt::Debug + Send + Sync + 'static {
    /// Stable event name/type identifier (e.g. "project.task.assigned").
    fn event_type(&self) -> &'static str;

    /// Schema version for this event type.
    fn version(&self) -> u32;

    /// When the event occurred (business time).
    fn occurred_at(&self) -> DateTime<Utc>;
}
