//! Identity that survives state transitions.

/// Anything persisted and later updated by id (outbox rows, tasks, sprints).
pub trait Entity {
    type Id: Clone + Eq + core::hash::Hash + core::fmt::Debug + core::fmt::Display;

    fn id(&self) -> &Self::Id;

    /// Stable label used in logs and error messages (e.g. `"outbox_message"`).
    fn kind() -> &'static str
    where
        Self: Sized;
}
