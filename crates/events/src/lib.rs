//! Domain events and the collaborators the outbox hands them to.
//!
//! - `Event`: what every domain event exposes (type name, schema version, business time)
//! - `domain`: the project-management events recorded by command handlers
//! - `serializer`: typed event <-> stored `(event_type, payload)` pair
//! - `dispatcher`: delivers a materialized event to its handlers

pub mod dispatcher;
pub mod domain;
pub mod event;
pub mod serializer;

pub use dispatcher::{DispatchError, Dispatcher, EventHandler, HandlerDispatcher};
pub use domain::{ProjectEvent, TaskStatus};
pub use event::Event;
pub use serializer::{EventSerializer, JsonEventSerializer, SerializationError, SerializedEvent};
