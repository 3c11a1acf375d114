//! Event serialization boundary.
//!
//! The outbox stores an opaque payload next to a type name. A serializer is the
//! only component that knows how the two map back to a typed event.

use std::marker::PhantomData;

use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;

use crate::Event;

/// A typed event flattened for storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerializedEvent {
    pub event_type: String,
    pub payload: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum SerializationError {
    #[error("failed to encode {event_type}: {reason}")]
    Encode { event_type: String, reason: String },

    #[error("failed to decode {event_type}: {reason}")]
    Decode { event_type: String, reason: String },

    /// The payload decoded, but into a different event than the stored type names.
    #[error("event type mismatch: stored={stored}, decoded={decoded}")]
    TypeMismatch { stored: String, decoded: String },
}

/// Converts typed events to and from stored payloads.
pub trait EventSerializer: Send + Sync {
    type Event: Event;

    fn serialize(&self, event: &Self::Event) -> Result<SerializedEvent, SerializationError>;

    fn deserialize(
        &self,
        event_type: &str,
        payload: &[u8],
    ) -> Result<Self::Event, SerializationError>;
}

/// JSON serializer for any serde-enabled event type.
///
/// Deserialization is strict about the stored type name: a payload that decodes
/// into a different variant than `event_type` is rejected rather than dispatched
/// under the wrong name.
#[derive(Debug)]
pub struct JsonEventSerializer<E> {
    _marker: PhantomData<fn() -> E>,
}

impl<E> JsonEventSerializer<E> {
    pub fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<E> Default for JsonEventSerializer<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> Clone for JsonEventSerializer<E> {
    fn clone(&self) -> Self {
        Self::new()
    }
}

impl<E> EventSerializer for JsonEventSerializer<E>
where
    E: Event + Serialize + DeserializeOwned,
{
    type Event = E;

    fn serialize(&self, event: &E) -> Result<SerializedEvent, SerializationError> {
        let event_type = event.event_type();
        let payload = serde_json::to_vec(event).map_err(|e| SerializationError::Encode {
            event_type: event_type.to_string(),
            reason: e.to_string(),
        })?;

        Ok(SerializedEvent {
            event_type: event_type.to_string(),
            payload,
        })
    }

    fn deserialize(&self, event_type: &str, payload: &[u8]) -> Result<E, SerializationError> {
        let event: E = serde_json::from_slice(payload).map_err(|e| SerializationError::Decode {
            event_type: event_type.to_string(),
            reason: e.to_string(),
        })?;

        if event.event_type() != event_type {
            return Err(SerializationError::TypeMismatch {
                stored: event_type.to_string(),
                decoded: event.event_type().to_string(),
            });
        }

        Ok(event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ProjectEvent;
    use chrono::Utc;
    use sprintforge_core::{ProjectId, UserId};

    fn project_created() -> ProjectEvent {
        ProjectEvent::ProjectCreated {
            project_id: ProjectId::new(),
            name: "Apollo".to_string(),
            owner_id: UserId::new(),
            occurred_at: Utc::now(),
        }
    }

    #[test]
    fn serialize_records_the_event_type() {
        let serializer = JsonEventSerializer::<ProjectEvent>::new();
        let ev = project_created();

        let stored = serializer.serialize(&ev).unwrap();

        assert_eq!(stored.event_type, "project.created");
        let decoded = serializer
            .deserialize(&stored.event_type, &stored.payload)
            .unwrap();
        assert_eq!(decoded, ev);
    }

    #[test]
    fn garbage_payload_is_a_decode_error() {
        let serializer = JsonEventSerializer::<ProjectEvent>::new();

        let err = serializer
            .deserialize("project.created", b"{not json")
            .unwrap_err();

        assert!(matches!(err, SerializationError::Decode { .. }));
    }

    #[test]
    fn mismatched_type_name_is_rejected() {
        let serializer = JsonEventSerializer::<ProjectEvent>::new();
        let stored = serializer.serialize(&project_created()).unwrap();

        let err = serializer
            .deserialize("project.sprint.started", &stored.payload)
            .unwrap_err();

        match err {
            SerializationError::TypeMismatch { stored, decoded } => {
                assert_eq!(stored, "project.sprint.started");
                assert_eq!(decoded, "project.created");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
