//! Event trait and the serialized envelope that travels over the bus.
//!
//! Events are serialized with `bincode`. The envelope keeps the event type name
//! next to the bytes so a subscriber can route a message without decoding it,
//! and carries a partition key so that every message for one request lands on
//! the same partition.
//!
//! # Example
//!
//! ```
//! use failsafe_core::event::{Event, SerializedEvent};
//! use serde::{Serialize, Deserialize};
//!
//! #[derive(Clone, Debug, Serialize, Deserialize)]
//! struct Pinged { id: i64 }
//!
//! impl Event for Pinged {
//!     fn event_type(&self) -> &'static str { "Pinged.v1" }
//!     fn partition_key(&self) -> String { self.id.to_string() }
//! }
//!
//! let envelope = SerializedEvent::from_event(&Pinged { id: 3 }).unwrap();
//! assert_eq!(envelope.event_type, "Pinged.v1");
//! assert_eq!(envelope.key, "3");
//! ```

use serde::{Deserialize, Serialize, de::DeserializeOwned};
use std::fmt;
use thiserror::Error;

/// Error types for event encoding and decoding.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EventError {
    /// Failed to serialize event to bytes.
    #[error("Failed to serialize event: {0}")]
    SerializationError(String),

    /// Failed to deserialize event from bytes.
    #[error("Failed to deserialize event: {0}")]
    DeserializationError(String),

    /// The envelope names an event type this service does not know.
    #[error("Unknown event type: {0}")]
    UnknownEventType(String),
}

/// A message that can be published on the event bus.
///
/// # Event Naming Convention
///
/// `event_type()` returns a stable identifier with a version suffix
/// (`"RequestCreated.v1"`) so the schema can evolve.
pub trait Event: Send + Sync + 'static {
    /// Returns the event type identifier for this event.
    fn event_type(&self) -> &'static str;

    /// Partition key. Messages sharing a key keep their relative order on
    /// transports that partition by key.
    fn partition_key(&self) -> String;

    /// Serialize this event to bincode bytes.
    ///
    /// # Errors
    ///
    /// Returns `EventError::SerializationError` if the event cannot be serialized.
    fn to_bytes(&self) -> Result<Vec<u8>, EventError>
    where
        Self: Serialize,
    {
        bincode::serialize(self).map_err(|e| EventError::SerializationError(e.to_string()))
    }

    /// Deserialize an event from bincode bytes.
    ///
    /// # Errors
    ///
    /// Returns `EventError::DeserializationError` if the bytes are corrupted or
    /// were produced by a different event type.
    fn from_bytes(bytes: &[u8]) -> Result<Self, EventError>
    where
        Self: DeserializeOwned + Sized,
    {
        bincode::deserialize(bytes).map_err(|e| EventError::DeserializationError(e.to_string()))
    }
}

/// Wire envelope for a published event.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerializedEvent {
    /// The event type identifier (e.g., `"StatusChangeRequested.v1"`).
    pub event_type: String,

    /// Partition key (the request id for every event in this system).
    pub key: String,

    /// The bincode-serialized event data.
    pub data: Vec<u8>,
}

impl SerializedEvent {
    /// Create a new serialized event.
    #[must_use]
    pub const fn new(event_type: String, key: String, data: Vec<u8>) -> Self {
        Self {
            event_type,
            key,
            data,
        }
    }

    /// Build an envelope from a typed event.
    ///
    /// # Errors
    ///
    /// Returns `EventError::SerializationError` if the event cannot be serialized.
    pub fn from_event<E: Event + Serialize>(event: &E) -> Result<Self, EventError> {
        Ok(Self {
            event_type: event.event_type().to_string(),
            key: event.partition_key(),
            data: event.to_bytes()?,
        })
    }

    /// Decode the payload as `E`, checking the envelope's type name first.
    ///
    /// # Errors
    ///
    /// Returns `EventError::UnknownEventType` if the envelope carries another
    /// event type, or `EventError::DeserializationError` if the bytes are bad.
    pub fn decode<E: Event + DeserializeOwned>(&self, expected_type: &str) -> Result<E, EventError> {
        if self.event_type != expected_type {
            return Err(EventError::UnknownEventType(self.event_type.clone()));
        }
        E::from_bytes(&self.data)
    }
}

impl fmt::Display for SerializedEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "SerializedEvent {{ type: {}, key: {}, size: {} bytes }}",
            self.event_type,
            self.key,
            self.data.len()
        )
    }
}
