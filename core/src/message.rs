//! Messages exchanged over the transport and the closed set of deferrable events.

use crate::event::{Event, EventError};
use crate::pending::{Ordinal, PendingEventKind};
use crate::request::{CorrelationId, RequestId, RequestStatus};
use serde::{Deserialize, Serialize};

/// "Request created or retried" message, published on the creation topic.
///
/// The same message is redelivered by the transport when processing fails, so
/// receivers see it once per attempt.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestMessage {
    /// Request id.
    pub id: RequestId,
    /// Correlation id proposed by the processor, if any.
    pub correlation_id: Option<CorrelationId>,
    /// Status at creation time.
    pub status: RequestStatus,
}

impl RequestMessage {
    /// Event type name on the wire.
    pub const EVENT_TYPE: &'static str = "RequestCreated.v1";

    /// Creation message for a brand new request.
    #[must_use]
    pub const fn created(id: RequestId) -> Self {
        Self {
            id,
            correlation_id: None,
            status: RequestStatus::New,
        }
    }

    /// Attach a correlation id.
    #[must_use]
    pub fn with_correlation(mut self, correlation_id: CorrelationId) -> Self {
        self.correlation_id = Some(correlation_id);
        self
    }
}

impl Event for RequestMessage {
    fn event_type(&self) -> &'static str {
        Self::EVENT_TYPE
    }

    fn partition_key(&self) -> String {
        self.id.to_string()
    }
}

/// "Status change requested" message, published on the status-change topic.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusChangeMessage {
    /// Target request.
    pub id: RequestId,
    /// Requested status.
    pub new_status: RequestStatus,
    /// Queue position this change held before it was republished by a replay.
    /// `None` for changes coming straight from a requester.
    pub replayed_from: Option<Ordinal>,
}

impl StatusChangeMessage {
    /// Event type name on the wire.
    pub const EVENT_TYPE: &'static str = "StatusChangeRequested.v1";

    /// Create a status change message.
    #[must_use]
    pub const fn new(id: RequestId, new_status: RequestStatus) -> Self {
        Self {
            id,
            new_status,
            replayed_from: None,
        }
    }

    /// Mark the change as republished from queue position `ordinal`.
    #[must_use]
    pub fn with_replay_origin(mut self, ordinal: Ordinal) -> Self {
        self.replayed_from = Some(ordinal);
        self
    }
}

impl Event for StatusChangeMessage {
    fn event_type(&self) -> &'static str {
        Self::EVENT_TYPE
    }

    fn partition_key(&self) -> String {
        self.id.to_string()
    }
}

/// Every kind of event that can be parked in the pending store.
///
/// Each variant maps one-to-one onto a [`PendingEventKind`] tag, and decoding
/// is driven by that tag rather than by a type name resolved at runtime.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DeferredEvent {
    /// A status change that arrived while its request's gate was closed.
    StatusChange(StatusChangeMessage),
}

impl DeferredEvent {
    /// Tag stored next to the payload.
    #[must_use]
    pub const fn kind(&self) -> PendingEventKind {
        match self {
            Self::StatusChange(_) => PendingEventKind::StatusChange,
        }
    }

    /// Request this event belongs to.
    #[must_use]
    pub const fn request_id(&self) -> RequestId {
        match self {
            Self::StatusChange(message) => message.id,
        }
    }

    /// Encode the payload for storage.
    ///
    /// # Errors
    ///
    /// Returns `EventError::SerializationError` if encoding fails.
    pub fn encode(&self) -> Result<Vec<u8>, EventError> {
        match self {
            Self::StatusChange(message) => message.to_bytes(),
        }
    }

    /// Rebuild an event from its stored tag and payload.
    ///
    /// # Errors
    ///
    /// Returns `EventError::DeserializationError` if the payload does not decode
    /// as the type named by `kind`.
    pub fn decode(kind: PendingEventKind, payload: &[u8]) -> Result<Self, EventError> {
        match kind {
            PendingEventKind::StatusChange => {
                StatusChangeMessage::from_bytes(payload).map(Self::StatusChange)
            },
        }
    }

    /// The same event, stamped with the queue position it is republished from.
    #[must_use]
    pub fn into_replay(self, ordinal: Ordinal) -> Self {
        match self {
            Self::StatusChange(message) => Self::StatusChange(message.with_replay_origin(ordinal)),
        }
    }

    /// Wire event type used when the event is republished.
    #[must_use]
    pub const fn event_type(&self) -> &'static str {
        match self {
            Self::StatusChange(_) => StatusChangeMessage::EVENT_TYPE,
        }
    }
}
