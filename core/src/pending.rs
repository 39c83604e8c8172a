//! Pending events: status changes parked until their request's gate opens.
//!
//! Each request owns an ordered queue. Ordinals are assigned at enqueue time as
//! `1 + max(existing ordinals)` (or `0` for an empty queue) and are what the
//! replay uses to rebuild the original order.
//!
//! # Implementations
//!
//! - `PostgresPendingEventStore` (in `failsafe-postgres`)
//! - `InMemoryPendingEventStore` (in `failsafe-testing`)

use crate::event::EventError;
use crate::message::DeferredEvent;
use crate::persistence::PersistenceError;
use crate::request::RequestId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::pin::Pin;

/// Position of a pending event within its request's queue.
///
/// # Examples
///
/// ```
/// use failsafe_core::pending::Ordinal;
///
/// assert_eq!(Ordinal::after(None), Ordinal::new(0));
/// assert_eq!(Ordinal::after(Some(Ordinal::new(4))), Ordinal::new(5));
/// ```
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Ordinal(u64);

impl Ordinal {
    /// The ordinal given to the first event of an empty queue.
    pub const FIRST: Self = Self(0);

    /// Create a new `Ordinal`.
    #[must_use]
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    /// Get the raw value.
    #[must_use]
    pub const fn value(self) -> u64 {
        self.0
    }

    /// Ordinal for the next enqueue given the current maximum of the queue.
    #[must_use]
    pub const fn after(current_max: Option<Self>) -> Self {
        match current_max {
            Some(max) => Self(max.0 + 1),
            None => Self::FIRST,
        }
    }
}

impl fmt::Display for Ordinal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Closed tag describing how a stored payload is decoded.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PendingEventKind {
    /// Payload is a bincode-encoded `StatusChangeMessage`.
    StatusChange,
}

impl PendingEventKind {
    /// Convert to the storage representation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::StatusChange => "status_change",
        }
    }

    /// Parse from the storage representation.
    ///
    /// # Errors
    ///
    /// Returns `EventError::UnknownEventType` for tags this build does not know.
    pub fn parse(s: &str) -> Result<Self, EventError> {
        match s {
            "status_change" => Ok(Self::StatusChange),
            _ => Err(EventError::UnknownEventType(s.to_string())),
        }
    }
}

impl fmt::Display for PendingEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of a pending event: its request plus its ordinal.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PendingEventKey {
    /// Owning request.
    pub request_id: RequestId,
    /// Position in that request's queue.
    pub ordinal: Ordinal,
}

impl PendingEventKey {
    /// Create a new key.
    #[must_use]
    pub const fn new(request_id: RequestId, ordinal: Ordinal) -> Self {
        Self {
            request_id,
            ordinal,
        }
    }
}

impl fmt::Display for PendingEventKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.request_id, self.ordinal)
    }
}

/// Everything needed to park an event: what the store fills in is the ordinal
/// and the timestamp.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NewPendingEvent {
    /// Owning request.
    pub related_request_id: RequestId,
    /// Encoded event body.
    pub payload: Vec<u8>,
    /// How to decode `payload`.
    pub payload_kind: PendingEventKind,
    /// Topic to republish to on replay.
    pub destination_topic: String,
}

impl NewPendingEvent {
    /// Encode a deferred event for the given destination topic.
    ///
    /// # Errors
    ///
    /// Returns `EventError::SerializationError` if the event cannot be encoded.
    pub fn from_deferred(
        event: &DeferredEvent,
        destination_topic: impl Into<String>,
    ) -> Result<Self, EventError> {
        Ok(Self {
            related_request_id: event.request_id(),
            payload: event.encode()?,
            payload_kind: event.kind(),
            destination_topic: destination_topic.into(),
        })
    }
}

/// A stored, deferred event.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingEvent {
    /// Owning request (by id, not by reference).
    pub related_request_id: RequestId,
    /// Position in the request's queue.
    pub ordinal: Ordinal,
    /// Encoded event body.
    pub payload: Vec<u8>,
    /// How to decode `payload`.
    pub payload_kind: PendingEventKind,
    /// Topic to republish to on replay.
    pub destination_topic: String,
    /// When the event was parked. Informational only.
    pub enqueued_at: DateTime<Utc>,
}

impl PendingEvent {
    /// Identity of this event.
    #[must_use]
    pub const fn key(&self) -> PendingEventKey {
        PendingEventKey::new(self.related_request_id, self.ordinal)
    }

    /// Decode the payload back into a typed event.
    ///
    /// # Errors
    ///
    /// Returns `EventError::DeserializationError` if the payload is unreadable.
    pub fn decode(&self) -> Result<DeferredEvent, EventError> {
        DeferredEvent::decode(self.payload_kind, &self.payload)
    }
}

/// Durable per-request ordered queue of deferred events.
///
/// # Concurrency
///
/// Ordinal assignment in [`enqueue`](PendingEventStore::enqueue) is atomic with
/// respect to other enqueues for the same request. Enqueues for different
/// requests do not block each other.
///
/// # Dyn Compatibility
///
/// Methods return `Pin<Box<dyn Future>>` so the store can be shared as
/// `Arc<dyn PendingEventStore>`.
pub trait PendingEventStore: Send + Sync {
    /// Append an event to the back of its request's queue.
    ///
    /// # Errors
    ///
    /// - `OrdinalCollision`: concurrent enqueue produced a duplicate ordinal
    /// - `Database`: the storage engine failed
    fn enqueue(
        &self,
        event: NewPendingEvent,
    ) -> Pin<Box<dyn Future<Output = Result<PendingEvent, PersistenceError>> + Send + '_>>;

    /// Snapshot of one request's queue, ascending by ordinal.
    ///
    /// # Errors
    ///
    /// - `Database`: the storage engine failed
    fn list_ordered(
        &self,
        request_id: RequestId,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<PendingEvent>, PersistenceError>> + Send + '_>>;

    /// Whether the request has any pending event.
    ///
    /// # Errors
    ///
    /// - `Database`: the storage engine failed
    fn has_pending(
        &self,
        request_id: RequestId,
    ) -> Pin<Box<dyn Future<Output = Result<bool, PersistenceError>> + Send + '_>>;

    /// Delete one event. Removing an unknown or already removed key is a no-op.
    ///
    /// # Errors
    ///
    /// - `Database`: the storage engine failed
    fn remove(
        &self,
        key: PendingEventKey,
    ) -> Pin<Box<dyn Future<Output = Result<(), PersistenceError>> + Send + '_>>;

    /// Snapshot of every pending event, ordered by request then ordinal.
    ///
    /// # Errors
    ///
    /// - `Database`: the storage engine failed
    fn list_all(
        &self,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<PendingEvent>, PersistenceError>> + Send + '_>>;
}
