//! Errors shared by the storage collaborators.

use crate::pending::Ordinal;
use crate::request::RequestId;
use thiserror::Error;

/// Errors that can occur in a [`RequestRegistry`](crate::registry::RequestRegistry)
/// or [`PendingEventStore`](crate::pending::PendingEventStore).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PersistenceError {
    /// The request id was never created.
    #[error("Unknown request: {0}")]
    UnknownRequest(RequestId),

    /// Two pending events for the same request received the same ordinal.
    ///
    /// Only possible if enqueues for one request were not serialized.
    #[error("Ordinal collision for request {request_id} at ordinal {ordinal}")]
    OrdinalCollision {
        /// Request whose queue collided.
        request_id: RequestId,
        /// The duplicated ordinal.
        ordinal: Ordinal,
    },

    /// Database connection or query error.
    #[error("Database error: {0}")]
    Database(String),

    /// A stored value could not be mapped back to a domain type.
    #[error("Serialization error: {0}")]
    Serialization(String),
}
