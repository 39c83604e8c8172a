//! Caller-facing error taxonomy of the engine.

use failsafe_core::event::EventError;
use failsafe_core::event_bus::EventBusError;
use failsafe_core::pending::Ordinal;
use failsafe_core::persistence::PersistenceError;
use failsafe_core::request::RequestId;
use thiserror::Error;

/// Errors returned by the orchestrator and the correlation gate.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FailSafeError {
    /// The request id was never created. Nothing was written.
    #[error("Unknown request: {0}")]
    UnknownRequest(RequestId),

    /// The request processor is switched off. The delivery should be retried.
    #[error("Request processing is currently disabled")]
    ProcessingDisabled,

    /// Two pending events got the same ordinal: enqueues were not serialized.
    #[error("Ordinal collision for request {request_id} at ordinal {ordinal}")]
    OrdinalCollision {
        /// Request whose queue collided.
        request_id: RequestId,
        /// The duplicated ordinal.
        ordinal: Ordinal,
    },

    /// The transport rejected a publish.
    #[error("Publish failed: {0}")]
    Publish(#[from] EventBusError),

    /// A message or stored payload could not be encoded or decoded.
    #[error("Serialization failed: {0}")]
    Deserialization(#[from] EventError),

    /// The storage engine failed.
    #[error("Persistence failed: {0}")]
    Persistence(String),
}

impl FailSafeError {
    /// Whether redelivering the same inbound message can succeed later.
    ///
    /// Unknown requests, collisions and undecodable messages fail the same way
    /// every time.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::ProcessingDisabled | Self::Publish(_) | Self::Persistence(_)
        )
    }
}

impl From<PersistenceError> for FailSafeError {
    fn from(error: PersistenceError) -> Self {
        match error {
            PersistenceError::UnknownRequest(id) => Self::UnknownRequest(id),
            PersistenceError::OrdinalCollision {
                request_id,
                ordinal,
            } => Self::OrdinalCollision {
                request_id,
                ordinal,
            },
            PersistenceError::Database(message) | PersistenceError::Serialization(message) => {
                Self::Persistence(message)
            },
        }
    }
}

/// Convenient result alias.
pub type Result<T> = std::result::Result<T, FailSafeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn persistence_errors_map_onto_the_taxonomy() {
        assert_eq!(
            FailSafeError::from(PersistenceError::UnknownRequest(RequestId::new(9))),
            FailSafeError::UnknownRequest(RequestId::new(9))
        );
        assert_eq!(
            FailSafeError::from(PersistenceError::Database("down".to_string())),
            FailSafeError::Persistence("down".to_string())
        );
    }

    #[test]
    fn only_transient_errors_are_retryable() {
        assert!(FailSafeError::ProcessingDisabled.is_retryable());
        assert!(FailSafeError::Persistence("timeout".to_string()).is_retryable());
        assert!(!FailSafeError::UnknownRequest(RequestId::new(1)).is_retryable());
        assert!(
            !FailSafeError::Deserialization(EventError::DeserializationError("bad".to_string()))
                .is_retryable()
        );
    }
}
