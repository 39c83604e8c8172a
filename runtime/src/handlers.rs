//! Inbound handlers: decode an envelope and hand it to the orchestrator.
//!
//! Handlers return [`FailSafeError`] so the consumer can tell a delivery worth
//! retrying ([`FailSafeError::is_retryable`]) from one that will never succeed.

use crate::error::FailSafeError;
use crate::gate::{CorrelationOutcome, StatusChangeOutcome};
use crate::orchestrator::FailSafeOrchestrator;
use async_trait::async_trait;
use failsafe_core::event::SerializedEvent;
use failsafe_core::message::{RequestMessage, StatusChangeMessage};
use std::sync::Arc;
use tracing::debug;

/// Processes one inbound message.
///
/// # Thread Safety
///
/// Implementors must be `Send + Sync + 'static`: one handler is shared by
/// every in-flight delivery of a consumer.
#[async_trait]
pub trait EventHandler: Send + Sync + 'static {
    /// Handle one delivery.
    ///
    /// # Errors
    ///
    /// Any [`FailSafeError`]; retryable ones cause a redelivery.
    async fn handle(&self, event: &SerializedEvent) -> Result<(), FailSafeError>;
}

/// Handler for the creation topic.
pub struct RequestCreatedHandler {
    orchestrator: Arc<FailSafeOrchestrator>,
}

impl RequestCreatedHandler {
    /// Create a handler.
    #[must_use]
    pub const fn new(orchestrator: Arc<FailSafeOrchestrator>) -> Self {
        Self { orchestrator }
    }
}

#[async_trait]
impl EventHandler for RequestCreatedHandler {
    async fn handle(&self, event: &SerializedEvent) -> Result<(), FailSafeError> {
        let message: RequestMessage = event.decode(RequestMessage::EVENT_TYPE)?;
        let id = message.id;

        let outcome = self
            .orchestrator
            .handle_request_created_or_retried(message)
            .await?;
        if let CorrelationOutcome::Correlated { replay } = &outcome {
            debug!(request_id = %id, replayed = replay.replayed, "Creation handled with replay");
        }
        Ok(())
    }
}

/// Handler for the status-change topic.
pub struct StatusChangeHandler {
    orchestrator: Arc<FailSafeOrchestrator>,
}

impl StatusChangeHandler {
    /// Create a handler.
    #[must_use]
    pub const fn new(orchestrator: Arc<FailSafeOrchestrator>) -> Self {
        Self { orchestrator }
    }
}

#[async_trait]
impl EventHandler for StatusChangeHandler {
    async fn handle(&self, event: &SerializedEvent) -> Result<(), FailSafeError> {
        let message: StatusChangeMessage = event.decode(StatusChangeMessage::EVENT_TYPE)?;
        let id = message.id;

        match self
            .orchestrator
            .handle_status_change_requested(message)
            .await?
        {
            StatusChangeOutcome::Applied { current, .. } => {
                debug!(request_id = %id, status = %current, "Status change handled");
            },
            StatusChangeOutcome::Deferred { ordinal } => {
                debug!(request_id = %id, ordinal = %ordinal, "Status change parked");
            },
            StatusChangeOutcome::AlreadyQueued { ordinal } => {
                debug!(request_id = %id, ordinal = %ordinal, "Replayed copy superseded");
            },
        }
        Ok(())
    }
}
