//! Operational API handlers.

use super::state::AppState;
use crate::error::AppError;
use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
};
use chrono::{DateTime, Utc};
use failsafe_core::message::DeferredEvent;
use failsafe_core::pending::{Ordinal, PendingEvent, PendingEventKey, PendingEventKind};
use failsafe_core::request::{Request, RequestId, RequestStatus};
use serde::{Deserialize, Serialize};

/// A pending event as shown to operators.
#[derive(Debug, Serialize)]
pub struct PendingEventView {
    /// Owning request
    pub request_id: RequestId,
    /// Position in the request's queue
    pub ordinal: Ordinal,
    /// Payload tag
    pub payload_kind: PendingEventKind,
    /// Topic the event is replayed to
    pub destination_topic: String,
    /// When the event was parked
    pub enqueued_at: DateTime<Utc>,
    /// Requested status, `None` when the payload cannot be decoded
    pub new_status: Option<RequestStatus>,
}

impl From<PendingEvent> for PendingEventView {
    fn from(event: PendingEvent) -> Self {
        let new_status = match event.decode() {
            Ok(DeferredEvent::StatusChange(message)) => Some(message.new_status),
            Err(_) => None,
        };
        Self {
            request_id: event.related_request_id,
            ordinal: event.ordinal,
            payload_kind: event.payload_kind,
            destination_topic: event.destination_topic,
            enqueued_at: event.enqueued_at,
            new_status,
        }
    }
}

/// `GET /api/requests`
pub async fn list_requests(State(state): State<AppState>) -> Result<Json<Vec<Request>>, AppError> {
    Ok(Json(state.orchestrator.list_requests().await?))
}

/// `POST /api/requests`: allocate an id and publish its creation.
pub async fn create_request(
    State(state): State<AppState>,
) -> Result<(StatusCode, Json<Request>), AppError> {
    let request = state.orchestrator.create_request().await?;
    Ok((StatusCode::CREATED, Json(request)))
}

/// `PUT /api/requests/:id/status/:status`
///
/// 202 once the change is published. Whether it is applied or deferred is
/// decided when the message comes back from the transport.
pub async fn request_status_change(
    State(state): State<AppState>,
    Path((id, status)): Path<(i64, String)>,
) -> Result<StatusCode, AppError> {
    let status = RequestStatus::parse(&status).map_err(|e| AppError::bad_request(e.to_string()))?;
    state
        .orchestrator
        .request_status_change(RequestId::new(id), status)
        .await?;
    Ok(StatusCode::ACCEPTED)
}

/// `GET /api/pending-events`, ordered by request then ordinal.
pub async fn list_pending_events(
    State(state): State<AppState>,
) -> Result<Json<Vec<PendingEventView>>, AppError> {
    let events = state.orchestrator.list_pending_events().await?;
    Ok(Json(events.into_iter().map(PendingEventView::from).collect()))
}

/// `DELETE /api/pending-events/:request_id/:ordinal`
pub async fn discard_pending_event(
    State(state): State<AppState>,
    Path((request_id, ordinal)): Path<(i64, u64)>,
) -> Result<StatusCode, AppError> {
    let key = PendingEventKey::new(RequestId::new(request_id), Ordinal::new(ordinal));
    match state.orchestrator.discard_pending_event(key).await? {
        Some(_) => Ok(StatusCode::NO_CONTENT),
        None => Err(AppError::not_found("Pending event", key)),
    }
}

/// Query string of `POST /api/processing`.
#[derive(Debug, Deserialize)]
pub struct ProcessingParams {
    /// Whether creation deliveries should be processed.
    pub functional: bool,
}

/// Current processor mode.
#[derive(Debug, Serialize)]
pub struct ProcessingMode {
    /// Whether creation deliveries are processed.
    pub functional: bool,
}

/// `POST /api/processing?functional=bool`
pub async fn set_processing(
    State(state): State<AppState>,
    Query(params): Query<ProcessingParams>,
) -> Json<ProcessingMode> {
    state.orchestrator.set_processing_enabled(params.functional);
    Json(ProcessingMode {
        functional: state.orchestrator.processing_enabled(),
    })
}
