//! Router configuration.

use super::api;
use super::health::{health_check, readiness_check};
use super::state::AppState;
use axum::{
    Router,
    routing::{delete, get, post, put},
};
use tower_http::trace::TraceLayer;

/// Build the complete Axum router.
pub fn build_router(state: AppState) -> Router {
    let api_routes = Router::new()
        .route("/requests", get(api::list_requests).post(api::create_request))
        .route("/requests/:id/status/:status", put(api::request_status_change))
        .route("/pending-events", get(api::list_pending_events))
        .route(
            "/pending-events/:request_id/:ordinal",
            delete(api::discard_pending_event),
        )
        .route("/processing", post(api::set_processing));

    Router::new()
        .route("/health", get(health_check))
        .route("/health/ready", get(readiness_check))
        .nest("/api", api_routes)
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}
