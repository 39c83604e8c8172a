//! Application state for the HTTP server.

use failsafe_runtime::FailSafeOrchestrator;
use std::sync::Arc;

/// Application state shared across all HTTP handlers.
///
/// Cloned (cheaply via Arc) for each request.
#[derive(Clone)]
pub struct AppState {
    /// Engine entry points
    pub orchestrator: Arc<FailSafeOrchestrator>,
}

impl AppState {
    /// Create a new application state.
    #[must_use]
    pub const fn new(orchestrator: Arc<FailSafeOrchestrator>) -> Self {
        Self { orchestrator }
    }
}
