//! HTTP surface of the failsafe service.
//!
//! - Application state
//! - Operational API under `/api`
//! - Liveness and readiness checks

pub mod api;
pub mod health;
pub mod routes;
pub mod state;

pub use routes::build_router;
pub use state::AppState;
