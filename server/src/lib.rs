//! # Failsafe Server
//!
//! HTTP service hosting the correlation-gated retry and replay engine.
//!
//! The binary wires a [`FailSafeOrchestrator`](failsafe_runtime::FailSafeOrchestrator)
//! over the configured storage and transport, runs one inbound consumer per
//! topic plus the replay sweeper, and exposes an operational API:
//!
//! | Method | Path | |
//! |--------|------|-|
//! | `GET` | `/api/requests` | every known request |
//! | `POST` | `/api/requests` | create a request |
//! | `PUT` | `/api/requests/:id/status/:status` | request a status change |
//! | `GET` | `/api/pending-events` | deferred events awaiting replay |
//! | `DELETE` | `/api/pending-events/:request_id/:ordinal` | discard a deferred event |
//! | `POST` | `/api/processing?functional=bool` | switch the request processor |
//! | `GET` | `/health`, `/health/ready` | health checks |

pub mod config;
pub mod error;
pub mod lifecycle;
pub mod server;

pub use config::Config;
pub use error::AppError;
pub use lifecycle::Application;
