//! # Failsafe Runtime
//!
//! The engine behind the failsafe request pipeline.
//!
//! ## Core Components
//!
//! - **CorrelationGate**: per-request state machine that applies or defers
//!   status changes, serialized by a per-request lock
//! - **ReplayScheduler**: drains a request's pending queue back onto the bus
//!   with staggered delays
//! - **FailSafeOrchestrator**: public entry points, wiring gate, replay and
//!   transport together
//! - **EventConsumer**: subscribe-process-reconnect loop feeding inbound
//!   messages to the [`handlers`]
//! - **ReplaySweeper**: periodic retry of queues whose replay stopped early
//!
//! ## Example
//!
//! ```ignore
//! use failsafe_runtime::{FailSafeConfig, FailSafeOrchestrator};
//!
//! let orchestrator = FailSafeOrchestrator::new(
//!     FailSafeConfig::default(),
//!     registry,
//!     pending_store,
//!     event_bus,
//! );
//!
//! let request = orchestrator.create_request().await?;
//! orchestrator
//!     .request_status_change(request.id, RequestStatus::Started)
//!     .await?;
//! ```

/// Engine configuration
pub mod config;

/// Event bus consumer with redelivery
pub mod consumer;

/// Error taxonomy
pub mod error;

/// Correlation gate
pub mod gate;

/// Inbound message handlers
pub mod handlers;

/// Health reporting
pub mod health;

/// Per-key async locks
pub mod key_lock;

/// Prometheus metrics for observability
pub mod metrics;

/// Public entry points
pub mod orchestrator;

/// Pending queue replay
pub mod replay;

/// Retry logic with fixed or exponential backoff
pub mod retry;

/// Background sweep of leftover queues
pub mod sweeper;

pub use config::{CorrelationPolicy, FailSafeConfig};
pub use consumer::{EventConsumer, EventConsumerBuilder};
pub use error::FailSafeError;
pub use gate::{CorrelationGate, CorrelationOutcome, StatusChangeOutcome};
pub use handlers::{EventHandler, RequestCreatedHandler, StatusChangeHandler};
pub use health::{HealthCheck, HealthReport, HealthStatus};
pub use orchestrator::{FailSafeOrchestrator, ProcessingMode, SweepReport};
pub use replay::{ReplayHalt, ReplayHaltReason, ReplayReport, ReplayScheduler};
pub use retry::RetryPolicy;
pub use sweeper::ReplaySweeper;
