//! # Failsafe Core
//!
//! Core types and collaborator traits for a correlation-gated retry and replay
//! engine.
//!
//! Requests are created on one channel and have their status changed on another.
//! A status change may arrive before the creation has been processed and
//! correlated. Such changes are parked in a per-request ordered queue and
//! replayed, in order, once the request receives its correlation id.
//!
//! ## Core Concepts
//!
//! - **Request**: entity identified by [`RequestId`](request::RequestId) with an
//!   optional [`CorrelationId`](request::CorrelationId) and a
//!   [`RequestStatus`](request::RequestStatus)
//! - **Gate**: a request is *correlated* once its correlation id is set; status
//!   changes for an uncorrelated request are deferred
//! - **Pending event**: a deferred message with its ordinal in the request's queue
//! - **Replay**: republishing pending events, in ordinal order, with staggered
//!   delays through the [`EventBus`](event_bus::EventBus)
//!
//! ## Collaborators
//!
//! The runtime depends only on these traits, injected as `Arc<dyn ...>`:
//!
//! - [`RequestRegistry`](registry::RequestRegistry)
//! - [`PendingEventStore`](pending::PendingEventStore)
//! - [`EventBus`](event_bus::EventBus)
//! - [`Clock`](environment::Clock) and
//!   [`CorrelationIdGenerator`](environment::CorrelationIdGenerator)

// Re-export commonly used types
pub use chrono::{DateTime, Utc};
pub use serde::{Deserialize, Serialize};

pub mod event;
pub mod event_bus;
pub mod message;
pub mod pending;
pub mod persistence;
pub mod registry;
pub mod request;

/// Environment module - injected sources of time and identity
///
/// Production code uses [`SystemClock`](environment::SystemClock) and
/// [`UuidCorrelationIds`](environment::UuidCorrelationIds); tests swap in
/// fixed or sequential implementations from `failsafe-testing`.
pub mod environment {
    use crate::request::CorrelationId;
    use chrono::{DateTime, Utc};

    /// Clock trait - abstracts time operations for testability
    pub trait Clock: Send + Sync {
        /// Get the current time
        fn now(&self) -> DateTime<Utc>;
    }

    /// Wall-clock time.
    #[derive(Debug, Clone, Copy, Default)]
    pub struct SystemClock;

    impl Clock for SystemClock {
        fn now(&self) -> DateTime<Utc> {
            Utc::now()
        }
    }

    /// Source of fresh correlation ids for requests that arrive without one.
    pub trait CorrelationIdGenerator: Send + Sync {
        /// Produce a new, non-empty correlation id.
        fn next_correlation_id(&self) -> CorrelationId;
    }

    /// Random v4 UUIDs.
    #[derive(Debug, Clone, Copy, Default)]
    pub struct UuidCorrelationIds;

    impl CorrelationIdGenerator for UuidCorrelationIds {
        fn next_correlation_id(&self) -> CorrelationId {
            CorrelationId::generate()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::environment::{CorrelationIdGenerator, UuidCorrelationIds};

    #[test]
    fn uuid_correlation_ids_are_distinct() {
        let ids = UuidCorrelationIds;
        let first = ids.next_correlation_id();
        let second = ids.next_correlation_id();

        assert!(!first.as_str().is_empty());
        assert_ne!(first, second);
    }
}
