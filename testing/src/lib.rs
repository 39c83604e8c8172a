//! # Failsafe Testing
//!
//! In-memory collaborators and helpers for testing the failsafe engine.
//!
//! This crate provides:
//! - [`InMemoryRequestRegistry`] and [`InMemoryPendingEventStore`]
//! - [`InMemoryEventBus`], which records every publish and can be told to fail
//! - Deterministic environment doubles ([`FixedClock`], [`SequentialCorrelationIds`])
//!
//! ## Example
//!
//! ```ignore
//! use failsafe_testing::{InMemoryEventBus, InMemoryPendingEventStore, InMemoryRequestRegistry};
//!
//! #[tokio::test]
//! async fn deferred_then_replayed() {
//!     let registry = Arc::new(InMemoryRequestRegistry::new());
//!     let pending = Arc::new(InMemoryPendingEventStore::new());
//!     let bus = Arc::new(InMemoryEventBus::new());
//!     // build the orchestrator, drive it, then inspect `bus.published()`
//! }
//! ```

use chrono::{DateTime, Utc};
use failsafe_core::environment::{Clock, CorrelationIdGenerator};
use failsafe_core::request::CorrelationId;

pub mod event_bus;
pub mod pending_store;
pub mod registry;

/// Mock implementations of environment traits.
pub mod mocks {
    use super::{Clock, CorrelationId, CorrelationIdGenerator, DateTime, Utc};
    use std::sync::atomic::{AtomicU64, Ordering};

    /// Fixed clock for deterministic tests
    ///
    /// # Example
    ///
    /// ```
    /// use failsafe_testing::mocks::FixedClock;
    /// use failsafe_core::environment::Clock;
    /// use chrono::Utc;
    ///
    /// let clock = FixedClock::new(Utc::now());
    /// assert_eq!(clock.now(), clock.now());
    /// ```
    #[derive(Debug, Clone)]
    pub struct FixedClock {
        time: DateTime<Utc>,
    }

    impl FixedClock {
        /// Create a new fixed clock with the given time
        #[must_use]
        pub const fn new(time: DateTime<Utc>) -> Self {
            Self { time }
        }
    }

    impl Clock for FixedClock {
        fn now(&self) -> DateTime<Utc> {
            self.time
        }
    }

    /// Create a default fixed clock for tests (2025-01-01 00:00:00 UTC)
    ///
    /// # Panics
    ///
    /// Panics if the hardcoded timestamp fails to parse, which cannot happen.
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn test_clock() -> FixedClock {
        FixedClock::new(
            DateTime::parse_from_rfc3339("2025-01-01T00:00:00Z")
                .expect("hardcoded timestamp should always parse")
                .with_timezone(&Utc),
        )
    }

    /// Predictable correlation ids: `corr-1`, `corr-2`, ...
    #[derive(Debug, Default)]
    pub struct SequentialCorrelationIds {
        next: AtomicU64,
    }

    impl SequentialCorrelationIds {
        /// Start the sequence at `corr-1`.
        #[must_use]
        pub const fn new() -> Self {
            Self {
                next: AtomicU64::new(0),
            }
        }
    }

    impl CorrelationIdGenerator for SequentialCorrelationIds {
        fn next_correlation_id(&self) -> CorrelationId {
            let n = self.next.fetch_add(1, Ordering::SeqCst) + 1;
            CorrelationId::new(format!("corr-{n}"))
        }
    }
}

/// Install a `tracing` subscriber that writes through the test harness.
///
/// Safe to call from every test; only the first call installs anything.
pub fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("failsafe=debug")),
        )
        .with_test_writer()
        .try_init();
}

// Re-export commonly used items
pub use event_bus::{InMemoryEventBus, PublishedEvent};
pub use mocks::{FixedClock, SequentialCorrelationIds, test_clock};
pub use pending_store::InMemoryPendingEventStore;
pub use registry::InMemoryRequestRegistry;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_clock() {
        let clock = test_clock();
        assert_eq!(clock.now(), clock.now());
    }

    #[test]
    fn sequential_correlation_ids_count_up() {
        let ids = SequentialCorrelationIds::new();
        assert_eq!(ids.next_correlation_id().as_str(), "corr-1");
        assert_eq!(ids.next_correlation_id().as_str(), "corr-2");
    }
}
