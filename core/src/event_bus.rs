//! Event bus abstraction: the transport for creation and status-change messages.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐  publish   ┌───────────┐  subscribe  ┌──────────────────┐
//! │ HTTP / API   │──────────▶│ Event Bus │────────────▶│ EventConsumer    │
//! └──────────────┘            └─────▲─────┘             │ → orchestrator   │
//!                                   │                   └────────┬─────────┘
//!                                   │ publish_delayed            │ defer
//!                                   │                            ▼
//!                            ┌──────┴───────┐           ┌──────────────────┐
//!                            │ ReplayScheduler│◀────────│ PendingEventStore│
//!                            └──────────────┘           └──────────────────┘
//! ```
//!
//! # Key Principles
//!
//! - **At-least-once delivery**: a message may arrive more than once
//! - **Ordered within partition**: messages sharing a key keep their order
//! - **Delayed publish**: the bus owns the timer; an accepted delayed publish is
//!   delivered no earlier than its delay, even if this process stops
//!
//! # Implementations
//!
//! - `InMemoryEventBus` (in `failsafe-testing`): records every publish
//! - `RedpandaEventBus` (in `failsafe-redpanda`): Kafka-compatible production bus

use crate::event::SerializedEvent;
use futures::Stream;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use thiserror::Error;

/// Errors that can occur during event bus operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EventBusError {
    /// Failed to connect to the event bus
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Failed to publish an event to a topic
    #[error("Publish failed for topic '{topic}': {reason}")]
    PublishFailed {
        /// The topic that failed
        topic: String,
        /// The reason for failure
        reason: String,
    },

    /// Failed to subscribe to topics
    #[error("Subscription failed for topics {topics:?}: {reason}")]
    SubscriptionFailed {
        /// The topics that failed to subscribe
        topics: Vec<String>,
        /// The reason for failure
        reason: String,
    },

    /// Failed to deserialize an event
    #[error("Deserialization failed: {0}")]
    DeserializationFailed(String),

    /// Network or transport error
    #[error("Transport error: {0}")]
    TransportError(String),
}

/// Stream of events from a subscription.
pub type EventStream = Pin<Box<dyn Stream<Item = Result<SerializedEvent, EventBusError>> + Send>>;

/// Publish/subscribe transport with delayed publish.
///
/// # Dyn Compatibility
///
/// Methods return `Pin<Box<dyn Future>>` so the bus can be shared as
/// `Arc<dyn EventBus>` between the orchestrator, the replay scheduler and the
/// consumers.
pub trait EventBus: Send + Sync {
    /// Publish an event to a topic for immediate delivery.
    ///
    /// # Errors
    ///
    /// Returns [`EventBusError::PublishFailed`] if the broker did not accept it.
    fn publish(
        &self,
        topic: &str,
        event: &SerializedEvent,
    ) -> Pin<Box<dyn Future<Output = Result<(), EventBusError>> + Send + '_>>;

    /// Publish an event that subscribers must not see before `delay` elapses.
    ///
    /// Returning `Ok` means the bus accepted the message and will deliver it;
    /// the caller may then forget about it.
    ///
    /// # Errors
    ///
    /// Returns [`EventBusError::PublishFailed`] if the broker did not accept it.
    fn publish_delayed(
        &self,
        topic: &str,
        event: &SerializedEvent,
        delay: Duration,
    ) -> Pin<Box<dyn Future<Output = Result<(), EventBusError>> + Send + '_>>;

    /// Subscribe to one or more topics and receive a stream of events.
    ///
    /// # Errors
    ///
    /// Returns [`EventBusError::SubscriptionFailed`] if subscription fails.
    fn subscribe(
        &self,
        topics: &[&str],
    ) -> Pin<Box<dyn Future<Output = Result<EventStream, EventBusError>> + Send + '_>>;
}
