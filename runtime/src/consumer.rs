//! Event bus consumer with redelivery and automatic reconnection.
//!
//! # Pattern: Subscribe-Process-Reconnect Loop
//!
//! ```text
//! loop {
//!     subscribe:
//!         for each message (up to `max_in_flight` started or queued):
//!             key idle: start handling it
//!             key busy: queue it behind that key's running delivery
//!         handling retries retryable failures per RetryPolicy, then logs
//!         and counts messages that exhaust their retries
//!         if the stream ends: wait `reconnect_delay`, subscribe again
//!     on shutdown: stop reading, finish running and queued deliveries
//! }
//! ```
//!
//! The reader never waits on a busy key: a slow or retrying delivery holds up
//! later messages with the same key only.
//!
//! # Example
//!
//! ```rust,ignore
//! let consumer = EventConsumer::builder()
//!     .name("status-changes")
//!     .topics(vec![config.status_change_topic.clone()])
//!     .event_bus(event_bus)
//!     .handler(Arc::new(StatusChangeHandler::new(orchestrator)))
//!     .shutdown(shutdown_tx.subscribe())
//!     .build()?;
//!
//! let handle = consumer.spawn();
//! ```

use crate::error::FailSafeError;
use crate::handlers::EventHandler;
use crate::metrics::ConsumerMetrics;
use crate::retry::{RetryError, RetryPolicy, retry_while};
use failsafe_core::event::SerializedEvent;
use failsafe_core::event_bus::{EventBus, EventStream};
use futures::{FutureExt, StreamExt};
use std::collections::{HashMap, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::{JoinError, JoinSet};
use tracing::{error, info, warn};

/// A required builder field was not set.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("EventConsumer is missing required field: {0}")]
pub struct MissingField(pub &'static str);

/// Long-running subscriber for one or more topics.
///
/// # Lifecycle
///
/// 1. Created via [`builder()`](Self::builder)
/// 2. Spawned as a background task via [`spawn()`](Self::spawn)
/// 3. Runs until the shutdown signal is received
///
/// Messages sharing a key are handled one at a time, in stream order.
/// Messages with different keys run concurrently.
pub struct EventConsumer {
    name: String,
    topics: Vec<String>,
    event_bus: Arc<dyn EventBus>,
    handler: Arc<dyn EventHandler>,
    shutdown: broadcast::Receiver<()>,
    retry_policy: RetryPolicy,
    max_in_flight: usize,
    reconnect_delay: Duration,
}

impl EventConsumer {
    /// Create a builder for configuring a consumer.
    #[must_use]
    pub fn builder() -> EventConsumerBuilder {
        EventConsumerBuilder::default()
    }

    /// Consumer name used in logs and metrics.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Spawn the consumer as a background task.
    #[must_use]
    pub fn spawn(mut self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            self.run().await;
        })
    }

    async fn run(&mut self) {
        info!(consumer = %self.name, topics = ?self.topics, "Event consumer started");
        let mut dispatcher = Dispatcher {
            consumer: self.name.clone(),
            handler: Arc::clone(&self.handler),
            retry_policy: self.retry_policy.clone(),
            capacity: self.max_in_flight.max(1),
            running: JoinSet::new(),
            waiting: HashMap::new(),
            queued: 0,
        };

        loop {
            let topics: Vec<&str> = self.topics.iter().map(String::as_str).collect();

            tokio::select! {
                _ = self.shutdown.recv() => {
                    info!(consumer = %self.name, "Event consumer received shutdown signal");
                    break;
                }
                subscribe_result = self.event_bus.subscribe(&topics) => {
                    match subscribe_result {
                        Ok(stream) => {
                            info!(consumer = %self.name, "Subscribed to event bus");
                            if self.process_stream(stream, &mut dispatcher).await {
                                break;
                            }
                            warn!(
                                consumer = %self.name,
                                "Event stream ended, reconnecting in {:?}",
                                self.reconnect_delay
                            );
                            tokio::time::sleep(self.reconnect_delay).await;
                        }
                        Err(e) => {
                            error!(
                                consumer = %self.name,
                                error = %e,
                                "Failed to subscribe to event bus, retrying in {:?}",
                                self.reconnect_delay
                            );
                            tokio::time::sleep(self.reconnect_delay).await;
                        }
                    }
                }
            }
        }

        dispatcher.drain().await;
        info!(consumer = %self.name, "Event consumer stopped");
    }

    /// Dispatch messages until the stream ends (`false`) or shutdown (`true`).
    async fn process_stream(&mut self, mut stream: EventStream, dispatcher: &mut Dispatcher) -> bool {
        loop {
            tokio::select! {
                _ = self.shutdown.recv() => {
                    info!(consumer = %self.name, "Event consumer received shutdown signal during processing");
                    return true;
                }
                Some(finished) = dispatcher.running.join_next() => {
                    dispatcher.finished(finished);
                }
                next = stream.next(), if dispatcher.has_capacity() => {
                    match next {
                        Some(Ok(event)) => {
                            ConsumerMetrics::record_message(&self.name);
                            dispatcher.submit(event);
                        }
                        Some(Err(e)) => {
                            error!(consumer = %self.name, error = %e, "Error receiving event from stream");
                        }
                        None => {
                            warn!(consumer = %self.name, "Event stream ended");
                            return false;
                        }
                    }
                }
            }
        }
    }
}

/// Runs deliveries concurrently across keys and one at a time per key.
///
/// Only the consumer's read loop touches it, so the per-key queues need no
/// locking. `capacity` bounds running plus queued deliveries; the read loop
/// stops pulling from the stream while it is reached.
struct Dispatcher {
    consumer: String,
    handler: Arc<dyn EventHandler>,
    retry_policy: RetryPolicy,
    capacity: usize,
    /// Each task yields the key it delivered.
    running: JoinSet<String>,
    /// Keys with a running delivery, and what waits behind it.
    waiting: HashMap<String, VecDeque<SerializedEvent>>,
    queued: usize,
}

impl Dispatcher {
    fn has_capacity(&self) -> bool {
        self.running.len() + self.queued < self.capacity
    }

    fn submit(&mut self, event: SerializedEvent) {
        if let Some(behind) = self.waiting.get_mut(&event.key) {
            behind.push_back(event);
            self.queued += 1;
            return;
        }
        self.waiting.insert(event.key.clone(), VecDeque::new());
        self.start(event);
    }

    fn finished(&mut self, joined: Result<String, JoinError>) {
        let key = match joined {
            Ok(key) => key,
            Err(e) => {
                error!(consumer = %self.consumer, error = %e, "Delivery task was cancelled");
                return;
            },
        };

        match self.waiting.get_mut(&key).and_then(VecDeque::pop_front) {
            Some(next) => {
                self.queued -= 1;
                self.start(next);
            },
            None => {
                self.waiting.remove(&key);
            },
        }
    }

    fn start(&mut self, event: SerializedEvent) {
        let consumer = self.consumer.clone();
        let handler = Arc::clone(&self.handler);
        let policy = self.retry_policy.clone();

        self.running.spawn(async move {
            let delivery = deliver(&consumer, handler.as_ref(), &policy, &event);
            if AssertUnwindSafe(delivery).catch_unwind().await.is_err() {
                error!(consumer = %consumer, key = %event.key, "Event handler panicked");
            }
            event.key
        });
    }

    /// Finish every running and queued delivery.
    async fn drain(&mut self) {
        let remaining = self.running.len() + self.queued;
        if remaining > 0 {
            info!(consumer = %self.consumer, remaining, "Waiting for in-flight deliveries");
        }
        while let Some(finished) = self.running.join_next().await {
            self.finished(finished);
        }
    }
}

/// Handle one message with redelivery.
async fn deliver(
    consumer: &str,
    handler: &dyn EventHandler,
    policy: &RetryPolicy,
    event: &SerializedEvent,
) {
    let mut calls = 0usize;
    let result = retry_while(
        policy,
        || {
            calls += 1;
            if calls > 1 {
                ConsumerMetrics::record_retry(consumer);
            }
            handler.handle(event)
        },
        FailSafeError::is_retryable,
    )
    .await;

    match result {
        Ok(()) => {},
        Err(RetryError::Permanent(e)) => {
            warn!(
                consumer,
                event_type = %event.event_type,
                key = %event.key,
                error = %e,
                "Delivery rejected"
            );
        },
        Err(RetryError::Exhausted { attempts, last }) => {
            ConsumerMetrics::record_exhausted(consumer);
            error!(
                consumer,
                event_type = %event.event_type,
                key = %event.key,
                attempts,
                error = %last,
                "Delivery failed after all retries and needs manual troubleshooting"
            );
        },
    }
}

/// Builder for configuring an [`EventConsumer`].
#[derive(Default)]
pub struct EventConsumerBuilder {
    name: Option<String>,
    topics: Option<Vec<String>>,
    event_bus: Option<Arc<dyn EventBus>>,
    handler: Option<Arc<dyn EventHandler>>,
    shutdown: Option<broadcast::Receiver<()>>,
    retry_policy: Option<RetryPolicy>,
    max_in_flight: Option<usize>,
    reconnect_delay: Option<Duration>,
}

impl EventConsumerBuilder {
    /// Set consumer name.
    #[must_use]
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Set topics to subscribe to.
    #[must_use]
    pub fn topics(mut self, topics: Vec<String>) -> Self {
        self.topics = Some(topics);
        self
    }

    /// Set event bus instance.
    #[must_use]
    pub fn event_bus(mut self, event_bus: Arc<dyn EventBus>) -> Self {
        self.event_bus = Some(event_bus);
        self
    }

    /// Set event handler.
    #[must_use]
    pub fn handler(mut self, handler: Arc<dyn EventHandler>) -> Self {
        self.handler = Some(handler);
        self
    }

    /// Set shutdown signal receiver.
    #[must_use]
    pub fn shutdown(mut self, shutdown: broadcast::Receiver<()>) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    /// Set the redelivery policy (default: 5 retries, 10 seconds apart).
    #[must_use]
    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = Some(policy);
        self
    }

    /// Set how many deliveries may be handled at once (default: 32).
    #[must_use]
    pub const fn max_in_flight(mut self, max_in_flight: usize) -> Self {
        self.max_in_flight = Some(max_in_flight);
        self
    }

    /// Set the wait before resubscribing (default: 5 seconds).
    #[must_use]
    pub const fn reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = Some(delay);
        self
    }

    /// Build the [`EventConsumer`].
    ///
    /// # Errors
    ///
    /// Returns [`MissingField`] if name, topics, event bus, handler or
    /// shutdown receiver were not set.
    pub fn build(self) -> Result<EventConsumer, MissingField> {
        Ok(EventConsumer {
            name: self.name.ok_or(MissingField("name"))?,
            topics: self.topics.ok_or(MissingField("topics"))?,
            event_bus: self.event_bus.ok_or(MissingField("event_bus"))?,
            handler: self.handler.ok_or(MissingField("handler"))?,
            shutdown: self.shutdown.ok_or(MissingField("shutdown"))?,
            retry_policy: self.retry_policy.unwrap_or_default(),
            max_in_flight: self.max_in_flight.unwrap_or(32),
            reconnect_delay: self.reconnect_delay.unwrap_or(Duration::from_secs(5)),
        })
    }
}
