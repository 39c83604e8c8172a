//! In-memory [`EventBus`] that records publishes and can inject failures.
//!
//! Subscribers receive immediate publishes right away and delayed publishes
//! once their delay has elapsed on the tokio clock, so tests using
//! `tokio::time::pause` can drive delivery deterministically.

#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity
#![allow(clippy::missing_panics_doc)]

use failsafe_core::event::SerializedEvent;
use failsafe_core::event_bus::{EventBus, EventBusError, EventStream};
use futures::StreamExt;
use futures::channel::mpsc;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, RwLock};
use std::time::Duration;

/// One accepted publish.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PublishedEvent {
    /// Destination topic.
    pub topic: String,
    /// The envelope as published.
    pub event: SerializedEvent,
    /// `Some` for `publish_delayed`, `None` for `publish`.
    pub delay: Option<Duration>,
}

#[derive(Debug, Default)]
struct Faults {
    /// Number of upcoming publishes to reject.
    fail_next: usize,
    /// Accept this many more publishes, then reject everything.
    accept_budget: Option<usize>,
}

impl Faults {
    fn should_fail(&mut self) -> bool {
        if self.fail_next > 0 {
            self.fail_next -= 1;
            return true;
        }
        match self.accept_budget.as_mut() {
            Some(0) => true,
            Some(remaining) => {
                *remaining -= 1;
                false
            },
            None => false,
        }
    }
}

type Subscribers = HashMap<String, Vec<mpsc::UnboundedSender<SerializedEvent>>>;

/// Recording, fan-out event bus for tests.
#[derive(Clone, Debug, Default)]
pub struct InMemoryEventBus {
    published: Arc<RwLock<Vec<PublishedEvent>>>,
    subscribers: Arc<RwLock<Subscribers>>,
    faults: Arc<RwLock<Faults>>,
}

impl InMemoryEventBus {
    /// Create an empty bus.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Every accepted publish, in call order.
    #[must_use]
    pub fn published(&self) -> Vec<PublishedEvent> {
        self.published.read().unwrap().clone()
    }

    /// Accepted publishes for one topic, in call order.
    #[must_use]
    pub fn published_to(&self, topic: &str) -> Vec<PublishedEvent> {
        self.published
            .read()
            .unwrap()
            .iter()
            .filter(|p| p.topic == topic)
            .cloned()
            .collect()
    }

    /// Forget recorded publishes.
    pub fn clear(&self) {
        self.published.write().unwrap().clear();
    }

    /// Reject the next `count` publishes.
    pub fn fail_next_publishes(&self, count: usize) {
        self.faults.write().unwrap().fail_next = count;
    }

    /// Accept `count` more publishes, then reject every publish until
    /// [`heal`](Self::heal) is called.
    pub fn accept_only(&self, count: usize) {
        self.faults.write().unwrap().accept_budget = Some(count);
    }

    /// Clear every injected fault.
    pub fn heal(&self) {
        *self.faults.write().unwrap() = Faults::default();
    }

    fn accept(
        &self,
        topic: &str,
        event: &SerializedEvent,
        delay: Option<Duration>,
    ) -> Result<(), EventBusError> {
        if self.faults.write().unwrap().should_fail() {
            return Err(EventBusError::PublishFailed {
                topic: topic.to_string(),
                reason: "injected failure".to_string(),
            });
        }

        self.published.write().unwrap().push(PublishedEvent {
            topic: topic.to_string(),
            event: event.clone(),
            delay,
        });

        let senders = self
            .subscribers
            .read()
            .unwrap()
            .get(topic)
            .cloned()
            .unwrap_or_default();
        if senders.is_empty() {
            return Ok(());
        }

        let event = event.clone();
        match delay {
            Some(delay) if !delay.is_zero() => {
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    deliver(&senders, &event);
                });
            },
            _ => deliver(&senders, &event),
        }
        Ok(())
    }
}

fn deliver(senders: &[mpsc::UnboundedSender<SerializedEvent>], event: &SerializedEvent) {
    for sender in senders {
        // A closed receiver means that subscriber went away.
        let _ = sender.unbounded_send(event.clone());
    }
}

impl EventBus for InMemoryEventBus {
    fn publish(
        &self,
        topic: &str,
        event: &SerializedEvent,
    ) -> Pin<Box<dyn Future<Output = Result<(), EventBusError>> + Send + '_>> {
        let result = self.accept(topic, event, None);
        Box::pin(async move { result })
    }

    fn publish_delayed(
        &self,
        topic: &str,
        event: &SerializedEvent,
        delay: Duration,
    ) -> Pin<Box<dyn Future<Output = Result<(), EventBusError>> + Send + '_>> {
        let result = self.accept(topic, event, Some(delay));
        Box::pin(async move { result })
    }

    fn subscribe(
        &self,
        topics: &[&str],
    ) -> Pin<Box<dyn Future<Output = Result<EventStream, EventBusError>> + Send + '_>> {
        let (sender, receiver) = mpsc::unbounded();
        {
            let mut subscribers = self.subscribers.write().unwrap();
            for topic in topics {
                subscribers
                    .entry((*topic).to_string())
                    .or_default()
                    .push(sender.clone());
            }
        }

        let stream: EventStream = Box::pin(receiver.map(Ok::<SerializedEvent, EventBusError>));
        Box::pin(async move { Ok(stream) })
    }
}
