//! Inbound consumers wired to the in-memory bus, the way the server runs them.

#![allow(clippy::unwrap_used)]

use async_trait::async_trait;
use failsafe_core::event::SerializedEvent;
use failsafe_core::event_bus::EventBus;
use failsafe_core::pending::PendingEventStore;
use failsafe_core::registry::RequestRegistry;
use failsafe_core::request::{GateState, RequestStatus};
use failsafe_runtime::consumer::MissingField;
use failsafe_runtime::{
    EventConsumer, EventHandler, FailSafeConfig, FailSafeError, FailSafeOrchestrator,
    RequestCreatedHandler, RetryPolicy, StatusChangeHandler,
};
use failsafe_testing::{InMemoryEventBus, InMemoryPendingEventStore, InMemoryRequestRegistry};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::Instant;

struct Pipeline {
    registry: Arc<InMemoryRequestRegistry>,
    pending: Arc<InMemoryPendingEventStore>,
    bus: Arc<InMemoryEventBus>,
    orchestrator: Arc<FailSafeOrchestrator>,
    shutdown: broadcast::Sender<()>,
    consumers: Vec<JoinHandle<()>>,
}

impl Pipeline {
    async fn start(retry_policy: RetryPolicy) -> Self {
        failsafe_testing::init_test_tracing();
        let registry = Arc::new(InMemoryRequestRegistry::new());
        let pending = Arc::new(InMemoryPendingEventStore::new());
        let bus = Arc::new(InMemoryEventBus::new());
        let config = FailSafeConfig::default();
        let orchestrator = Arc::new(FailSafeOrchestrator::new(
            config.clone(),
            Arc::clone(&registry) as Arc<dyn RequestRegistry>,
            Arc::clone(&pending) as Arc<dyn PendingEventStore>,
            Arc::clone(&bus) as Arc<dyn EventBus>,
        ));
        let (shutdown, _) = broadcast::channel(1);

        let created = EventConsumer::builder()
            .name("new-requests")
            .topics(vec![config.new_request_topic.clone()])
            .event_bus(Arc::clone(&bus) as Arc<dyn EventBus>)
            .handler(Arc::new(RequestCreatedHandler::new(Arc::clone(&orchestrator))))
            .shutdown(shutdown.subscribe())
            .retry_policy(retry_policy.clone())
            .build()
            .unwrap();
        let status = EventConsumer::builder()
            .name("status-changes")
            .topics(vec![config.status_change_topic.clone()])
            .event_bus(Arc::clone(&bus) as Arc<dyn EventBus>)
            .handler(Arc::new(StatusChangeHandler::new(Arc::clone(&orchestrator))))
            .shutdown(shutdown.subscribe())
            .retry_policy(retry_policy)
            .build()
            .unwrap();

        let consumers = vec![created.spawn(), status.spawn()];
        // Let both consumers subscribe.
        tokio::time::sleep(Duration::from_millis(10)).await;

        Self {
            registry,
            pending,
            bus,
            orchestrator,
            shutdown,
            consumers,
        }
    }

    async fn stop(self) {
        self.shutdown.send(()).unwrap();
        for handle in self.consumers {
            handle.await.unwrap();
        }
    }
}

#[tokio::test(start_paused = true)]
async fn status_change_before_correlation_is_replayed_after_redelivery() {
    let pipeline = Pipeline::start(RetryPolicy::fixed(5, Duration::from_secs(10))).await;
    pipeline.orchestrator.set_processing_enabled(false);

    let request = pipeline.orchestrator.create_request().await.unwrap();
    pipeline
        .orchestrator
        .request_status_change(request.id, RequestStatus::Completed)
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_secs(1)).await;

    // The creation delivery was refused, so the change is parked.
    let stored = pipeline.registry.snapshot(request.id).unwrap();
    assert_eq!(stored.gate_state(), GateState::Uncorrelated);
    assert_eq!(stored.status, RequestStatus::New);
    assert_eq!(pipeline.pending.len(), 1);

    pipeline.orchestrator.set_processing_enabled(true);
    tokio::time::sleep(Duration::from_secs(30)).await;

    let stored = pipeline.registry.snapshot(request.id).unwrap();
    assert_eq!(stored.gate_state(), GateState::Correlated);
    assert_eq!(stored.status, RequestStatus::Completed);
    assert!(pipeline.pending.is_empty());

    pipeline.stop().await;
}

#[tokio::test(start_paused = true)]
async fn halted_replay_still_ends_on_the_last_requested_status() {
    let pipeline = Pipeline::start(RetryPolicy::fixed(5, Duration::from_secs(10))).await;
    pipeline.orchestrator.set_processing_enabled(false);

    let request = pipeline.orchestrator.create_request().await.unwrap();
    for status in [RequestStatus::Started, RequestStatus::Pending] {
        pipeline
            .orchestrator
            .request_status_change(request.id, status)
            .await
            .unwrap();
    }
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(pipeline.pending.len(), 2);

    // The gate opens on the next creation redelivery, but only the first
    // replayed change makes it onto the bus.
    pipeline.bus.accept_only(1);
    pipeline.orchestrator.set_processing_enabled(true);
    tokio::time::sleep(Duration::from_secs(15)).await;

    let stored = pipeline.registry.snapshot(request.id).unwrap();
    assert_eq!(stored.gate_state(), GateState::Correlated);
    assert_eq!(stored.status, RequestStatus::Started);
    assert_eq!(pipeline.pending.len(), 1);

    pipeline.bus.heal();
    let sweep = pipeline.orchestrator.sweep().await.unwrap();
    assert_eq!(sweep.replayed, 1);
    tokio::time::sleep(Duration::from_secs(30)).await;

    let stored = pipeline.registry.snapshot(request.id).unwrap();
    assert_eq!(stored.status, RequestStatus::Pending);
    assert!(pipeline.pending.is_empty());

    pipeline.stop().await;
}

#[tokio::test(start_paused = true)]
async fn exhausted_redelivery_leaves_the_request_uncorrelated() {
    let pipeline = Pipeline::start(RetryPolicy::fixed(2, Duration::from_secs(1))).await;
    pipeline.orchestrator.set_processing_enabled(false);

    let request = pipeline.orchestrator.create_request().await.unwrap();
    tokio::time::sleep(Duration::from_secs(10)).await;

    // Re-enabling does not help: the delivery already gave up.
    pipeline.orchestrator.set_processing_enabled(true);
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(
        pipeline.registry.snapshot(request.id).unwrap().gate_state(),
        GateState::Uncorrelated
    );

    pipeline.stop().await;
}

#[tokio::test(start_paused = true)]
async fn shutdown_waits_for_in_flight_deliveries() {
    let pipeline = Pipeline::start(RetryPolicy::fixed(3, Duration::from_secs(5))).await;
    pipeline.orchestrator.set_processing_enabled(false);
    pipeline.orchestrator.create_request().await.unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;

    // The creation delivery is sleeping between retries; shutdown still
    // completes once it runs out of attempts.
    let registry = Arc::clone(&pipeline.registry);
    pipeline.stop().await;
    assert_eq!(registry.len(), 1);
}

/// Records when each key was handled; deliveries for `slow` take a minute.
struct KeyTimingHandler {
    started: Instant,
    seen: Mutex<Vec<(String, Duration)>>,
}

impl KeyTimingHandler {
    fn new() -> Self {
        Self {
            started: Instant::now(),
            seen: Mutex::new(Vec::new()),
        }
    }

    fn seen(&self) -> Vec<(String, Duration)> {
        self.seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl EventHandler for KeyTimingHandler {
    async fn handle(&self, event: &SerializedEvent) -> Result<(), FailSafeError> {
        if event.key == "slow" {
            tokio::time::sleep(Duration::from_secs(60)).await;
        }
        self.seen
            .lock()
            .unwrap()
            .push((event.key.clone(), self.started.elapsed()));
        Ok(())
    }
}

#[tokio::test(start_paused = true)]
async fn busy_key_does_not_hold_up_other_keys() {
    let bus = Arc::new(InMemoryEventBus::new());
    let handler = Arc::new(KeyTimingHandler::new());
    let (shutdown, _) = broadcast::channel(1);
    let consumer = EventConsumer::builder()
        .name("keys")
        .topics(vec!["ticks".to_string()])
        .event_bus(Arc::clone(&bus) as Arc<dyn EventBus>)
        .handler(Arc::clone(&handler) as Arc<dyn EventHandler>)
        .shutdown(shutdown.subscribe())
        .build()
        .unwrap();
    let running = consumer.spawn();
    tokio::time::sleep(Duration::from_millis(10)).await;

    for key in ["slow", "slow", "fast"] {
        let event = SerializedEvent::new("Tick.v1".to_string(), key.to_string(), Vec::new());
        bus.publish("ticks", &event).await.unwrap();
    }
    tokio::time::sleep(Duration::from_secs(1)).await;

    let seen = handler.seen();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].0, "fast");
    assert!(seen[0].1 < Duration::from_secs(1));

    tokio::time::sleep(Duration::from_secs(120)).await;
    let seen = handler.seen();
    let keys: Vec<_> = seen.iter().map(|(key, _)| key.as_str()).collect();
    assert_eq!(keys, vec!["fast", "slow", "slow"]);
    // Same-key deliveries never overlap.
    assert!(seen[2].1 - seen[1].1 >= Duration::from_secs(60));

    shutdown.send(()).unwrap();
    running.await.unwrap();
}

#[test]
fn builder_reports_the_missing_field() {
    let (shutdown, _) = broadcast::channel::<()>(1);
    let result = EventConsumer::builder()
        .name("incomplete")
        .topics(vec!["t".to_string()])
        .shutdown(shutdown.subscribe())
        .build();

    assert_eq!(result.err(), Some(MissingField("event_bus")));
}
