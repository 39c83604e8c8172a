//! Behaviour of the gate and replay driven through the orchestrator.

#![allow(clippy::unwrap_used, clippy::panic)]

use failsafe_core::event_bus::EventBus;
use failsafe_core::message::{RequestMessage, StatusChangeMessage};
use failsafe_core::pending::{Ordinal, PendingEventKey, PendingEventStore};
use failsafe_core::persistence::PersistenceError;
use failsafe_core::registry::{RequestRegistry, Upserted};
use failsafe_core::request::{CorrelationId, GateState, Request, RequestId, RequestStatus};
use failsafe_runtime::{
    CorrelationOutcome, CorrelationPolicy, FailSafeConfig, FailSafeError, FailSafeOrchestrator,
    HealthStatus, ReplayHaltReason, StatusChangeOutcome,
};
use failsafe_testing::{
    InMemoryEventBus, InMemoryPendingEventStore, InMemoryRequestRegistry,
    SequentialCorrelationIds,
};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

const STATUS_TOPIC: &str = "status-changes";
const NEW_TOPIC: &str = "new-requests";

struct Harness {
    registry: Arc<InMemoryRequestRegistry>,
    pending: Arc<InMemoryPendingEventStore>,
    bus: Arc<InMemoryEventBus>,
    orchestrator: Arc<FailSafeOrchestrator>,
}

impl Harness {
    fn new() -> Self {
        Self::with_policy(CorrelationPolicy::PreserveFirst)
    }

    fn with_policy(policy: CorrelationPolicy) -> Self {
        let registry = Arc::new(InMemoryRequestRegistry::new());
        let pending = Arc::new(InMemoryPendingEventStore::new());
        let bus = Arc::new(InMemoryEventBus::new());
        let config = FailSafeConfig::default()
            .with_status_change_topic(STATUS_TOPIC)
            .with_new_request_topic(NEW_TOPIC)
            .with_replay_interval(Duration::from_secs(5))
            .with_correlation_policy(policy);
        let orchestrator = FailSafeOrchestrator::new(
            config,
            Arc::clone(&registry) as Arc<dyn RequestRegistry>,
            Arc::clone(&pending) as Arc<dyn PendingEventStore>,
            Arc::clone(&bus) as Arc<dyn EventBus>,
        )
        .with_correlation_ids(Arc::new(SequentialCorrelationIds::new()));

        Self {
            registry,
            pending,
            bus,
            orchestrator: Arc::new(orchestrator),
        }
    }

    async fn created(&self, id: i64, correlation: &str) -> CorrelationOutcome {
        self.orchestrator
            .handle_request_created_or_retried(
                RequestMessage::created(RequestId::new(id))
                    .with_correlation(CorrelationId::new(correlation)),
            )
            .await
            .unwrap()
    }

    async fn status(&self, id: i64, status: RequestStatus) -> StatusChangeOutcome {
        self.orchestrator
            .handle_status_change_requested(StatusChangeMessage::new(RequestId::new(id), status))
            .await
            .unwrap()
    }

    fn replayed_statuses(&self) -> Vec<RequestStatus> {
        self.bus
            .published_to(STATUS_TOPIC)
            .into_iter()
            .map(|p| {
                p.event
                    .decode::<StatusChangeMessage>(StatusChangeMessage::EVENT_TYPE)
                    .unwrap()
                    .new_status
            })
            .collect()
    }
}

#[tokio::test]
async fn creation_is_idempotent() {
    let h = Harness::new();

    assert_eq!(h.created(5, "X").await, CorrelationOutcome::Registered);
    assert_eq!(h.created(5, "X").await, CorrelationOutcome::Duplicate);

    assert_eq!(h.registry.len(), 1);
    let request = h.registry.snapshot(RequestId::new(5)).unwrap();
    assert_eq!(request.correlation_id, Some(CorrelationId::new("X")));
    assert_eq!(request.status, RequestStatus::New);
}

#[tokio::test]
async fn uncorrelated_requests_never_take_direct_writes() {
    let h = Harness::new();
    let request = h.orchestrator.create_request().await.unwrap();

    for status in [
        RequestStatus::Started,
        RequestStatus::OnHold,
        RequestStatus::Completed,
    ] {
        assert!(matches!(
            h.status(request.id.value(), status).await,
            StatusChangeOutcome::Deferred { .. }
        ));
    }

    let stored = h.registry.snapshot(request.id).unwrap();
    assert_eq!(stored.status, RequestStatus::New);
    assert_eq!(stored.gate_state(), GateState::Uncorrelated);
    assert_eq!(h.pending.len(), 3);
}

#[tokio::test]
async fn replay_preserves_order_and_staggers_delays() {
    let h = Harness::new();
    for _ in 0..7 {
        h.orchestrator.create_request().await.unwrap();
    }
    let id = RequestId::new(7);

    let changes: Vec<_> = [
        RequestStatus::Started,
        RequestStatus::Pending,
        RequestStatus::Completed,
    ]
    .into_iter()
    .map(|status| StatusChangeMessage::new(id, status))
    .collect();
    let mut assigned = Vec::new();
    for change in changes {
        match h
            .orchestrator
            .handle_status_change_requested(change)
            .await
            .unwrap()
        {
            StatusChangeOutcome::Deferred { ordinal } => assigned.push(ordinal),
            other => panic!("expected deferral, got {other:?}"),
        }
    }
    assert_eq!(assigned, vec![Ordinal::new(0), Ordinal::new(1), Ordinal::new(2)]);

    let CorrelationOutcome::Correlated { replay } = h.created(7, "abc").await else {
        panic!("expected the gate to open");
    };
    assert_eq!(replay.replayed, 3);
    assert!(replay.is_complete());

    assert_eq!(
        h.replayed_statuses(),
        vec![
            RequestStatus::Started,
            RequestStatus::Pending,
            RequestStatus::Completed
        ]
    );
    let delays: Vec<_> = h
        .bus
        .published_to(STATUS_TOPIC)
        .into_iter()
        .map(|p| p.delay)
        .collect();
    assert_eq!(
        delays,
        vec![
            Some(Duration::ZERO),
            Some(Duration::from_secs(5)),
            Some(Duration::from_secs(10))
        ]
    );
    assert!(h.pending.list_ordered(id).await.unwrap().is_empty());
}

#[tokio::test]
async fn unknown_request_is_rejected_without_side_effects() {
    let h = Harness::new();

    let result = h
        .orchestrator
        .request_status_change(RequestId::new(999), RequestStatus::Completed)
        .await;
    assert_eq!(result, Err(FailSafeError::UnknownRequest(RequestId::new(999))));

    let inbound = h
        .orchestrator
        .handle_status_change_requested(StatusChangeMessage::new(
            RequestId::new(999),
            RequestStatus::Completed,
        ))
        .await;
    assert_eq!(inbound, Err(FailSafeError::UnknownRequest(RequestId::new(999))));

    assert!(h.registry.is_empty());
    assert!(h.pending.is_empty());
    assert!(h.bus.published().is_empty());
}

#[tokio::test]
async fn end_to_end_deferral_and_replay() {
    let h = Harness::new();

    let request = h.orchestrator.create_request().await.unwrap();
    assert_eq!(request.id, RequestId::new(1));
    assert_eq!(request.status, RequestStatus::New);
    assert!(request.correlation_id.is_none());
    assert_eq!(h.bus.published_to(NEW_TOPIC).len(), 1);

    h.orchestrator
        .request_status_change(RequestId::new(1), RequestStatus::Completed)
        .await
        .unwrap();
    assert_eq!(h.bus.published_to(STATUS_TOPIC).len(), 1);
    h.bus.clear();

    assert_eq!(
        h.status(1, RequestStatus::Completed).await,
        StatusChangeOutcome::Deferred {
            ordinal: Ordinal::FIRST
        }
    );
    assert_eq!(h.pending.ordinals(RequestId::new(1)), vec![Ordinal::FIRST]);

    assert!(matches!(
        h.created(1, "abc").await,
        CorrelationOutcome::Correlated { .. }
    ));

    let stored = h.registry.snapshot(RequestId::new(1)).unwrap();
    assert_eq!(stored.correlation_id, Some(CorrelationId::new("abc")));
    assert_eq!(stored.gate_state(), GateState::Correlated);

    let published = h.bus.published_to(STATUS_TOPIC);
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].delay, Some(Duration::ZERO));
    assert_eq!(published[0].event.key, "1");
    assert!(h.pending.is_empty());

    // The replayed change comes back through the bus and now applies.
    let outcome = h
        .orchestrator
        .handle_status_change_requested(
            published[0]
                .event
                .decode(StatusChangeMessage::EVENT_TYPE)
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(
        outcome,
        StatusChangeOutcome::Applied {
            previous: RequestStatus::New,
            current: RequestStatus::Completed
        }
    );
}

#[tokio::test]
async fn correlated_request_with_empty_backlog_applies_directly() {
    let h = Harness::new();
    h.created(3, "abc").await;

    assert_eq!(
        h.status(3, RequestStatus::Started).await,
        StatusChangeOutcome::Applied {
            previous: RequestStatus::New,
            current: RequestStatus::Started
        }
    );
    assert!(h.pending.is_empty());
    assert!(h.bus.published().is_empty());
}

#[tokio::test]
async fn halted_replay_keeps_deferring_behind_the_backlog() {
    let h = Harness::new();
    h.orchestrator.create_request().await.unwrap();
    h.status(1, RequestStatus::Started).await;
    h.status(1, RequestStatus::Pending).await;

    h.bus.accept_only(1);
    let CorrelationOutcome::Correlated { replay } = h.created(1, "abc").await else {
        panic!("expected the gate to open");
    };
    assert_eq!(replay.replayed, 1);
    let halt = replay.halted.unwrap();
    assert_eq!(halt.ordinal, Ordinal::new(1));
    assert!(matches!(halt.reason, ReplayHaltReason::PublishFailed(_)));

    // Correlated, but the queue is not empty: a new change must not overtake.
    assert_eq!(
        h.status(1, RequestStatus::Completed).await,
        StatusChangeOutcome::Deferred {
            ordinal: Ordinal::new(2)
        }
    );
    assert_eq!(
        h.registry.snapshot(RequestId::new(1)).unwrap().status,
        RequestStatus::New
    );

    h.bus.heal();
    let report = h.orchestrator.sweep().await.unwrap();
    assert_eq!(report.requests, 1);
    assert_eq!(report.replayed, 2);
    assert_eq!(report.halted, 0);
    assert!(h.pending.is_empty());
    assert_eq!(
        h.replayed_statuses(),
        vec![
            RequestStatus::Started,
            RequestStatus::Pending,
            RequestStatus::Completed
        ]
    );
}

#[tokio::test]
async fn duplicate_delivery_preserves_first_correlation_by_default() {
    let h = Harness::new();
    h.created(2, "first").await;

    assert_eq!(h.created(2, "second").await, CorrelationOutcome::Duplicate);
    assert_eq!(
        h.registry.snapshot(RequestId::new(2)).unwrap().correlation_id,
        Some(CorrelationId::new("first"))
    );
}

#[tokio::test]
async fn overwrite_policy_refreshes_the_correlation() {
    let h = Harness::with_policy(CorrelationPolicy::OverwriteLatest);
    h.created(2, "first").await;

    assert_eq!(h.created(2, "second").await, CorrelationOutcome::Refreshed);
    assert_eq!(h.created(2, "second").await, CorrelationOutcome::Duplicate);
    assert_eq!(
        h.registry.snapshot(RequestId::new(2)).unwrap().correlation_id,
        Some(CorrelationId::new("second"))
    );
}

#[tokio::test]
async fn missing_correlation_id_is_minted() {
    let h = Harness::new();

    h.orchestrator
        .handle_request_created_or_retried(RequestMessage::created(RequestId::new(4)))
        .await
        .unwrap();

    assert_eq!(
        h.registry.snapshot(RequestId::new(4)).unwrap().correlation_id,
        Some(CorrelationId::new("corr-1"))
    );
}

#[tokio::test]
async fn disabled_processing_registers_but_does_not_correlate() {
    let h = Harness::new();
    h.orchestrator.set_processing_enabled(false);

    let result = h
        .orchestrator
        .handle_request_created_or_retried(
            RequestMessage::created(RequestId::new(8)).with_correlation(CorrelationId::new("abc")),
        )
        .await;
    assert_eq!(result, Err(FailSafeError::ProcessingDisabled));
    assert!(FailSafeError::ProcessingDisabled.is_retryable());

    let stored = h.registry.snapshot(RequestId::new(8)).unwrap();
    assert_eq!(stored.gate_state(), GateState::Uncorrelated);
    assert!(matches!(
        h.status(8, RequestStatus::Started).await,
        StatusChangeOutcome::Deferred { .. }
    ));
    assert_eq!(h.orchestrator.health().await.status, HealthStatus::Degraded);

    h.orchestrator.set_processing_enabled(true);
    assert!(matches!(
        h.created(8, "abc").await,
        CorrelationOutcome::Correlated { .. }
    ));
    assert!(h.pending.is_empty());

    let report = h.orchestrator.health().await;
    assert_eq!(report.status, HealthStatus::Healthy);
    assert_eq!(
        report.checks[0].details.get("requests_in_progress").map(String::as_str),
        Some("0")
    );
}

#[tokio::test]
async fn create_request_skips_ids_registered_elsewhere() {
    let h = Harness::new();
    h.created(1, "a").await;
    h.created(2, "b").await;

    let first = h.orchestrator.create_request().await.unwrap();
    assert_eq!(first.id, RequestId::new(3));

    // Another instance takes id 4 behind our back.
    h.created(4, "c").await;
    let second = h.orchestrator.create_request().await.unwrap();
    assert_eq!(second.id, RequestId::new(5));
}

/// Registry whose reads miss one row, as if another instance inserted it
/// right after this one looked.
struct LaggingRegistry {
    inner: InMemoryRequestRegistry,
    unseen: RequestId,
}

impl RequestRegistry for LaggingRegistry {
    fn upsert_on_create_or_retry(
        &self,
        id: RequestId,
    ) -> Pin<Box<dyn Future<Output = Result<Upserted, PersistenceError>> + Send + '_>> {
        self.inner.upsert_on_create_or_retry(id)
    }

    fn set_correlation(
        &self,
        id: RequestId,
        correlation_id: CorrelationId,
    ) -> Pin<Box<dyn Future<Output = Result<(), PersistenceError>> + Send + '_>> {
        self.inner.set_correlation(id, correlation_id)
    }

    fn set_status(
        &self,
        id: RequestId,
        status: RequestStatus,
    ) -> Pin<Box<dyn Future<Output = Result<(), PersistenceError>> + Send + '_>> {
        self.inner.set_status(id, status)
    }

    fn get(
        &self,
        id: RequestId,
    ) -> Pin<Box<dyn Future<Output = Result<Option<Request>, PersistenceError>> + Send + '_>> {
        if id == self.unseen {
            return Box::pin(async { Ok(None) });
        }
        self.inner.get(id)
    }

    fn list_all(
        &self,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<Request>, PersistenceError>> + Send + '_>> {
        self.inner.list_all()
    }

    fn max_id(
        &self,
    ) -> Pin<Box<dyn Future<Output = Result<Option<RequestId>, PersistenceError>> + Send + '_>> {
        Box::pin(async move {
            let ids = self.inner.list_all().await?.into_iter().map(|r| r.id);
            Ok(ids.filter(|id| *id != self.unseen).max())
        })
    }
}

#[tokio::test]
async fn create_request_never_reuses_an_id_taken_after_the_read() {
    let inner = InMemoryRequestRegistry::new();
    for id in 1..=3 {
        inner.insert(Request::new(RequestId::new(id)));
    }
    let registry = LaggingRegistry {
        inner,
        unseen: RequestId::new(3),
    };
    let orchestrator = FailSafeOrchestrator::new(
        FailSafeConfig::default(),
        Arc::new(registry),
        Arc::new(InMemoryPendingEventStore::new()),
        Arc::new(InMemoryEventBus::new()),
    );

    let created = orchestrator.create_request().await.unwrap();
    assert_eq!(created.id, RequestId::new(4));
}

#[tokio::test]
async fn replayed_copy_ahead_of_the_queue_is_applied() {
    let h = Harness::new();
    h.orchestrator.create_request().await.unwrap();
    h.status(1, RequestStatus::Started).await;
    h.status(1, RequestStatus::Pending).await;

    h.bus.accept_only(1);
    let CorrelationOutcome::Correlated { replay } = h.created(1, "abc").await else {
        panic!("expected the gate to open");
    };
    assert_eq!(replay.replayed, 1);
    assert_eq!(h.pending.ordinals(RequestId::new(1)), vec![Ordinal::new(1)]);

    // The republished Started comes back while Pending is still queued.
    let copy: StatusChangeMessage = h.bus.published_to(STATUS_TOPIC)[0]
        .event
        .decode(StatusChangeMessage::EVENT_TYPE)
        .unwrap();
    assert_eq!(copy.replayed_from, Some(Ordinal::FIRST));
    assert_eq!(
        h.orchestrator
            .handle_status_change_requested(copy)
            .await
            .unwrap(),
        StatusChangeOutcome::Applied {
            previous: RequestStatus::New,
            current: RequestStatus::Started,
        }
    );

    // A copy of the change still queued does not jump ahead of it.
    let duplicate = StatusChangeMessage::new(RequestId::new(1), RequestStatus::Pending)
        .with_replay_origin(Ordinal::new(1));
    assert_eq!(
        h.orchestrator
            .handle_status_change_requested(duplicate)
            .await
            .unwrap(),
        StatusChangeOutcome::AlreadyQueued {
            ordinal: Ordinal::new(1)
        }
    );

    // Fresh changes still wait behind the backlog.
    assert_eq!(
        h.status(1, RequestStatus::Completed).await,
        StatusChangeOutcome::Deferred {
            ordinal: Ordinal::new(2)
        }
    );
    assert_eq!(
        h.registry.snapshot(RequestId::new(1)).unwrap().status,
        RequestStatus::Started
    );
}

#[tokio::test]
async fn discard_removes_a_poisoned_event_so_the_queue_can_drain() {
    let h = Harness::new();
    h.orchestrator.create_request().await.unwrap();
    h.status(1, RequestStatus::Started).await;
    h.status(1, RequestStatus::Completed).await;

    let key = PendingEventKey::new(RequestId::new(1), Ordinal::FIRST);
    let removed = h.orchestrator.discard_pending_event(key).await.unwrap();
    assert_eq!(removed.unwrap().ordinal, Ordinal::FIRST);
    assert!(
        h.orchestrator
            .discard_pending_event(key)
            .await
            .unwrap()
            .is_none()
    );

    h.created(1, "abc").await;
    assert_eq!(h.replayed_statuses(), vec![RequestStatus::Completed]);
    // Remaining event keeps its ordinal, so its delay is one interval.
    assert_eq!(
        h.bus.published_to(STATUS_TOPIC)[0].delay,
        Some(Duration::from_secs(5))
    );
}

#[tokio::test]
async fn listings_reflect_current_state() {
    let h = Harness::new();
    h.orchestrator.create_request().await.unwrap();
    h.created(2, "abc").await;
    h.status(1, RequestStatus::Started).await;

    let requests = h.orchestrator.list_requests().await.unwrap();
    assert_eq!(
        requests.iter().map(|r| r.id).collect::<Vec<_>>(),
        vec![RequestId::new(1), RequestId::new(2)]
    );
    let pending = h.orchestrator.list_pending_events().await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].related_request_id, RequestId::new(1));
}

#[tokio::test]
async fn concurrent_deliveries_keep_ordinals_dense() {
    let h = Harness::new();
    h.orchestrator.create_request().await.unwrap();

    let mut handles = Vec::new();
    for _ in 0..24 {
        let orchestrator = Arc::clone(&h.orchestrator);
        handles.push(tokio::spawn(async move {
            orchestrator
                .handle_status_change_requested(StatusChangeMessage::new(
                    RequestId::new(1),
                    RequestStatus::Pending,
                ))
                .await
        }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    let ordinals = h.pending.ordinals(RequestId::new(1));
    assert_eq!(ordinals, (0..24).map(Ordinal::new).collect::<Vec<_>>());
}

#[tokio::test]
async fn correlation_racing_status_changes_loses_nothing() {
    let h = Harness::new();
    h.orchestrator.create_request().await.unwrap();

    let mut handles = Vec::new();
    for _ in 0..16 {
        let orchestrator = Arc::clone(&h.orchestrator);
        handles.push(tokio::spawn(async move {
            orchestrator
                .handle_status_change_requested(StatusChangeMessage::new(
                    RequestId::new(1),
                    RequestStatus::Started,
                ))
                .await
                .unwrap()
        }));
    }
    let orchestrator = Arc::clone(&h.orchestrator);
    let correlate = tokio::spawn(async move {
        orchestrator
            .handle_request_created_or_retried(
                RequestMessage::created(RequestId::new(1))
                    .with_correlation(CorrelationId::new("abc")),
            )
            .await
            .unwrap()
    });

    let mut applied = 0;
    for handle in handles {
        if matches!(handle.await.unwrap(), StatusChangeOutcome::Applied { .. }) {
            applied += 1;
        }
    }
    correlate.await.unwrap();

    // Every change was either applied directly, replayed, or is still queued.
    let replayed = h.bus.published_to(STATUS_TOPIC).len();
    assert_eq!(applied + replayed + h.pending.len(), 16);
}
