//! Property: whatever is deferred comes back out in arrival order, spaced by
//! the replay interval.

#![allow(clippy::unwrap_used)]

use failsafe_core::event_bus::EventBus;
use failsafe_core::message::{RequestMessage, StatusChangeMessage};
use failsafe_core::pending::PendingEventStore;
use failsafe_core::registry::RequestRegistry;
use failsafe_core::request::{CorrelationId, RequestId, RequestStatus};
use failsafe_runtime::{FailSafeConfig, FailSafeOrchestrator};
use failsafe_testing::{InMemoryEventBus, InMemoryPendingEventStore, InMemoryRequestRegistry};
use proptest::prelude::*;
use std::sync::Arc;
use std::time::Duration;
use tokio_test::block_on;

fn any_status() -> impl Strategy<Value = RequestStatus> {
    proptest::sample::select(RequestStatus::ALL.to_vec())
}

async fn defer_then_correlate(
    statuses: &[RequestStatus],
    interval_secs: u64,
    accepted: Option<usize>,
) -> (Vec<(RequestStatus, Duration)>, usize) {
    let registry = Arc::new(InMemoryRequestRegistry::new());
    let pending = Arc::new(InMemoryPendingEventStore::new());
    let bus = Arc::new(InMemoryEventBus::new());
    let config = FailSafeConfig::default().with_replay_interval(Duration::from_secs(interval_secs));
    let topic = config.status_change_topic.clone();
    let orchestrator = FailSafeOrchestrator::new(
        config,
        Arc::clone(&registry) as Arc<dyn RequestRegistry>,
        Arc::clone(&pending) as Arc<dyn PendingEventStore>,
        Arc::clone(&bus) as Arc<dyn EventBus>,
    );

    let request = orchestrator.create_request().await.unwrap();
    for status in statuses {
        orchestrator
            .handle_status_change_requested(StatusChangeMessage::new(request.id, *status))
            .await
            .unwrap();
    }

    if let Some(count) = accepted {
        bus.accept_only(count);
    }
    orchestrator
        .handle_request_created_or_retried(
            RequestMessage::created(request.id).with_correlation(CorrelationId::new("abc")),
        )
        .await
        .unwrap();

    let replayed = bus
        .published_to(&topic)
        .into_iter()
        .map(|p| {
            let message: StatusChangeMessage =
                p.event.decode(StatusChangeMessage::EVENT_TYPE).unwrap();
            assert_eq!(message.id, RequestId::FIRST);
            (message.new_status, p.delay.unwrap())
        })
        .collect();
    (replayed, pending.len())
}

proptest! {
    #[test]
    fn replay_reproduces_arrival_order(
        statuses in proptest::collection::vec(any_status(), 1..12),
        interval_secs in 1u64..30,
    ) {
        let (replayed, left) = block_on(defer_then_correlate(&statuses, interval_secs, None));

        let expected: Vec<_> = statuses
            .iter()
            .zip(0u64..)
            .map(|(status, n)| (*status, Duration::from_secs(n * interval_secs)))
            .collect();
        prop_assert_eq!(replayed, expected);
        prop_assert_eq!(left, 0);
    }

    #[test]
    fn halted_replay_publishes_a_prefix_and_keeps_the_rest(
        statuses in proptest::collection::vec(any_status(), 1..12),
        accepted in 0usize..12,
    ) {
        let (replayed, left) = block_on(defer_then_correlate(&statuses, 5, Some(accepted)));

        let published = accepted.min(statuses.len());
        let replayed_statuses: Vec<_> = replayed.iter().map(|(status, _)| *status).collect();
        prop_assert_eq!(&replayed_statuses[..], &statuses[..published]);
        prop_assert_eq!(left, statuses.len() - published);
    }
}
