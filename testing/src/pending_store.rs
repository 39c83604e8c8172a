//! In-memory [`PendingEventStore`].

#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity
#![allow(clippy::missing_panics_doc)]

use failsafe_core::environment::{Clock, SystemClock};
use failsafe_core::pending::{
    NewPendingEvent, Ordinal, PendingEvent, PendingEventKey, PendingEventStore,
};
use failsafe_core::persistence::PersistenceError;
use failsafe_core::request::RequestId;
use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, RwLock};

/// Pending events keyed by `(request, ordinal)`.
///
/// The write lock is held across "read max ordinal, insert", so ordinal
/// assignment is atomic for every request.
#[derive(Clone)]
pub struct InMemoryPendingEventStore {
    events: Arc<RwLock<BTreeMap<PendingEventKey, PendingEvent>>>,
    clock: Arc<dyn Clock>,
}

impl InMemoryPendingEventStore {
    /// Create an empty store stamped by the system clock.
    #[must_use]
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Create an empty store stamped by `clock`.
    #[must_use]
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            events: Arc::new(RwLock::new(BTreeMap::new())),
            clock,
        }
    }

    /// Total number of pending events across all requests.
    #[must_use]
    pub fn len(&self) -> usize {
        self.events.read().unwrap().len()
    }

    /// Whether the store holds no event.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.read().unwrap().is_empty()
    }

    /// Store a fully-formed event, bypassing ordinal assignment.
    ///
    /// Lets tests plant rows a real store could hold, such as payloads that
    /// no longer decode.
    pub fn insert_raw(&self, event: PendingEvent) {
        self.events.write().unwrap().insert(event.key(), event);
    }

    /// Ordinals currently queued for `request_id`, ascending.
    #[must_use]
    pub fn ordinals(&self, request_id: RequestId) -> Vec<Ordinal> {
        self.events
            .read()
            .unwrap()
            .keys()
            .filter(|key| key.request_id == request_id)
            .map(|key| key.ordinal)
            .collect()
    }
}

impl Default for InMemoryPendingEventStore {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for InMemoryPendingEventStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryPendingEventStore")
            .field("len", &self.len())
            .finish_non_exhaustive()
    }
}

fn request_range(
    request_id: RequestId,
) -> std::ops::RangeInclusive<PendingEventKey> {
    PendingEventKey::new(request_id, Ordinal::FIRST)..=PendingEventKey::new(request_id, Ordinal::new(u64::MAX))
}

impl PendingEventStore for InMemoryPendingEventStore {
    fn enqueue(
        &self,
        event: NewPendingEvent,
    ) -> Pin<Box<dyn Future<Output = Result<PendingEvent, PersistenceError>> + Send + '_>> {
        Box::pin(async move {
            let mut events = self.events.write().unwrap();
            let current_max = events
                .range(request_range(event.related_request_id))
                .next_back()
                .map(|(key, _)| key.ordinal);
            let ordinal = Ordinal::after(current_max);
            let key = PendingEventKey::new(event.related_request_id, ordinal);
            if events.contains_key(&key) {
                return Err(PersistenceError::OrdinalCollision {
                    request_id: key.request_id,
                    ordinal,
                });
            }

            let stored = PendingEvent {
                related_request_id: event.related_request_id,
                ordinal,
                payload: event.payload,
                payload_kind: event.payload_kind,
                destination_topic: event.destination_topic,
                enqueued_at: self.clock.now(),
            };
            events.insert(key, stored.clone());
            Ok(stored)
        })
    }

    fn list_ordered(
        &self,
        request_id: RequestId,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<PendingEvent>, PersistenceError>> + Send + '_>> {
        Box::pin(async move {
            Ok(self
                .events
                .read()
                .unwrap()
                .range(request_range(request_id))
                .map(|(_, event)| event.clone())
                .collect())
        })
    }

    fn has_pending(
        &self,
        request_id: RequestId,
    ) -> Pin<Box<dyn Future<Output = Result<bool, PersistenceError>> + Send + '_>> {
        Box::pin(async move {
            Ok(self
                .events
                .read()
                .unwrap()
                .range(request_range(request_id))
                .next()
                .is_some())
        })
    }

    fn remove(
        &self,
        key: PendingEventKey,
    ) -> Pin<Box<dyn Future<Output = Result<(), PersistenceError>> + Send + '_>> {
        Box::pin(async move {
            self.events.write().unwrap().remove(&key);
            Ok(())
        })
    }

    fn list_all(
        &self,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<PendingEvent>, PersistenceError>> + Send + '_>> {
        Box::pin(async move { Ok(self.events.read().unwrap().values().cloned().collect()) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mocks::test_clock;
    use failsafe_core::pending::PendingEventKind;

    fn parked(request: i64, payload: u8) -> NewPendingEvent {
        NewPendingEvent {
            related_request_id: RequestId::new(request),
            payload: vec![payload],
            payload_kind: PendingEventKind::StatusChange,
            destination_topic: "status".to_string(),
        }
    }

    #[tokio::test]
    async fn ordinals_start_at_zero_per_request() {
        let store = InMemoryPendingEventStore::with_clock(Arc::new(test_clock()));

        store.enqueue(parked(7, 1)).await.unwrap();
        store.enqueue(parked(8, 1)).await.unwrap();
        store.enqueue(parked(7, 2)).await.unwrap();
        let third = store.enqueue(parked(7, 3)).await.unwrap();

        assert_eq!(third.ordinal, Ordinal::new(2));
        assert_eq!(third.enqueued_at, test_clock().now());
        assert_eq!(
            store.ordinals(RequestId::new(7)),
            vec![Ordinal::new(0), Ordinal::new(1), Ordinal::new(2)]
        );
        assert_eq!(store.ordinals(RequestId::new(8)), vec![Ordinal::new(0)]);
    }

    #[tokio::test]
    async fn ordinals_continue_after_a_removal() {
        let store = InMemoryPendingEventStore::new();
        let first = store.enqueue(parked(1, 1)).await.unwrap();
        store.enqueue(parked(1, 2)).await.unwrap();

        store.remove(first.key()).await.unwrap();
        let next = store.enqueue(parked(1, 3)).await.unwrap();

        assert_eq!(next.ordinal, Ordinal::new(2));
    }

    #[tokio::test]
    async fn remove_is_idempotent() {
        let store = InMemoryPendingEventStore::new();
        let event = store.enqueue(parked(3, 1)).await.unwrap();

        store.remove(event.key()).await.unwrap();
        store.remove(event.key()).await.unwrap();
        store
            .remove(PendingEventKey::new(RequestId::new(42), Ordinal::new(9)))
            .await
            .unwrap();

        assert!(!store.has_pending(RequestId::new(3)).await.unwrap());
    }

    #[tokio::test]
    async fn concurrent_enqueues_get_distinct_ordinals() {
        let store = InMemoryPendingEventStore::new();

        let handles: Vec<_> = (0..32u8)
            .map(|n| {
                let store = store.clone();
                tokio::spawn(async move { store.enqueue(parked(5, n)).await.unwrap().ordinal })
            })
            .collect();

        let mut ordinals = Vec::new();
        for handle in handles {
            ordinals.push(handle.await.unwrap().value());
        }
        ordinals.sort_unstable();

        assert_eq!(ordinals, (0..32).collect::<Vec<u64>>());
    }
}
