//! In-memory [`RequestRegistry`].

#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity
#![allow(clippy::missing_panics_doc)]

use failsafe_core::persistence::PersistenceError;
use failsafe_core::registry::{RequestRegistry, Upserted};
use failsafe_core::request::{CorrelationId, Request, RequestId, RequestStatus};
use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, RwLock};

/// `BTreeMap`-backed request registry, ordered by id.
///
/// # Example
///
/// ```
/// use failsafe_testing::InMemoryRequestRegistry;
/// use failsafe_core::registry::{RequestRegistry, Upserted};
/// use failsafe_core::request::RequestId;
///
/// # tokio_test::block_on(async {
/// let registry = InMemoryRequestRegistry::new();
/// assert!(registry.upsert_on_create_or_retry(RequestId::new(5)).await.unwrap().inserted);
/// assert!(!registry.upsert_on_create_or_retry(RequestId::new(5)).await.unwrap().inserted);
/// assert_eq!(registry.len(), 1);
/// # });
/// ```
#[derive(Clone, Debug, Default)]
pub struct InMemoryRequestRegistry {
    requests: Arc<RwLock<BTreeMap<RequestId, Request>>>,
}

impl InMemoryRequestRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored requests.
    #[must_use]
    pub fn len(&self) -> usize {
        self.requests.read().unwrap().len()
    }

    /// Whether no request has been stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.requests.read().unwrap().is_empty()
    }

    /// Store a row as-is, replacing any existing one.
    pub fn insert(&self, request: Request) {
        self.requests.write().unwrap().insert(request.id, request);
    }

    /// Synchronous lookup for assertions.
    #[must_use]
    pub fn snapshot(&self, id: RequestId) -> Option<Request> {
        self.requests.read().unwrap().get(&id).cloned()
    }
}

impl RequestRegistry for InMemoryRequestRegistry {
    fn upsert_on_create_or_retry(
        &self,
        id: RequestId,
    ) -> Pin<Box<dyn Future<Output = Result<Upserted, PersistenceError>> + Send + '_>> {
        Box::pin(async move {
            let mut requests = self.requests.write().unwrap();
            let inserted = !requests.contains_key(&id);
            let request = requests.entry(id).or_insert_with(|| Request::new(id)).clone();
            Ok(Upserted { request, inserted })
        })
    }

    fn set_correlation(
        &self,
        id: RequestId,
        correlation_id: CorrelationId,
    ) -> Pin<Box<dyn Future<Output = Result<(), PersistenceError>> + Send + '_>> {
        Box::pin(async move {
            let mut requests = self.requests.write().unwrap();
            let request = requests
                .get_mut(&id)
                .ok_or(PersistenceError::UnknownRequest(id))?;
            request.correlation_id = Some(correlation_id);
            Ok(())
        })
    }

    fn set_status(
        &self,
        id: RequestId,
        status: RequestStatus,
    ) -> Pin<Box<dyn Future<Output = Result<(), PersistenceError>> + Send + '_>> {
        Box::pin(async move {
            let mut requests = self.requests.write().unwrap();
            let request = requests
                .get_mut(&id)
                .ok_or(PersistenceError::UnknownRequest(id))?;
            request.status = status;
            Ok(())
        })
    }

    fn get(
        &self,
        id: RequestId,
    ) -> Pin<Box<dyn Future<Output = Result<Option<Request>, PersistenceError>> + Send + '_>> {
        Box::pin(async move { Ok(self.requests.read().unwrap().get(&id).cloned()) })
    }

    fn list_all(
        &self,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<Request>, PersistenceError>> + Send + '_>> {
        Box::pin(async move { Ok(self.requests.read().unwrap().values().cloned().collect()) })
    }

    fn max_id(
        &self,
    ) -> Pin<Box<dyn Future<Output = Result<Option<RequestId>, PersistenceError>> + Send + '_>> {
        Box::pin(async move { Ok(self.requests.read().unwrap().keys().next_back().copied()) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn upsert_keeps_existing_status_and_correlation() {
        let registry = InMemoryRequestRegistry::new();
        let id = RequestId::new(2);

        assert!(registry.upsert_on_create_or_retry(id).await.unwrap().inserted);
        registry
            .set_correlation(id, CorrelationId::new("abc"))
            .await
            .unwrap();
        registry.set_status(id, RequestStatus::Started).await.unwrap();

        let again = registry.upsert_on_create_or_retry(id).await.unwrap();
        assert!(!again.inserted);
        assert_eq!(again.request.status, RequestStatus::Started);
        assert_eq!(again.request.correlation_id, Some(CorrelationId::new("abc")));
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn set_status_on_unknown_request_fails() {
        let registry = InMemoryRequestRegistry::new();
        let result = registry
            .set_status(RequestId::new(999), RequestStatus::Completed)
            .await;

        assert_eq!(
            result,
            Err(PersistenceError::UnknownRequest(RequestId::new(999)))
        );
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn max_id_tracks_highest_key() {
        let registry = InMemoryRequestRegistry::new();
        assert_eq!(registry.max_id().await.unwrap(), None);

        registry.upsert_on_create_or_retry(RequestId::new(3)).await.unwrap();
        registry.upsert_on_create_or_retry(RequestId::new(1)).await.unwrap();

        assert_eq!(registry.max_id().await.unwrap(), Some(RequestId::new(3)));
        let ids: Vec<_> = registry
            .list_all()
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.id)
            .collect();
        assert_eq!(ids, vec![RequestId::new(1), RequestId::new(3)]);
    }
}
