//! Request registry: the durable map of request id → correlation and status.
//!
//! # Implementations
//!
//! - `PostgresRequestRegistry` (in `failsafe-postgres`): production storage
//! - `InMemoryRequestRegistry` (in `failsafe-testing`): fast, deterministic tests
//!
//! # Contract
//!
//! - [`upsert_on_create_or_retry`](RequestRegistry::upsert_on_create_or_retry)
//!   is idempotent: a second call for the same id never creates a second row and
//!   never touches the status of an existing row. It reports whether this very
//!   call created the row, which is what id allocation relies on when several
//!   instances share one registry.
//! - Status is changed only through [`set_status`](RequestRegistry::set_status),
//!   which the correlation gate calls on its apply path.
//! - Rows are never deleted.

use crate::persistence::PersistenceError;
use crate::request::{CorrelationId, Request, RequestId, RequestStatus};
use std::future::Future;
use std::pin::Pin;

/// Result of [`RequestRegistry::upsert_on_create_or_retry`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Upserted {
    /// The row as stored after the call.
    pub request: Request,
    /// `true` if this call created the row.
    pub inserted: bool,
}

/// Durable store of [`Request`] rows.
///
/// # Dyn Compatibility
///
/// Methods return `Pin<Box<dyn Future>>` instead of using `async fn` so the
/// registry can be shared as `Arc<dyn RequestRegistry>`.
pub trait RequestRegistry: Send + Sync {
    /// Insert a `New`, uncorrelated row for `id` unless one already exists.
    ///
    /// The existence check and the insert are one atomic step: of two
    /// concurrent calls for the same id, exactly one sees `inserted == true`.
    ///
    /// # Errors
    ///
    /// - `Database`: the storage engine failed
    fn upsert_on_create_or_retry(
        &self,
        id: RequestId,
    ) -> Pin<Box<dyn Future<Output = Result<Upserted, PersistenceError>> + Send + '_>>;

    /// Record the correlation id assigned to `id`.
    ///
    /// # Errors
    ///
    /// - `UnknownRequest`: no row exists for `id`
    /// - `Database`: the storage engine failed
    fn set_correlation(
        &self,
        id: RequestId,
        correlation_id: CorrelationId,
    ) -> Pin<Box<dyn Future<Output = Result<(), PersistenceError>> + Send + '_>>;

    /// Change the status of `id`.
    ///
    /// # Errors
    ///
    /// - `UnknownRequest`: no row exists for `id`
    /// - `Database`: the storage engine failed
    fn set_status(
        &self,
        id: RequestId,
        status: RequestStatus,
    ) -> Pin<Box<dyn Future<Output = Result<(), PersistenceError>> + Send + '_>>;

    /// Load the row for `id`, or `None` if it was never created.
    ///
    /// # Errors
    ///
    /// - `Database`: the storage engine failed
    fn get(
        &self,
        id: RequestId,
    ) -> Pin<Box<dyn Future<Output = Result<Option<Request>, PersistenceError>> + Send + '_>>;

    /// Snapshot of every request, ordered by id.
    ///
    /// # Errors
    ///
    /// - `Database`: the storage engine failed
    fn list_all(
        &self,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<Request>, PersistenceError>> + Send + '_>>;

    /// Highest id recorded so far, used to seed id allocation.
    ///
    /// # Errors
    ///
    /// - `Database`: the storage engine failed
    fn max_id(
        &self,
    ) -> Pin<Box<dyn Future<Output = Result<Option<RequestId>, PersistenceError>> + Send + '_>>;
}
