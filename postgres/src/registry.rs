//! `PostgreSQL`-backed [`RequestRegistry`].

use failsafe_core::persistence::PersistenceError;
use failsafe_core::registry::{RequestRegistry, Upserted};
use failsafe_core::request::{CorrelationId, Request, RequestId, RequestStatus};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use std::future::Future;
use std::pin::Pin;

/// Request rows in the `failsafe_requests` table.
#[derive(Clone, Debug)]
pub struct PostgresRequestRegistry {
    pool: PgPool,
}

impl PostgresRequestRegistry {
    /// Wrap an existing pool.
    #[must_use]
    pub const fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// The underlying pool.
    #[must_use]
    pub const fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn database_error(context: &str, e: &sqlx::Error) -> PersistenceError {
    PersistenceError::Database(format!("{context}: {e}"))
}

fn request_from_row(row: &PgRow) -> Result<Request, PersistenceError> {
    let id: i64 = row
        .try_get("id")
        .map_err(|e| PersistenceError::Serialization(e.to_string()))?;
    let correlation_id: Option<String> = row
        .try_get("correlation_id")
        .map_err(|e| PersistenceError::Serialization(e.to_string()))?;
    let status: String = row
        .try_get("status")
        .map_err(|e| PersistenceError::Serialization(e.to_string()))?;

    Ok(Request {
        id: RequestId::new(id),
        correlation_id: correlation_id.map(CorrelationId::new),
        status: RequestStatus::parse(&status)
            .map_err(|e| PersistenceError::Serialization(e.to_string()))?,
    })
}

impl RequestRegistry for PostgresRequestRegistry {
    fn upsert_on_create_or_retry(
        &self,
        id: RequestId,
    ) -> Pin<Box<dyn Future<Output = Result<Upserted, PersistenceError>> + Send + '_>> {
        Box::pin(async move {
            // A conflicting row from another instance makes this a no-op.
            let result = sqlx::query(
                r"
                INSERT INTO failsafe_requests (id, status)
                VALUES ($1, $2)
                ON CONFLICT (id) DO NOTHING
                ",
            )
            .bind(id.value())
            .bind(RequestStatus::New.as_str())
            .execute(&self.pool)
            .await
            .map_err(|e| database_error("Failed to upsert request", &e))?;

            let request = self
                .get(id)
                .await?
                .ok_or(PersistenceError::UnknownRequest(id))?;
            Ok(Upserted {
                request,
                inserted: result.rows_affected() == 1,
            })
        })
    }

    fn set_correlation(
        &self,
        id: RequestId,
        correlation_id: CorrelationId,
    ) -> Pin<Box<dyn Future<Output = Result<(), PersistenceError>> + Send + '_>> {
        Box::pin(async move {
            let result = sqlx::query(
                r"
                UPDATE failsafe_requests
                SET correlation_id = $2, updated_at = now()
                WHERE id = $1
                ",
            )
            .bind(id.value())
            .bind(correlation_id.as_str())
            .execute(&self.pool)
            .await
            .map_err(|e| database_error("Failed to set correlation id", &e))?;

            if result.rows_affected() == 0 {
                return Err(PersistenceError::UnknownRequest(id));
            }
            Ok(())
        })
    }

    fn set_status(
        &self,
        id: RequestId,
        status: RequestStatus,
    ) -> Pin<Box<dyn Future<Output = Result<(), PersistenceError>> + Send + '_>> {
        Box::pin(async move {
            let result = sqlx::query(
                r"
                UPDATE failsafe_requests
                SET status = $2, updated_at = now()
                WHERE id = $1
                ",
            )
            .bind(id.value())
            .bind(status.as_str())
            .execute(&self.pool)
            .await
            .map_err(|e| database_error("Failed to set status", &e))?;

            if result.rows_affected() == 0 {
                return Err(PersistenceError::UnknownRequest(id));
            }
            Ok(())
        })
    }

    fn get(
        &self,
        id: RequestId,
    ) -> Pin<Box<dyn Future<Output = Result<Option<Request>, PersistenceError>> + Send + '_>> {
        Box::pin(async move {
            let row = sqlx::query(
                "SELECT id, correlation_id, status FROM failsafe_requests WHERE id = $1",
            )
            .bind(id.value())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| database_error("Failed to load request", &e))?;

            row.as_ref().map(request_from_row).transpose()
        })
    }

    fn list_all(
        &self,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<Request>, PersistenceError>> + Send + '_>> {
        Box::pin(async move {
            let rows =
                sqlx::query("SELECT id, correlation_id, status FROM failsafe_requests ORDER BY id")
                    .fetch_all(&self.pool)
                    .await
                    .map_err(|e| database_error("Failed to list requests", &e))?;

            rows.iter().map(request_from_row).collect()
        })
    }

    fn max_id(
        &self,
    ) -> Pin<Box<dyn Future<Output = Result<Option<RequestId>, PersistenceError>> + Send + '_>> {
        Box::pin(async move {
            let max: (Option<i64>,) = sqlx::query_as("SELECT MAX(id) FROM failsafe_requests")
                .fetch_one(&self.pool)
                .await
                .map_err(|e| database_error("Failed to read max id", &e))?;

            Ok(max.0.map(RequestId::new))
        })
    }
}
