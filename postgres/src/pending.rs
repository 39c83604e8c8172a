//! `PostgreSQL`-backed [`PendingEventStore`].
//!
//! Ordinal assignment runs in one transaction:
//!
//! 1. `pg_advisory_xact_lock(request_id)` serializes enqueues for the request
//!    across every process sharing the database
//! 2. `MAX(ordinal) + 1` (or 0) is read under that lock
//! 3. the row is inserted and the transaction commits, releasing the lock

use chrono::{DateTime, Utc};
use failsafe_core::pending::{
    NewPendingEvent, Ordinal, PendingEvent, PendingEventKey, PendingEventKind, PendingEventStore,
};
use failsafe_core::persistence::PersistenceError;
use failsafe_core::request::RequestId;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use std::future::Future;
use std::pin::Pin;

const SELECT_COLUMNS: &str = "related_request_id, ordinal, payload, payload_kind, destination_topic, enqueued_at";

/// Pending events in the `failsafe_pending_events` table.
#[derive(Clone, Debug)]
pub struct PostgresPendingEventStore {
    pool: PgPool,
}

impl PostgresPendingEventStore {
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

fn ordinal_to_db(ordinal: Ordinal) -> Result<i64, PersistenceError> {
    i64::try_from(ordinal.value())
        .map_err(|_| PersistenceError::Serialization(format!("Ordinal out of range: {ordinal}")))
}

fn ordinal_from_db(value: i64) -> Result<Ordinal, PersistenceError> {
    u64::try_from(value)
        .map(Ordinal::new)
        .map_err(|_| PersistenceError::Serialization(format!("Negative ordinal: {value}")))
}

fn pending_from_row(row: &PgRow) -> Result<PendingEvent, PersistenceError> {
    let decode = |e: sqlx::Error| PersistenceError::Serialization(e.to_string());

    let related_request_id: i64 = row.try_get("related_request_id").map_err(decode)?;
    let ordinal: i64 = row.try_get("ordinal").map_err(decode)?;
    let payload_kind: String = row.try_get("payload_kind").map_err(decode)?;
    let enqueued_at: DateTime<Utc> = row.try_get("enqueued_at").map_err(decode)?;

    Ok(PendingEvent {
        related_request_id: RequestId::new(related_request_id),
        ordinal: ordinal_from_db(ordinal)?,
        payload: row.try_get("payload").map_err(decode)?,
        payload_kind: PendingEventKind::parse(&payload_kind)
            .map_err(|e| PersistenceError::Serialization(e.to_string()))?,
        destination_topic: row.try_get("destination_topic").map_err(decode)?,
        enqueued_at,
    })
}

impl PendingEventStore for PostgresPendingEventStore {
    fn enqueue(
        &self,
        event: NewPendingEvent,
    ) -> Pin<Box<dyn Future<Output = Result<PendingEvent, PersistenceError>> + Send + '_>> {
        Box::pin(async move {
            let request_id = event.related_request_id;
            let mut tx = self
                .pool
                .begin()
                .await
                .map_err(|e| database_error("Failed to start transaction", &e))?;

            sqlx::query("SELECT pg_advisory_xact_lock($1)")
                .bind(request_id.value())
                .execute(&mut *tx)
                .await
                .map_err(|e| database_error("Failed to lock request queue", &e))?;

            let max: (Option<i64>,) = sqlx::query_as(
                "SELECT MAX(ordinal) FROM failsafe_pending_events WHERE related_request_id = $1",
            )
            .bind(request_id.value())
            .fetch_one(&mut *tx)
            .await
            .map_err(|e| database_error("Failed to read queue tail", &e))?;

            let current_max = max.0.map(ordinal_from_db).transpose()?;
            let ordinal = Ordinal::after(current_max);

            let enqueued_at: (DateTime<Utc>,) = sqlx::query_as(
                r"
                INSERT INTO failsafe_pending_events
                    (related_request_id, ordinal, payload, payload_kind, destination_topic)
                VALUES ($1, $2, $3, $4, $5)
                RETURNING enqueued_at
                ",
            )
            .bind(request_id.value())
            .bind(ordinal_to_db(ordinal)?)
            .bind(&event.payload)
            .bind(event.payload_kind.as_str())
            .bind(&event.destination_topic)
            .fetch_one(&mut *tx)
            .await
            .map_err(|e| {
                if let sqlx::Error::Database(db_err) = &e {
                    if db_err.is_unique_violation() {
                        metrics::counter!("failsafe_pending_ordinal_collisions_total").increment(1);
                        return PersistenceError::OrdinalCollision {
                            request_id,
                            ordinal,
                        };
                    }
                }
                database_error("Failed to insert pending event", &e)
            })?;

            tx.commit()
                .await
                .map_err(|e| database_error("Failed to commit transaction", &e))?;

            tracing::debug!(
                request_id = %request_id,
                ordinal = %ordinal,
                "Pending event stored"
            );

            Ok(PendingEvent {
                related_request_id: request_id,
                ordinal,
                payload: event.payload,
                payload_kind: event.payload_kind,
                destination_topic: event.destination_topic,
                enqueued_at: enqueued_at.0,
            })
        })
    }

    fn list_ordered(
        &self,
        request_id: RequestId,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<PendingEvent>, PersistenceError>> + Send + '_>> {
        Box::pin(async move {
            let rows = sqlx::query(&format!(
                "SELECT {SELECT_COLUMNS} FROM failsafe_pending_events \
                 WHERE related_request_id = $1 ORDER BY ordinal"
            ))
            .bind(request_id.value())
            .fetch_all(&self.pool)
            .await
            .map_err(|e| database_error("Failed to list pending events", &e))?;

            rows.iter().map(pending_from_row).collect()
        })
    }

    fn has_pending(
        &self,
        request_id: RequestId,
    ) -> Pin<Box<dyn Future<Output = Result<bool, PersistenceError>> + Send + '_>> {
        Box::pin(async move {
            let exists: (bool,) = sqlx::query_as(
                "SELECT EXISTS (SELECT 1 FROM failsafe_pending_events WHERE related_request_id = $1)",
            )
            .bind(request_id.value())
            .fetch_one(&self.pool)
            .await
            .map_err(|e| database_error("Failed to check pending events", &e))?;

            Ok(exists.0)
        })
    }

    fn remove(
        &self,
        key: PendingEventKey,
    ) -> Pin<Box<dyn Future<Output = Result<(), PersistenceError>> + Send + '_>> {
        Box::pin(async move {
            sqlx::query(
                "DELETE FROM failsafe_pending_events WHERE related_request_id = $1 AND ordinal = $2",
            )
            .bind(key.request_id.value())
            .bind(ordinal_to_db(key.ordinal)?)
            .execute(&self.pool)
            .await
            .map_err(|e| database_error("Failed to remove pending event", &e))?;

            Ok(())
        })
    }

    fn list_all(
        &self,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<PendingEvent>, PersistenceError>> + Send + '_>> {
        Box::pin(async move {
            let rows = sqlx::query(&format!(
                "SELECT {SELECT_COLUMNS} FROM failsafe_pending_events \
                 ORDER BY related_request_id, ordinal"
            ))
            .fetch_all(&self.pool)
            .await
            .map_err(|e| database_error("Failed to list pending events", &e))?;

            rows.iter().map(pending_from_row).collect()
        })
    }
}
