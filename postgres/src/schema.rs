//! Table definitions, applied idempotently at startup.

use failsafe_core::persistence::PersistenceError;
use sqlx::PgPool;

const CREATE_REQUESTS: &str = r"
    CREATE TABLE IF NOT EXISTS failsafe_requests (
        id BIGINT PRIMARY KEY,
        correlation_id TEXT,
        status TEXT NOT NULL DEFAULT 'new',
        created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
        updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
    )
";

const CREATE_PENDING_EVENTS: &str = r"
    CREATE TABLE IF NOT EXISTS failsafe_pending_events (
        related_request_id BIGINT NOT NULL,
        ordinal BIGINT NOT NULL CHECK (ordinal >= 0),
        payload BYTEA NOT NULL,
        payload_kind TEXT NOT NULL,
        destination_topic TEXT NOT NULL,
        enqueued_at TIMESTAMPTZ NOT NULL DEFAULT now(),
        PRIMARY KEY (related_request_id, ordinal)
    )
";

/// Create the tables if they do not exist yet.
///
/// # Errors
///
/// Returns [`PersistenceError::Database`] if a statement fails.
pub async fn bootstrap(pool: &PgPool) -> Result<(), PersistenceError> {
    for statement in [CREATE_REQUESTS, CREATE_PENDING_EVENTS] {
        sqlx::query(statement)
            .execute(pool)
            .await
            .map_err(|e| PersistenceError::Database(format!("Failed to apply schema: {e}")))?;
    }
    tracing::info!("Failsafe schema ready");
    Ok(())
}
