//! `PostgreSQL` storage for the failsafe engine.
//!
//! Implements [`RequestRegistry`](failsafe_core::registry::RequestRegistry) and
//! [`PendingEventStore`](failsafe_core::pending::PendingEventStore) on top of a
//! shared sqlx connection pool.
//!
//! - Creation is idempotent through `INSERT .. ON CONFLICT DO NOTHING`
//! - Ordinals are assigned inside a transaction holding a per-request advisory
//!   lock, so concurrent enqueues for one request never collide
//! - The `(related_request_id, ordinal)` primary key backs that up
//!
//! # Example
//!
//! ```ignore
//! use failsafe_postgres::{PostgresPendingEventStore, PostgresRequestRegistry, connect};
//!
//! async fn example() -> Result<(), Box<dyn std::error::Error>> {
//!     let pool = connect("postgres://localhost/failsafe", 10).await?;
//!     failsafe_postgres::schema::bootstrap(&pool).await?;
//!
//!     let registry = PostgresRequestRegistry::from_pool(pool.clone());
//!     let pending = PostgresPendingEventStore::from_pool(pool);
//!     Ok(())
//! }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use failsafe_core::persistence::PersistenceError;
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;

pub mod pending;
pub mod registry;
pub mod schema;

pub use pending::PostgresPendingEventStore;
pub use registry::PostgresRequestRegistry;

/// Open a connection pool.
///
/// # Errors
///
/// Returns [`PersistenceError::Database`] if the database cannot be reached.
pub async fn connect(database_url: &str, max_connections: u32) -> Result<PgPool, PersistenceError> {
    PgPoolOptions::new()
        .max_connections(max_connections)
        .connect(database_url)
        .await
        .map_err(|e| PersistenceError::Database(format!("Failed to connect: {e}")))
}
