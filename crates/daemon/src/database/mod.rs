//! SQLite-backed persistent store.
//!
//! One database holds the identifier tables (internal keys, foreign keys,
//! initial documents, diff archive) and the durable work queue, so a queue
//! write can share a transaction with any other store write.
//!
//! Query modules hang methods off [`Database`]:
//! - [`ident_queries`]: internal/foreign key mapping and initial documents
//! - [`diff_queries`]: diff archive, conflict listing, resolution
//! - [`queue_queries`]: durable FIFO work queue with leases

pub mod diff_queries;
pub mod ident_queries;
pub mod queue_queries;

pub use queue_queries::{Abandoned, Lease, WorkItem};

use std::str::FromStr;

use sqlx::migrate::Migrator;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use thiserror::Error;
use time::OffsetDateTime;

use common::ident::{DiffId, DiffOpId, EntityName, SourceName};

/// Compile migrations at build time from the ./migrations directory.
static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

/// Store failures.
///
/// `Unavailable` is the retryable case: the round trip to the store failed.
/// Everything else reports a semantic refusal or a corrupt row.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(#[from] sqlx::Error),

    #[error("migration failed: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("{entity}/{source_name} already bound to a different foreign key")]
    ForeignKeyConflict {
        entity: EntityName,
        source_name: SourceName,
    },

    #[error("no such diff: {0}")]
    UnknownDiff(DiffId),

    #[error("diff {0} is already resolved")]
    AlreadyResolved(DiffId),

    #[error("op {op} does not belong to diff {diff}")]
    ForeignOp { diff: DiffId, op: DiffOpId },

    #[error("corrupt row in {table}: {detail}")]
    Corrupt {
        table: &'static str,
        detail: String,
    },
}

impl StoreError {
    /// Whether retrying the call can help.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}

/// Database connection pool for the reconciliation store.
#[derive(Debug, Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl std::ops::Deref for Database {
    type Target = SqlitePool;

    fn deref(&self) -> &Self::Target {
        &self.pool
    }
}

impl Database {
    /// Connect to the store behind `dsn` and run migrations.
    ///
    /// Accepts `sqlite://PATH` and `sqlite::memory:`. The pool is sized to
    /// `max_connections` (workers + 1 in the daemon); an in-memory store is
    /// pinned to a single connection so every caller sees the same data.
    pub async fn connect(dsn: &str, max_connections: u32) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(dsn)?
            .create_if_missing(true)
            .foreign_keys(true);

        let max_connections = if dsn.contains(":memory:") {
            1
        } else {
            max_connections.max(1)
        };

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await?;

        let db = Self { pool };
        db.run_migrations().await?;

        tracing::info!("store initialized at {}", dsn);
        Ok(db)
    }

    /// Single-connection in-memory store. Used by tests and demos.
    pub async fn in_memory() -> Result<Self, StoreError> {
        Self::connect("sqlite::memory:", 1).await
    }

    async fn run_migrations(&self) -> Result<(), StoreError> {
        MIGRATOR.run(&self.pool).await?;
        Ok(())
    }
}

/// Seconds since the Unix epoch, as stored in every timestamp column.
pub(crate) fn unix_now() -> i64 {
    OffsetDateTime::now_utc().unix_timestamp()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_in_memory_store() {
        let db = Database::in_memory().await.unwrap();
        let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM internal_keys")
            .fetch_one(&*db)
            .await
            .unwrap();
        assert_eq!(row.0, 0);
    }

    #[tokio::test]
    async fn test_migrations_are_idempotent() {
        let db = Database::in_memory().await.unwrap();
        db.run_migrations().await.unwrap();
    }

    #[tokio::test]
    async fn test_file_backed_store_survives_reconnect() {
        let dir = tempfile::tempdir().unwrap();
        let dsn = format!("sqlite://{}", dir.path().join("retcon.db").display());

        let db = Database::connect(&dsn, 4).await.unwrap();
        sqlx::query("INSERT INTO internal_keys (entity, id, created_at) VALUES ('customer', 1, 0)")
            .execute(&*db)
            .await
            .unwrap();
        db.close().await;

        let db = Database::connect(&dsn, 4).await.unwrap();
        let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM internal_keys")
            .fetch_one(&*db)
            .await
            .unwrap();
        assert_eq!(row.0, 1);
    }
}
