//! Database bootstrap, schema maintenance and lock retry

pub mod init;
pub mod migrations;
pub mod retry;
pub mod schema_sync;
pub mod table_schemas;

pub use init::{init_database, init_schema, load_tuning, DatabaseTuning};
pub use retry::{max_lock_wait_ms, retry_on_lock};

/// In-memory database with the full schema
///
/// A single connection keeps every query on the same in-memory database.
#[cfg(test)]
pub(crate) async fn test_pool() -> sqlx::SqlitePool {
    let pool = sqlx::sqlite::SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .unwrap();
    sqlx::query("PRAGMA foreign_keys = ON")
        .execute(&pool)
        .await
        .unwrap();
    init_schema(&pool).await.unwrap();
    pool
}
