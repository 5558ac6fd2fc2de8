//! Database initialization
//!
//! Startup sequence:
//! 1. `CREATE TABLE IF NOT EXISTS` for every table
//! 2. Automatic schema synchronization (missing columns)
//! 3. Versioned migrations
//! 4. Default settings
//! 5. System default group
//!
//! [`init_database`] runs the sequence on a single-connection bootstrap pool,
//! reads the tuning settings, closes it and opens the production pool.

use crate::Result;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::SqlitePool;
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};

/// Connection tuning read from `app_settings` after bootstrap
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DatabaseTuning {
    pub busy_timeout_ms: u64,
    pub max_lock_wait_ms: u64,
    pub pool_size: u32,
}

impl Default for DatabaseTuning {
    fn default() -> Self {
        Self {
            busy_timeout_ms: 250,
            max_lock_wait_ms: 5000,
            pool_size: 16,
        }
    }
}

fn connect_options(db_path: &Path, busy_timeout_ms: u64) -> SqliteConnectOptions {
    SqliteConnectOptions::new()
        .filename(db_path)
        .create_if_missing(true)
        .foreign_keys(true)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal)
        .busy_timeout(Duration::from_millis(busy_timeout_ms))
}

/// Open (creating if needed) the database file and bring its schema up to date
pub async fn init_database(db_path: &Path) -> Result<SqlitePool> {
    let newly_created = !db_path.exists();

    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let bootstrap = SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(connect_options(db_path, 5000))
        .await?;

    if newly_created {
        info!("Initialized new database: {}", db_path.display());
    } else {
        info!("Opened existing database: {}", db_path.display());
    }

    init_schema(&bootstrap).await?;
    let tuning = load_tuning(&bootstrap).await?;
    bootstrap.close().await;

    let pool = SqlitePoolOptions::new()
        .max_connections(tuning.pool_size)
        .acquire_timeout(Duration::from_millis(tuning.max_lock_wait_ms.max(1000)))
        .connect_with(connect_options(db_path, tuning.busy_timeout_ms))
        .await?;

    info!(
        "Database pool ready: {} connections, busy_timeout={}ms, max_lock_wait={}ms",
        tuning.pool_size, tuning.busy_timeout_ms, tuning.max_lock_wait_ms
    );

    Ok(pool)
}

/// Create, synchronize and migrate the schema on an already-open pool
///
/// Idempotent: safe to call on every startup.
pub async fn init_schema(pool: &SqlitePool) -> Result<()> {
    create_schema_version_table(pool).await?;
    create_app_settings_table(pool).await?;
    create_users_table(pool).await?;
    create_groups_table(pool).await?;
    create_memberships_table(pool).await?;
    create_suggestions_table(pool).await?;
    create_suggestion_votes_table(pool).await?;
    create_rehearsals_table(pool).await?;
    create_performances_table(pool).await?;
    create_rehearsal_events_table(pool).await?;
    create_group_settings_table(pool).await?;
    create_indexes(pool).await?;

    // Add columns missing from tables created by older versions
    crate::db::table_schemas::sync_all_table_schemas(pool).await?;

    // Data transformations that column additions cannot express
    crate::db::migrations::run_migrations(pool).await?;

    init_default_settings(pool).await?;

    crate::groups::ensure_default_group(pool).await?;

    Ok(())
}

/// Read connection tuning from settings, falling back to defaults
pub async fn load_tuning(pool: &SqlitePool) -> Result<DatabaseTuning> {
    let defaults = DatabaseTuning::default();

    let busy_timeout_ms = read_positive_setting(pool, "database_busy_timeout_ms").await?;
    let max_lock_wait_ms = read_positive_setting(pool, "database_max_lock_wait_ms").await?;
    let pool_size = read_positive_setting(pool, "database_pool_size").await?;

    Ok(DatabaseTuning {
        busy_timeout_ms: busy_timeout_ms.map(|v| v as u64).unwrap_or(defaults.busy_timeout_ms),
        max_lock_wait_ms: max_lock_wait_ms.map(|v| v as u64).unwrap_or(defaults.max_lock_wait_ms),
        pool_size: pool_size.map(|v| v as u32).unwrap_or(defaults.pool_size),
    })
}

async fn read_positive_setting(pool: &SqlitePool, key: &str) -> Result<Option<i64>> {
    let value: Option<Option<i64>> =
        sqlx::query_scalar("SELECT CAST(value AS INTEGER) FROM app_settings WHERE key = ?")
            .bind(key)
            .fetch_optional(pool)
            .await?;

    match value.flatten() {
        Some(v) if v > 0 => Ok(Some(v)),
        Some(v) => {
            warn!("Setting '{}' has non-positive value {}, using default", key, v);
            Ok(None)
        }
        None => Ok(None),
    }
}

async fn create_schema_version_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Application-level key/value settings
pub async fn create_app_settings_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS app_settings (
            key TEXT PRIMARY KEY,
            value TEXT,
            updated_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

async fn create_users_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS users (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            handle TEXT NOT NULL UNIQUE COLLATE NOCASE,
            credential TEXT NOT NULL,
            account_role TEXT NOT NULL DEFAULT 'user' CHECK (account_role IN ('user', 'admin')),
            last_group_id INTEGER REFERENCES groups(id) ON DELETE SET NULL,
            created_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

async fn create_groups_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS groups (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL,
            invitation_code TEXT NOT NULL UNIQUE,
            description TEXT,
            logo_url TEXT,
            owner_id INTEGER REFERENCES users(id) ON DELETE SET NULL,
            is_default INTEGER NOT NULL DEFAULT 0,
            created_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

async fn create_memberships_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS memberships (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            user_id INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
            group_id INTEGER NOT NULL REFERENCES groups(id) ON DELETE CASCADE,
            role TEXT NOT NULL DEFAULT 'user' CHECK (role IN ('user', 'moderator', 'admin')),
            nickname TEXT,
            active INTEGER NOT NULL DEFAULT 1,
            joined_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
            UNIQUE (user_id, group_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

async fn create_suggestions_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS suggestions (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            group_id INTEGER NOT NULL REFERENCES groups(id) ON DELETE CASCADE,
            title TEXT NOT NULL,
            author TEXT,
            youtube TEXT,
            url TEXT,
            version_of TEXT,
            likes INTEGER NOT NULL DEFAULT 0 CHECK (likes >= 0),
            creator_id INTEGER NOT NULL REFERENCES users(id),
            created_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

async fn create_suggestion_votes_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS suggestion_votes (
            suggestion_id INTEGER NOT NULL REFERENCES suggestions(id) ON DELETE CASCADE,
            user_id INTEGER NOT NULL REFERENCES users(id),
            count INTEGER NOT NULL DEFAULT 0 CHECK (count >= 0),
            PRIMARY KEY (suggestion_id, user_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

async fn create_rehearsals_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS rehearsals (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            group_id INTEGER NOT NULL REFERENCES groups(id) ON DELETE CASCADE,
            title TEXT NOT NULL,
            author TEXT,
            youtube TEXT,
            spotify TEXT,
            version_of TEXT,
            levels_json TEXT NOT NULL DEFAULT '{}',
            notes_json TEXT NOT NULL DEFAULT '{}',
            audio_notes_json TEXT NOT NULL DEFAULT '{}',
            mastered INTEGER NOT NULL DEFAULT 0,
            creator_id INTEGER NOT NULL REFERENCES users(id),
            created_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Setlists reference rehearsals by value; no foreign key on purpose
async fn create_performances_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS performances (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            group_id INTEGER NOT NULL REFERENCES groups(id) ON DELETE CASCADE,
            name TEXT NOT NULL,
            date TEXT NOT NULL,
            location TEXT,
            songs_json TEXT NOT NULL DEFAULT '[]',
            creator_id INTEGER NOT NULL REFERENCES users(id),
            created_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

async fn create_rehearsal_events_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS rehearsal_events (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            group_id INTEGER NOT NULL REFERENCES groups(id) ON DELETE CASCADE,
            date TEXT NOT NULL,
            location TEXT,
            creator_id INTEGER NOT NULL REFERENCES users(id),
            created_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

async fn create_group_settings_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS group_settings (
            group_id INTEGER PRIMARY KEY REFERENCES groups(id) ON DELETE CASCADE,
            group_name TEXT NOT NULL,
            dark_mode INTEGER NOT NULL DEFAULT 1,
            template TEXT NOT NULL DEFAULT 'classic',
            next_rehearsal_date TEXT,
            next_rehearsal_location TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

async fn create_indexes(pool: &SqlitePool) -> Result<()> {
    let statements = [
        "CREATE INDEX IF NOT EXISTS idx_memberships_group ON memberships(group_id)",
        "CREATE INDEX IF NOT EXISTS idx_suggestions_group ON suggestions(group_id)",
        "CREATE INDEX IF NOT EXISTS idx_rehearsals_group ON rehearsals(group_id)",
        "CREATE INDEX IF NOT EXISTS idx_performances_group ON performances(group_id)",
        "CREATE INDEX IF NOT EXISTS idx_rehearsal_events_group_date ON rehearsal_events(group_id, date)",
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_groups_single_default ON groups(is_default) WHERE is_default = 1",
    ];

    for sql in statements {
        sqlx::query(sql).execute(pool).await?;
    }

    Ok(())
}

/// Initialize or update default settings
///
/// Ensures every required setting exists and resets NULL values to defaults.
async fn init_default_settings(pool: &SqlitePool) -> Result<()> {
    // Connection tuning
    ensure_setting(pool, "database_busy_timeout_ms", "250").await?;
    ensure_setting(pool, "database_max_lock_wait_ms", "5000").await?;
    ensure_setting(pool, "database_pool_size", "16").await?;

    // Group registry
    ensure_setting(pool, "invitation_code_length", "6").await?;
    ensure_setting(pool, "default_group_name", "Band").await?;

    info!("Default settings initialized");
    Ok(())
}

/// Ensure a setting exists with the specified default value
///
/// If the setting doesn't exist, it will be created with the default.
/// If the setting exists but has a NULL value, it will be reset to the default.
async fn ensure_setting(pool: &SqlitePool, key: &str, default_value: &str) -> Result<()> {
    // INSERT OR IGNORE tolerates concurrent initialization
    let inserted = sqlx::query("INSERT OR IGNORE INTO app_settings (key, value) VALUES (?, ?)")
        .bind(key)
        .bind(default_value)
        .execute(pool)
        .await?
        .rows_affected();

    if inserted > 0 {
        info!("Initialized setting '{}' with default value: {}", key, default_value);
        return Ok(());
    }

    let reset = sqlx::query(
        "UPDATE app_settings SET value = ?, updated_at = CURRENT_TIMESTAMP WHERE key = ? AND value IS NULL",
    )
    .bind(default_value)
    .bind(key)
    .execute(pool)
    .await?
    .rows_affected();

    if reset > 0 {
        warn!("Setting '{}' was NULL, reset to default: {}", key, default_value);
    }

    Ok(())
}

/// Read a text setting
pub async fn get_setting(pool: &SqlitePool, key: &str) -> Result<Option<String>> {
    let value: Option<Option<String>> =
        sqlx::query_scalar("SELECT value FROM app_settings WHERE key = ?")
            .bind(key)
            .fetch_optional(pool)
            .await?;

    Ok(value.flatten())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_init_schema_is_idempotent() {
        let pool = crate::db::test_pool().await;
        init_schema(&pool).await.unwrap();

        let groups: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM groups WHERE is_default = 1")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(groups, 1, "Default group must exist exactly once");
    }

    #[tokio::test]
    async fn test_null_setting_is_reset() {
        let pool = crate::db::test_pool().await;

        sqlx::query("UPDATE app_settings SET value = NULL WHERE key = 'invitation_code_length'")
            .execute(&pool)
            .await
            .unwrap();

        init_default_settings(&pool).await.unwrap();

        let value = get_setting(&pool, "invitation_code_length").await.unwrap();
        assert_eq!(value.as_deref(), Some("6"));
    }

    #[tokio::test]
    async fn test_load_tuning_defaults() {
        let pool = crate::db::test_pool().await;
        let tuning = load_tuning(&pool).await.unwrap();
        assert_eq!(tuning, DatabaseTuning::default());
    }

    #[tokio::test]
    async fn test_load_tuning_ignores_non_positive() {
        let pool = crate::db::test_pool().await;

        sqlx::query("UPDATE app_settings SET value = '0' WHERE key = 'database_busy_timeout_ms'")
            .execute(&pool)
            .await
            .unwrap();
        sqlx::query("UPDATE app_settings SET value = '900' WHERE key = 'database_max_lock_wait_ms'")
            .execute(&pool)
            .await
            .unwrap();

        let tuning = load_tuning(&pool).await.unwrap();
        assert_eq!(tuning.busy_timeout_ms, 250);
        assert_eq!(tuning.max_lock_wait_ms, 900);
    }
}
