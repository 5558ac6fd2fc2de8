//! Database schema migrations
//!
//! Versioned, idempotent data migrations tracked in `schema_version`.
//!
//! # Migration Guidelines
//!
//! 1. **Never modify existing migrations** - users may upgrade from any older version
//! 2. **Always add new migrations** - one function per change, bump `CURRENT_SCHEMA_VERSION`
//! 3. **Stay idempotent** - check state before changing it
//! 4. **Prefer ALTER TABLE** over DROP/CREATE to preserve data

use crate::annotations::{AudioNote, StoredAudioNotes, MAX_LEVEL, MIN_LEVEL};
use crate::Result;
use serde_json::{Map, Value};
use sqlx::{Row, SqlitePool};
use std::collections::HashMap;
use tracing::{info, warn};

/// Current schema version
///
/// **IMPORTANT:** Increment this when adding new migrations
const CURRENT_SCHEMA_VERSION: i32 = 2;

/// Returns 0 if schema_version table doesn't exist or has no rows
async fn get_schema_version(pool: &SqlitePool) -> Result<i32> {
    let table_exists: bool = sqlx::query_scalar(
        "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = 'schema_version')",
    )
    .fetch_one(pool)
    .await?;

    if !table_exists {
        return Ok(0);
    }

    let version: Option<i32> =
        sqlx::query_scalar("SELECT version FROM schema_version ORDER BY version DESC LIMIT 1")
            .fetch_optional(pool)
            .await?;

    Ok(version.unwrap_or(0))
}

async fn set_schema_version(pool: &SqlitePool, version: i32) -> Result<()> {
    sqlx::query("INSERT OR IGNORE INTO schema_version (version) VALUES (?)")
        .bind(version)
        .execute(pool)
        .await?;

    Ok(())
}

/// Run all pending migrations
pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    let current_version = get_schema_version(pool).await?;

    if current_version == CURRENT_SCHEMA_VERSION {
        info!("Database schema is up to date (v{})", current_version);
        return Ok(());
    }

    if current_version > CURRENT_SCHEMA_VERSION {
        warn!(
            "Database schema version ({}) is newer than code version ({})",
            current_version, CURRENT_SCHEMA_VERSION
        );
        return Ok(());
    }

    info!(
        "Running database migrations: v{} -> v{}",
        current_version, CURRENT_SCHEMA_VERSION
    );

    if current_version < 1 {
        migrate_v1(pool).await?;
        set_schema_version(pool, 1).await?;
        info!("✓ Migration v1 completed");
    }

    if current_version < 2 {
        migrate_v2(pool).await?;
        set_schema_version(pool, 2).await?;
        info!("✓ Migration v2 completed");
    }

    Ok(())
}

/// Migration v1: repeatable vote counts
///
/// Early ledgers stored one row per voter with no count. Each such row is
/// worth one vote. Afterwards every suggestion's `likes` is reconciled with
/// its vote rows; likes recorded before any vote row existed are attributed
/// to the suggestion's creator so rankings survive the upgrade.
async fn migrate_v1(pool: &SqlitePool) -> Result<()> {
    let mut tx = pool.begin().await?;

    let has_count: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM pragma_table_info('suggestion_votes') WHERE name = 'count'",
    )
    .fetch_one(&mut *tx)
    .await?;

    if has_count == 0 {
        sqlx::query("ALTER TABLE suggestion_votes ADD COLUMN count INTEGER NOT NULL DEFAULT 1")
            .execute(&mut *tx)
            .await?;
        info!("  Added count column to suggestion_votes");
    }

    let orphaned = sqlx::query(
        r#"
        INSERT INTO suggestion_votes (suggestion_id, user_id, count)
        SELECT s.id, s.creator_id, s.likes FROM suggestions s
        WHERE s.likes > 0
          AND NOT EXISTS (SELECT 1 FROM suggestion_votes v WHERE v.suggestion_id = s.id)
        "#,
    )
    .execute(&mut *tx)
    .await?
    .rows_affected();

    if orphaned > 0 {
        info!("  Attributed pre-ledger likes of {} suggestions to their creators", orphaned);
    }

    let reconciled = sqlx::query(
        r#"
        UPDATE suggestions
        SET likes = (SELECT COALESCE(SUM(v.count), 0) FROM suggestion_votes v WHERE v.suggestion_id = suggestions.id)
        WHERE likes != (SELECT COALESCE(SUM(v.count), 0) FROM suggestion_votes v WHERE v.suggestion_id = suggestions.id)
        "#,
    )
    .execute(&mut *tx)
    .await?
    .rows_affected();

    if reconciled > 0 {
        warn!("  Reconciled likes of {} suggestions with their vote rows", reconciled);
    }

    tx.commit().await?;
    Ok(())
}

/// Migration v2: annotation maps keyed by user id
///
/// Maps used to be keyed by member handle, and audio notes were once a single
/// string per member. Handles are resolved to ids (case-insensitive); entries
/// for unknown handles are dropped with a warning.
async fn migrate_v2(pool: &SqlitePool) -> Result<()> {
    let mut tx = pool.begin().await?;

    let handles: HashMap<String, i64> = sqlx::query("SELECT id, handle FROM users")
        .fetch_all(&mut *tx)
        .await?
        .iter()
        .map(|row| (row.get::<String, _>("handle").to_lowercase(), row.get("id")))
        .collect();
    let known_ids: std::collections::HashSet<i64> = handles.values().copied().collect();

    let rows = sqlx::query("SELECT id, levels_json, notes_json, audio_notes_json FROM rehearsals")
        .fetch_all(&mut *tx)
        .await?;

    let mut rewritten = 0;
    for row in rows {
        let rehearsal_id: i64 = row.get("id");
        // Handles first: a numeric handle must not be read as someone's id
        let resolve = |key: &str| -> Option<i64> {
            handles
                .get(&key.trim().to_lowercase())
                .copied()
                .or_else(|| key.parse::<i64>().ok().filter(|id| known_ids.contains(id)))
        };

        let mut changed = false;
        let mut columns = Vec::with_capacity(3);
        for column in ["levels_json", "notes_json", "audio_notes_json"] {
            let raw: String = row.get(column);
            let original: Map<String, Value> = match serde_json::from_str(&raw) {
                Ok(Value::Object(map)) => map,
                _ => {
                    warn!(rehearsal_id, column, "Unreadable annotation map replaced with empty map");
                    changed = true;
                    columns.push((column, "{}".to_string()));
                    continue;
                }
            };

            let mut rekeyed = Map::new();
            for (key, value) in &original {
                let Some(user_id) = resolve(key) else {
                    warn!(rehearsal_id, column, member = %key, "Dropping annotation for unknown member");
                    continue;
                };
                let value = match column {
                    "audio_notes_json" => {
                        let notes: Vec<AudioNote> = serde_json::from_value::<StoredAudioNotes>(value.clone())
                            .map(Vec::from)
                            .unwrap_or_default();
                        if notes.is_empty() {
                            continue;
                        }
                        serde_json::to_value(notes).map_err(|e| {
                            crate::Error::Internal(format!("Failed to encode audio notes: {}", e))
                        })?
                    }
                    // Levels were once stored as fractional numbers
                    "levels_json" => match value.as_f64() {
                        Some(level) => Value::from((level.round() as i64).clamp(MIN_LEVEL, MAX_LEVEL)),
                        None => {
                            warn!(rehearsal_id, member = %key, "Dropping non-numeric level");
                            continue;
                        }
                    },
                    _ => match value {
                        Value::String(_) => value.clone(),
                        other => Value::String(other.to_string()),
                    },
                };
                rekeyed.insert(user_id.to_string(), value);
            }

            if rekeyed != original {
                changed = true;
            }
            columns.push((column, Value::Object(rekeyed).to_string()));
        }

        if changed {
            let [(_, levels), (_, notes), (_, audio)] = <[(&str, String); 3]>::try_from(columns)
                .map_err(|_| crate::Error::Internal("annotation column count".to_string()))?;
            sqlx::query(
                "UPDATE rehearsals SET levels_json = ?, notes_json = ?, audio_notes_json = ? WHERE id = ?",
            )
            .bind(levels)
            .bind(notes)
            .bind(audio)
            .bind(rehearsal_id)
            .execute(&mut *tx)
            .await?;
            rewritten += 1;
        }
    }

    if rewritten > 0 {
        info!("  Re-keyed annotations of {} rehearsals", rewritten);
    }

    tx.commit().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn setup_test_db() -> SqlitePool {
        SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap()
    }

    /// Minimal pre-versioning layout
    async fn create_legacy_tables(pool: &SqlitePool) {
        for sql in [
            "CREATE TABLE schema_version (version INTEGER PRIMARY KEY, applied_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP)",
            "CREATE TABLE users (id INTEGER PRIMARY KEY AUTOINCREMENT, handle TEXT NOT NULL UNIQUE)",
            "CREATE TABLE suggestions (id INTEGER PRIMARY KEY AUTOINCREMENT, title TEXT NOT NULL, likes INTEGER NOT NULL DEFAULT 0, creator_id INTEGER NOT NULL)",
            "CREATE TABLE suggestion_votes (suggestion_id INTEGER NOT NULL, user_id INTEGER NOT NULL, PRIMARY KEY (suggestion_id, user_id))",
            "CREATE TABLE rehearsals (id INTEGER PRIMARY KEY AUTOINCREMENT, title TEXT NOT NULL, levels_json TEXT NOT NULL DEFAULT '{}', notes_json TEXT NOT NULL DEFAULT '{}', audio_notes_json TEXT NOT NULL DEFAULT '{}')",
        ] {
            sqlx::query(sql).execute(pool).await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_get_schema_version_no_table() {
        let pool = setup_test_db().await;
        assert_eq!(get_schema_version(&pool).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_migrations_record_version() {
        let pool = setup_test_db().await;
        create_legacy_tables(&pool).await;

        run_migrations(&pool).await.unwrap();
        assert_eq!(get_schema_version(&pool).await.unwrap(), CURRENT_SCHEMA_VERSION);

        // Second run is a no-op
        run_migrations(&pool).await.unwrap();
        assert_eq!(get_schema_version(&pool).await.unwrap(), CURRENT_SCHEMA_VERSION);
    }

    #[tokio::test]
    async fn test_v1_backfills_counts_and_reconciles_likes() {
        let pool = setup_test_db().await;
        create_legacy_tables(&pool).await;

        sqlx::query("INSERT INTO users (handle) VALUES ('ana'), ('ben')")
            .execute(&pool)
            .await
            .unwrap();
        // Suggestion 1 has ledger rows, suggestion 2 predates the ledger
        sqlx::query("INSERT INTO suggestions (title, likes, creator_id) VALUES ('Valerie', 5, 1), ('Creep', 3, 2)")
            .execute(&pool)
            .await
            .unwrap();
        sqlx::query("INSERT INTO suggestion_votes (suggestion_id, user_id) VALUES (1, 1), (1, 2)")
            .execute(&pool)
            .await
            .unwrap();

        migrate_v1(&pool).await.unwrap();

        let likes: Vec<(i64, i64)> = sqlx::query_as(
            r#"
            SELECT s.likes, (SELECT SUM(count) FROM suggestion_votes v WHERE v.suggestion_id = s.id)
            FROM suggestions s ORDER BY s.id
            "#,
        )
        .fetch_all(&pool)
        .await
        .unwrap();

        assert_eq!(likes, vec![(2, 2), (3, 3)]);
    }

    #[tokio::test]
    async fn test_v2_rekeys_handles_and_converts_audio() {
        let pool = setup_test_db().await;
        create_legacy_tables(&pool).await;

        sqlx::query("INSERT INTO users (handle) VALUES ('ana'), ('ben')")
            .execute(&pool)
            .await
            .unwrap();
        sqlx::query(
            r#"
            INSERT INTO rehearsals (title, levels_json, notes_json, audio_notes_json)
            VALUES ('Song', '{"Ana": 6.6, "ghost": 3}', '{"ben": "watch the bridge"}', '{"ana": "b64data"}')
            "#,
        )
        .execute(&pool)
        .await
        .unwrap();

        migrate_v2(&pool).await.unwrap();

        let (levels, notes, audio): (String, String, String) =
            sqlx::query_as("SELECT levels_json, notes_json, audio_notes_json FROM rehearsals")
                .fetch_one(&pool)
                .await
                .unwrap();

        let levels: Value = serde_json::from_str(&levels).unwrap();
        assert_eq!(levels, serde_json::json!({"1": 7}));

        let notes: Value = serde_json::from_str(&notes).unwrap();
        assert_eq!(notes, serde_json::json!({"2": "watch the bridge"}));

        let audio: Value = serde_json::from_str(&audio).unwrap();
        assert_eq!(audio, serde_json::json!({"1": [{"title": "", "audio": "b64data"}]}));

        // Already keyed by id: nothing changes on a second pass
        migrate_v2(&pool).await.unwrap();
        let again: String = sqlx::query_scalar("SELECT levels_json FROM rehearsals")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(serde_json::from_str::<Value>(&again).unwrap(), serde_json::json!({"1": 7}));
    }

    #[tokio::test]
    async fn test_v2_prefers_handle_over_numeric_id() {
        let pool = setup_test_db().await;
        create_legacy_tables(&pool).await;

        sqlx::query("INSERT INTO users (id, handle) VALUES (1, 'ana'), (2, '12'), (12, 'zoe')")
            .execute(&pool)
            .await
            .unwrap();
        sqlx::query("INSERT INTO rehearsals (title, levels_json) VALUES ('Song', '{\"12\": 4}')")
            .execute(&pool)
            .await
            .unwrap();

        migrate_v2(&pool).await.unwrap();

        let levels: String = sqlx::query_scalar("SELECT levels_json FROM rehearsals")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(serde_json::from_str::<Value>(&levels).unwrap(), serde_json::json!({"2": 4}));
    }
}
