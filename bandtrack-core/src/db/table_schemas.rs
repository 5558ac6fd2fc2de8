//! Table Schema Definitions
//!
//! Expected columns for tables that gained columns after their first release.
//! Databases created by older versions pick the new columns up on startup.
//!
//! `suggestion_votes` is absent on purpose: its `count` column needs a data
//! backfill and is handled by migration v1.

use crate::db::schema_sync::{ColumnDefinition, SchemaSync, TableSchema};
use crate::Result;
use sqlx::SqlitePool;
use tracing::info;

pub struct UsersTableSchema;

impl TableSchema for UsersTableSchema {
    fn table_name() -> &'static str {
        "users"
    }

    fn expected_columns() -> Vec<ColumnDefinition> {
        vec![
            ColumnDefinition::new("id", "INTEGER").primary_key(),
            ColumnDefinition::new("handle", "TEXT").not_null().unique(),
            ColumnDefinition::new("credential", "TEXT").not_null(),
            ColumnDefinition::new("account_role", "TEXT").not_null().default("'user'"),
            ColumnDefinition::new("last_group_id", "INTEGER"),
            ColumnDefinition::new("created_at", "TIMESTAMP"),
        ]
    }
}

pub struct GroupsTableSchema;

impl TableSchema for GroupsTableSchema {
    fn table_name() -> &'static str {
        "groups"
    }

    fn expected_columns() -> Vec<ColumnDefinition> {
        vec![
            ColumnDefinition::new("id", "INTEGER").primary_key(),
            ColumnDefinition::new("name", "TEXT").not_null(),
            ColumnDefinition::new("invitation_code", "TEXT").not_null().unique(),
            ColumnDefinition::new("description", "TEXT"),
            ColumnDefinition::new("logo_url", "TEXT"),
            ColumnDefinition::new("owner_id", "INTEGER"),
            ColumnDefinition::new("is_default", "INTEGER").not_null().default("0"),
            ColumnDefinition::new("created_at", "TIMESTAMP"),
        ]
    }
}

pub struct MembershipsTableSchema;

impl TableSchema for MembershipsTableSchema {
    fn table_name() -> &'static str {
        "memberships"
    }

    fn expected_columns() -> Vec<ColumnDefinition> {
        vec![
            ColumnDefinition::new("id", "INTEGER").primary_key(),
            ColumnDefinition::new("user_id", "INTEGER").not_null(),
            ColumnDefinition::new("group_id", "INTEGER").not_null(),
            ColumnDefinition::new("role", "TEXT").not_null().default("'user'"),
            ColumnDefinition::new("nickname", "TEXT"),
            ColumnDefinition::new("active", "INTEGER").not_null().default("1"),
            ColumnDefinition::new("joined_at", "TIMESTAMP"),
        ]
    }
}

pub struct SuggestionsTableSchema;

impl TableSchema for SuggestionsTableSchema {
    fn table_name() -> &'static str {
        "suggestions"
    }

    fn expected_columns() -> Vec<ColumnDefinition> {
        vec![
            ColumnDefinition::new("id", "INTEGER").primary_key(),
            ColumnDefinition::new("group_id", "INTEGER").not_null(),
            ColumnDefinition::new("title", "TEXT").not_null(),
            ColumnDefinition::new("author", "TEXT"),
            ColumnDefinition::new("youtube", "TEXT"),
            ColumnDefinition::new("url", "TEXT"),
            ColumnDefinition::new("version_of", "TEXT"),
            ColumnDefinition::new("likes", "INTEGER").not_null().default("0"),
            ColumnDefinition::new("creator_id", "INTEGER").not_null(),
            ColumnDefinition::new("created_at", "TIMESTAMP"),
        ]
    }
}

pub struct RehearsalsTableSchema;

impl TableSchema for RehearsalsTableSchema {
    fn table_name() -> &'static str {
        "rehearsals"
    }

    fn expected_columns() -> Vec<ColumnDefinition> {
        vec![
            ColumnDefinition::new("id", "INTEGER").primary_key(),
            ColumnDefinition::new("group_id", "INTEGER").not_null(),
            ColumnDefinition::new("title", "TEXT").not_null(),
            ColumnDefinition::new("author", "TEXT"),
            ColumnDefinition::new("youtube", "TEXT"),
            ColumnDefinition::new("spotify", "TEXT"),
            ColumnDefinition::new("version_of", "TEXT"),
            ColumnDefinition::new("levels_json", "TEXT").not_null().default("'{}'"),
            ColumnDefinition::new("notes_json", "TEXT").not_null().default("'{}'"),
            ColumnDefinition::new("audio_notes_json", "TEXT").not_null().default("'{}'"),
            ColumnDefinition::new("mastered", "INTEGER").not_null().default("0"),
            ColumnDefinition::new("creator_id", "INTEGER").not_null(),
            ColumnDefinition::new("created_at", "TIMESTAMP"),
        ]
    }
}

pub struct PerformancesTableSchema;

impl TableSchema for PerformancesTableSchema {
    fn table_name() -> &'static str {
        "performances"
    }

    fn expected_columns() -> Vec<ColumnDefinition> {
        vec![
            ColumnDefinition::new("id", "INTEGER").primary_key(),
            ColumnDefinition::new("group_id", "INTEGER").not_null(),
            ColumnDefinition::new("name", "TEXT").not_null(),
            ColumnDefinition::new("date", "TEXT").not_null(),
            // Older databases predate venue tracking
            ColumnDefinition::new("location", "TEXT"),
            ColumnDefinition::new("songs_json", "TEXT").not_null().default("'[]'"),
            ColumnDefinition::new("creator_id", "INTEGER").not_null(),
            ColumnDefinition::new("created_at", "TIMESTAMP"),
        ]
    }
}

pub struct RehearsalEventsTableSchema;

impl TableSchema for RehearsalEventsTableSchema {
    fn table_name() -> &'static str {
        "rehearsal_events"
    }

    fn expected_columns() -> Vec<ColumnDefinition> {
        vec![
            ColumnDefinition::new("id", "INTEGER").primary_key(),
            ColumnDefinition::new("group_id", "INTEGER").not_null(),
            ColumnDefinition::new("date", "TEXT").not_null(),
            ColumnDefinition::new("location", "TEXT"),
            ColumnDefinition::new("creator_id", "INTEGER").not_null(),
            ColumnDefinition::new("created_at", "TIMESTAMP"),
        ]
    }
}

pub struct GroupSettingsTableSchema;

impl TableSchema for GroupSettingsTableSchema {
    fn table_name() -> &'static str {
        "group_settings"
    }

    fn expected_columns() -> Vec<ColumnDefinition> {
        vec![
            ColumnDefinition::new("group_id", "INTEGER").primary_key(),
            ColumnDefinition::new("group_name", "TEXT").not_null(),
            ColumnDefinition::new("dark_mode", "INTEGER").not_null().default("1"),
            ColumnDefinition::new("template", "TEXT").not_null().default("'classic'"),
            ColumnDefinition::new("next_rehearsal_date", "TEXT"),
            ColumnDefinition::new("next_rehearsal_location", "TEXT"),
        ]
    }
}

/// Synchronize all table schemas
pub async fn sync_all_table_schemas(pool: &SqlitePool) -> Result<()> {
    SchemaSync::sync_table::<UsersTableSchema>(pool).await?;
    SchemaSync::sync_table::<GroupsTableSchema>(pool).await?;
    SchemaSync::sync_table::<MembershipsTableSchema>(pool).await?;
    SchemaSync::sync_table::<SuggestionsTableSchema>(pool).await?;
    SchemaSync::sync_table::<RehearsalsTableSchema>(pool).await?;
    SchemaSync::sync_table::<PerformancesTableSchema>(pool).await?;
    SchemaSync::sync_table::<RehearsalEventsTableSchema>(pool).await?;
    SchemaSync::sync_table::<GroupSettingsTableSchema>(pool).await?;

    info!("Schema synchronization complete");
    Ok(())
}
