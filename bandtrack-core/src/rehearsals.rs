//! Rehearsals: songs being worked on, with per-member annotations

use crate::access::{authorize, Actor, GroupId, Role, UserId};
use crate::annotations::{AnnotationUpdate, Annotations};
use crate::db::{max_lock_wait_ms, retry_on_lock};
use crate::{text, time, Error, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection, SqlitePool};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use tracing::{debug, info};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Rehearsal {
    pub id: i64,
    pub group_id: GroupId,
    pub title: String,
    pub author: Option<String>,
    pub youtube: Option<String>,
    pub spotify: Option<String>,
    pub version_of: Option<String>,
    pub annotations: Annotations,
    /// Display names of the members holding annotations
    pub member_names: BTreeMap<UserId, String>,
    pub mastered: bool,
    pub creator_id: UserId,
    pub creator_name: String,
    pub created_at: DateTime<Utc>,
}

impl Rehearsal {
    pub fn mean_level(&self) -> Option<f64> {
        self.annotations.mean_level()
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct NewRehearsal {
    pub title: String,
    pub author: Option<String>,
    pub youtube: Option<String>,
    pub spotify: Option<String>,
    pub version_of: Option<String>,
}

/// Metadata edit; `None` keeps a field, `Some("")` clears an optional one
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RehearsalChanges {
    pub title: Option<String>,
    pub author: Option<String>,
    pub youtube: Option<String>,
    pub spotify: Option<String>,
    pub version_of: Option<String>,
}

impl RehearsalChanges {
    pub fn is_empty(&self) -> bool {
        self.title.is_none()
            && self.author.is_none()
            && self.youtube.is_none()
            && self.spotify.is_none()
            && self.version_of.is_none()
    }
}

/// A rehearsal edit request
///
/// Metadata changes need creator or moderator+; the annotation part only
/// touches the actor's own entries and needs plain membership.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RehearsalUpdate {
    pub metadata: RehearsalChanges,
    pub annotation: AnnotationUpdate,
}

const REHEARSAL_SELECT: &str = r#"
    SELECT r.id, r.group_id, r.title, r.author, r.youtube, r.spotify, r.version_of,
           r.levels_json, r.notes_json, r.audio_notes_json, r.mastered, r.creator_id,
           COALESCE(m.nickname, u.handle) AS creator_name, r.created_at
    FROM rehearsals r
    JOIN users u ON u.id = r.creator_id
    LEFT JOIN memberships m ON m.user_id = r.creator_id AND m.group_id = r.group_id
"#;

fn rehearsal_from_row(row: &SqliteRow, names: &BTreeMap<UserId, String>) -> Result<Rehearsal> {
    let annotations = Annotations::decode(
        row.try_get("levels_json")?,
        row.try_get("notes_json")?,
        row.try_get("audio_notes_json")?,
    )?;

    let member_names = annotations
        .levels
        .keys()
        .chain(annotations.notes.keys())
        .chain(annotations.audio_notes.keys())
        .filter_map(|id| names.get(id).map(|name| (*id, name.clone())))
        .collect();

    Ok(Rehearsal {
        id: row.try_get("id")?,
        group_id: row.try_get("group_id")?,
        title: row.try_get("title")?,
        author: row.try_get("author")?,
        youtube: row.try_get("youtube")?,
        spotify: row.try_get("spotify")?,
        version_of: row.try_get("version_of")?,
        annotations,
        member_names,
        mastered: row.try_get("mastered")?,
        creator_id: row.try_get("creator_id")?,
        creator_name: row.try_get("creator_name")?,
        created_at: row.try_get("created_at")?,
    })
}

/// Display names of everyone with a membership row in the group
async fn member_names(conn: &mut SqliteConnection, group_id: GroupId) -> Result<BTreeMap<UserId, String>> {
    let rows: Vec<(UserId, String)> = sqlx::query_as(
        r#"
        SELECT m.user_id, COALESCE(m.nickname, u.handle)
        FROM memberships m
        JOIN users u ON u.id = m.user_id
        WHERE m.group_id = ?
        "#,
    )
    .bind(group_id)
    .fetch_all(&mut *conn)
    .await?;
    Ok(rows.into_iter().collect())
}

/// A rehearsal of the given group; other groups' ids are `NotFound`
pub(crate) async fn fetch_rehearsal(
    conn: &mut SqliteConnection,
    group_id: GroupId,
    rehearsal_id: i64,
) -> Result<Rehearsal> {
    let sql = format!("{} WHERE r.id = ? AND r.group_id = ?", REHEARSAL_SELECT);
    let row = sqlx::query(&sql)
        .bind(rehearsal_id)
        .bind(group_id)
        .fetch_optional(&mut *conn)
        .await?
        .ok_or_else(|| Error::NotFound(format!("Rehearsal {} not found", rehearsal_id)))?;
    let names = member_names(conn, group_id).await?;
    rehearsal_from_row(&row, &names)
}

/// Insert a rehearsal with empty annotations, returning its id
pub(crate) async fn insert_rehearsal(
    conn: &mut SqliteConnection,
    group_id: GroupId,
    creator_id: UserId,
    fields: &NewRehearsal,
) -> Result<i64> {
    let title = text::required(&fields.title, "title")?;
    let id = sqlx::query(
        r#"
        INSERT INTO rehearsals
            (group_id, title, author, youtube, spotify, version_of,
             levels_json, notes_json, audio_notes_json, mastered, creator_id, created_at)
        VALUES (?, ?, ?, ?, ?, ?, '{}', '{}', '{}', 0, ?, ?)
        "#,
    )
    .bind(group_id)
    .bind(&title)
    .bind(text::optional(fields.author.as_deref()))
    .bind(text::optional(fields.youtube.as_deref()))
    .bind(text::optional(fields.spotify.as_deref()))
    .bind(text::optional(fields.version_of.as_deref()))
    .bind(creator_id)
    .bind(time::now())
    .execute(&mut *conn)
    .await?
    .last_insert_rowid();
    Ok(id)
}

/// Start rehearsing a fresh song; any member may
pub async fn create_rehearsal(pool: &SqlitePool, actor: &Actor, new: &NewRehearsal) -> Result<Rehearsal> {
    text::required(&new.title, "title")?;
    let wait = max_lock_wait_ms(pool).await;

    let rehearsal = retry_on_lock("create rehearsal", wait, move || async move {
        let mut tx = pool.begin().await?;
        authorize(&mut *tx, actor, Role::User).await?;
        let id = insert_rehearsal(&mut tx, actor.group_id, actor.user_id, new).await?;
        let rehearsal = fetch_rehearsal(&mut tx, actor.group_id, id).await?;
        tx.commit().await?;
        Ok(rehearsal)
    })
    .await?;

    info!(
        rehearsal_id = rehearsal.id,
        group_id = actor.group_id,
        user_id = actor.user_id,
        "Rehearsal created"
    );
    Ok(rehearsal)
}

/// Rehearsals of the actor's group, best-known first
///
/// Ordered by mean member level descending; unrated songs come last.
pub async fn list_rehearsals(pool: &SqlitePool, actor: &Actor) -> Result<Vec<Rehearsal>> {
    let mut conn = pool.acquire().await?;
    authorize(&mut *conn, actor, Role::User).await?;

    let sql = format!(
        "{} WHERE r.group_id = ? ORDER BY r.created_at ASC, r.id ASC",
        REHEARSAL_SELECT
    );
    let rows = sqlx::query(&sql)
        .bind(actor.group_id)
        .fetch_all(&mut *conn)
        .await?;
    let names = member_names(&mut conn, actor.group_id).await?;

    let mut rehearsals = rows
        .iter()
        .map(|row| rehearsal_from_row(row, &names))
        .collect::<Result<Vec<_>>>()?;

    // Stable sort keeps creation order among equal levels
    rehearsals.sort_by(|a, b| match (a.mean_level(), b.mean_level()) {
        (Some(x), Some(y)) => y.partial_cmp(&x).unwrap_or(Ordering::Equal),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    });

    debug!(group_id = actor.group_id, count = rehearsals.len(), "Listed rehearsals");
    Ok(rehearsals)
}

pub async fn get_rehearsal(pool: &SqlitePool, actor: &Actor, rehearsal_id: i64) -> Result<Rehearsal> {
    let mut conn = pool.acquire().await?;
    authorize(&mut *conn, actor, Role::User).await?;
    fetch_rehearsal(&mut conn, actor.group_id, rehearsal_id).await
}

/// Apply a metadata edit, the actor's annotation edit, or both, atomically
///
/// The metadata permission is checked before anything is written. The
/// annotation maps are read and written back inside the same transaction,
/// so concurrent edits by other members are never overwritten.
pub async fn update_rehearsal(
    pool: &SqlitePool,
    actor: &Actor,
    rehearsal_id: i64,
    update: &RehearsalUpdate,
) -> Result<Rehearsal> {
    if update.metadata.is_empty() && update.annotation.is_empty() {
        return Err(Error::InvalidInput("Nothing to update".to_string()));
    }
    if let Some(title) = &update.metadata.title {
        text::required(title, "title")?;
    }
    let wait = max_lock_wait_ms(pool).await;

    let rehearsal = retry_on_lock("update rehearsal", wait, move || {
        update_rehearsal_once(pool, actor, rehearsal_id, update)
    })
    .await?;

    info!(
        rehearsal_id,
        user_id = actor.user_id,
        metadata = !update.metadata.is_empty(),
        annotation = !update.annotation.is_empty(),
        "Rehearsal updated"
    );
    Ok(rehearsal)
}

async fn update_rehearsal_once(
    pool: &SqlitePool,
    actor: &Actor,
    rehearsal_id: i64,
    update: &RehearsalUpdate,
) -> Result<Rehearsal> {
    let mut tx = pool.begin().await?;
    let access = authorize(&mut *tx, actor, Role::User).await?;
    let current = fetch_rehearsal(&mut tx, actor.group_id, rehearsal_id).await?;

    let changes = &update.metadata;
    if !changes.is_empty() {
        access.require_manage(current.creator_id, "rehearsal")?;

        let keep_or = |change: &Option<String>, existing: &Option<String>| match change {
            Some(value) => text::optional(Some(value)),
            None => existing.clone(),
        };
        let title = match &changes.title {
            Some(title) => text::required(title, "title")?,
            None => current.title.clone(),
        };

        sqlx::query(
            "UPDATE rehearsals SET title = ?, author = ?, youtube = ?, spotify = ?, version_of = ? WHERE id = ? AND group_id = ?",
        )
        .bind(&title)
        .bind(keep_or(&changes.author, &current.author))
        .bind(keep_or(&changes.youtube, &current.youtube))
        .bind(keep_or(&changes.spotify, &current.spotify))
        .bind(keep_or(&changes.version_of, &current.version_of))
        .bind(rehearsal_id)
        .bind(actor.group_id)
        .execute(&mut *tx)
        .await?;
    }

    if !update.annotation.is_empty() {
        let mut annotations = current.annotations.clone();
        annotations.apply(actor.user_id, &update.annotation);
        let encoded = annotations.encode()?;

        sqlx::query(
            "UPDATE rehearsals SET levels_json = ?, notes_json = ?, audio_notes_json = ? WHERE id = ? AND group_id = ?",
        )
        .bind(&encoded.levels_json)
        .bind(&encoded.notes_json)
        .bind(&encoded.audio_notes_json)
        .bind(rehearsal_id)
        .bind(actor.group_id)
        .execute(&mut *tx)
        .await?;
    }

    let rehearsal = fetch_rehearsal(&mut tx, actor.group_id, rehearsal_id).await?;
    tx.commit().await?;
    Ok(rehearsal)
}

/// Flip the mastered flag; creator or moderator+
///
/// A flip, not a set: two calls restore the original state.
pub async fn toggle_mastered(pool: &SqlitePool, actor: &Actor, rehearsal_id: i64) -> Result<Rehearsal> {
    let wait = max_lock_wait_ms(pool).await;

    let rehearsal = retry_on_lock("toggle mastered", wait, move || async move {
        let mut tx = pool.begin().await?;
        let access = authorize(&mut *tx, actor, Role::User).await?;
        let current = fetch_rehearsal(&mut tx, actor.group_id, rehearsal_id).await?;
        access.require_manage(current.creator_id, "rehearsal")?;

        sqlx::query("UPDATE rehearsals SET mastered = NOT mastered WHERE id = ? AND group_id = ?")
            .bind(rehearsal_id)
            .bind(actor.group_id)
            .execute(&mut *tx)
            .await?;

        let rehearsal = fetch_rehearsal(&mut tx, actor.group_id, rehearsal_id).await?;
        tx.commit().await?;
        Ok(rehearsal)
    })
    .await?;

    info!(
        rehearsal_id,
        user_id = actor.user_id,
        mastered = rehearsal.mastered,
        "Toggled mastered"
    );
    Ok(rehearsal)
}

/// Hard delete; creator or moderator+
///
/// Performances keep the id in their setlist; it reads back as missing.
pub async fn delete_rehearsal(pool: &SqlitePool, actor: &Actor, rehearsal_id: i64) -> Result<()> {
    let wait = max_lock_wait_ms(pool).await;

    retry_on_lock("delete rehearsal", wait, move || async move {
        let mut tx = pool.begin().await?;
        let access = authorize(&mut *tx, actor, Role::User).await?;
        let current = fetch_rehearsal(&mut tx, actor.group_id, rehearsal_id).await?;
        access.require_manage(current.creator_id, "rehearsal")?;

        sqlx::query("DELETE FROM rehearsals WHERE id = ? AND group_id = ?")
            .bind(rehearsal_id)
            .bind(actor.group_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    })
    .await?;

    info!(rehearsal_id, group_id = actor.group_id, user_id = actor.user_id, "Rehearsal deleted");
    Ok(())
}
