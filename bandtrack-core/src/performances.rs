//! Performances: scheduled events with an ordered setlist
//!
//! A setlist references rehearsals by id only. Deleting or converting a
//! rehearsal leaves the id in place and it reads back as [`SetlistEntry::Missing`].

use crate::access::{authorize, Actor, GroupId, Role, UserId};
use crate::db::{max_lock_wait_ms, retry_on_lock};
use crate::{text, time, Error, Result};
use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection, SqlitePool};
use std::collections::HashMap;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Performance {
    pub id: i64,
    pub group_id: GroupId,
    pub name: String,
    pub date: NaiveDate,
    pub location: Option<String>,
    /// Rehearsal ids in playing order
    pub setlist: Vec<i64>,
    pub creator_id: UserId,
    pub creator_name: String,
    pub created_at: DateTime<Utc>,
}

/// Fields of a performance, for creation and full replacement
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NewPerformance {
    pub name: String,
    /// `YYYY-MM-DD`
    pub date: String,
    pub location: Option<String>,
    pub setlist: Vec<i64>,
}

/// One resolved setlist slot
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum SetlistEntry {
    Rehearsal { id: i64, title: String, mastered: bool },
    /// The rehearsal no longer exists
    Missing { id: i64 },
}

impl SetlistEntry {
    pub fn id(&self) -> i64 {
        match self {
            SetlistEntry::Rehearsal { id, .. } | SetlistEntry::Missing { id } => *id,
        }
    }

    pub fn is_missing(&self) -> bool {
        matches!(self, SetlistEntry::Missing { .. })
    }
}

struct CleanPerformance {
    name: String,
    date: NaiveDate,
    location: Option<String>,
    setlist_json: String,
}

impl NewPerformance {
    fn clean(&self) -> Result<CleanPerformance> {
        let name = text::required(&self.name, "name")?;
        let date = time::parse_date(&text::required(&self.date, "date")?)?;
        let setlist_json = serde_json::to_string(&self.setlist)
            .map_err(|e| Error::Internal(format!("Failed to encode setlist: {}", e)))?;
        Ok(CleanPerformance {
            name,
            date,
            location: text::optional(self.location.as_deref()),
            setlist_json,
        })
    }
}

const PERFORMANCE_SELECT: &str = r#"
    SELECT p.id, p.group_id, p.name, p.date, p.location, p.songs_json, p.creator_id,
           COALESCE(m.nickname, u.handle) AS creator_name, p.created_at
    FROM performances p
    JOIN users u ON u.id = p.creator_id
    LEFT JOIN memberships m ON m.user_id = p.creator_id AND m.group_id = p.group_id
"#;

fn performance_from_row(row: &SqliteRow) -> Result<Performance> {
    let id: i64 = row.try_get("id")?;
    let songs: &str = row.try_get("songs_json")?;
    let setlist = serde_json::from_str(songs)
        .map_err(|e| Error::Internal(format!("Corrupt setlist column of performance {}: {}", id, e)))?;
    let date: String = row.try_get("date")?;

    Ok(Performance {
        id,
        group_id: row.try_get("group_id")?,
        name: row.try_get("name")?,
        date: time::parse_date(&date)?,
        location: row.try_get("location")?,
        setlist,
        creator_id: row.try_get("creator_id")?,
        creator_name: row.try_get("creator_name")?,
        created_at: row.try_get("created_at")?,
    })
}

async fn fetch_performance(
    conn: &mut SqliteConnection,
    group_id: GroupId,
    performance_id: i64,
) -> Result<Performance> {
    let sql = format!("{} WHERE p.id = ? AND p.group_id = ?", PERFORMANCE_SELECT);
    let row = sqlx::query(&sql)
        .bind(performance_id)
        .bind(group_id)
        .fetch_optional(&mut *conn)
        .await?
        .ok_or_else(|| Error::NotFound(format!("Performance {} not found", performance_id)))?;
    performance_from_row(&row)
}

/// Titles and mastered flags of the group's rehearsals, by id
async fn group_rehearsals(conn: &mut SqliteConnection, group_id: GroupId) -> Result<HashMap<i64, (String, bool)>> {
    let rows: Vec<(i64, String, bool)> =
        sqlx::query_as("SELECT id, title, mastered FROM rehearsals WHERE group_id = ?")
            .bind(group_id)
            .fetch_all(&mut *conn)
            .await?;
    Ok(rows
        .into_iter()
        .map(|(id, title, mastered)| (id, (title, mastered)))
        .collect())
}

/// Every newly added setlist id must name a rehearsal of the same group
///
/// Ids in `kept` are already stored on the performance and may dangle.
async fn validate_setlist(
    conn: &mut SqliteConnection,
    group_id: GroupId,
    setlist: &[i64],
    kept: &[i64],
) -> Result<()> {
    let known = group_rehearsals(conn, group_id).await?;
    match setlist
        .iter()
        .find(|&&id| !kept.contains(&id) && !known.contains_key(&id))
    {
        Some(id) => {
            warn!(group_id, rehearsal_id = *id, "Rejected setlist entry");
            Err(Error::InvalidInput(format!(
                "Setlist entry {} is not a rehearsal of this group",
                id
            )))
        }
        None => Ok(()),
    }
}

/// Schedule a performance; any member may
pub async fn create_performance(pool: &SqlitePool, actor: &Actor, new: &NewPerformance) -> Result<Performance> {
    new.clean()?;
    let wait = max_lock_wait_ms(pool).await;

    let performance = retry_on_lock("create performance", wait, move || async move {
        let mut tx = pool.begin().await?;
        authorize(&mut *tx, actor, Role::User).await?;
        let fields = new.clean()?;
        validate_setlist(&mut tx, actor.group_id, &new.setlist, &[]).await?;

        let id = sqlx::query(
            r#"
            INSERT INTO performances (group_id, name, date, location, songs_json, creator_id, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(actor.group_id)
        .bind(&fields.name)
        .bind(fields.date)
        .bind(&fields.location)
        .bind(&fields.setlist_json)
        .bind(actor.user_id)
        .bind(time::now())
        .execute(&mut *tx)
        .await?
        .last_insert_rowid();

        let performance = fetch_performance(&mut tx, actor.group_id, id).await?;
        tx.commit().await?;
        Ok(performance)
    })
    .await?;

    info!(
        performance_id = performance.id,
        group_id = actor.group_id,
        user_id = actor.user_id,
        date = %performance.date,
        "Performance created"
    );
    Ok(performance)
}

/// Performances of the actor's group, soonest first
pub async fn list_performances(pool: &SqlitePool, actor: &Actor) -> Result<Vec<Performance>> {
    let mut conn = pool.acquire().await?;
    authorize(&mut *conn, actor, Role::User).await?;

    let sql = format!("{} WHERE p.group_id = ? ORDER BY p.date ASC, p.id ASC", PERFORMANCE_SELECT);
    let rows = sqlx::query(&sql)
        .bind(actor.group_id)
        .fetch_all(&mut *conn)
        .await?;

    debug!(group_id = actor.group_id, count = rows.len(), "Listed performances");
    rows.iter().map(performance_from_row).collect()
}

pub async fn get_performance(pool: &SqlitePool, actor: &Actor, performance_id: i64) -> Result<Performance> {
    let mut conn = pool.acquire().await?;
    authorize(&mut *conn, actor, Role::User).await?;
    fetch_performance(&mut conn, actor.group_id, performance_id).await
}

/// Replace name, date, location and setlist; creator or moderator+
pub async fn update_performance(
    pool: &SqlitePool,
    actor: &Actor,
    performance_id: i64,
    fields: &NewPerformance,
) -> Result<Performance> {
    fields.clean()?;
    let wait = max_lock_wait_ms(pool).await;

    let performance = retry_on_lock("update performance", wait, move || async move {
        let mut tx = pool.begin().await?;
        let access = authorize(&mut *tx, actor, Role::User).await?;
        let current = fetch_performance(&mut tx, actor.group_id, performance_id).await?;
        access.require_manage(current.creator_id, "performance")?;

        let clean = fields.clean()?;
        validate_setlist(&mut tx, actor.group_id, &fields.setlist, &current.setlist).await?;

        sqlx::query(
            "UPDATE performances SET name = ?, date = ?, location = ?, songs_json = ? WHERE id = ? AND group_id = ?",
        )
        .bind(&clean.name)
        .bind(clean.date)
        .bind(&clean.location)
        .bind(&clean.setlist_json)
        .bind(performance_id)
        .bind(actor.group_id)
        .execute(&mut *tx)
        .await?;

        let performance = fetch_performance(&mut tx, actor.group_id, performance_id).await?;
        tx.commit().await?;
        Ok(performance)
    })
    .await?;

    info!(performance_id, user_id = actor.user_id, "Performance updated");
    Ok(performance)
}

/// Creator or moderator+
pub async fn delete_performance(pool: &SqlitePool, actor: &Actor, performance_id: i64) -> Result<()> {
    let wait = max_lock_wait_ms(pool).await;

    retry_on_lock("delete performance", wait, move || async move {
        let mut tx = pool.begin().await?;
        let access = authorize(&mut *tx, actor, Role::User).await?;
        let current = fetch_performance(&mut tx, actor.group_id, performance_id).await?;
        access.require_manage(current.creator_id, "performance")?;

        sqlx::query("DELETE FROM performances WHERE id = ? AND group_id = ?")
            .bind(performance_id)
            .bind(actor.group_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    })
    .await?;

    info!(performance_id, group_id = actor.group_id, user_id = actor.user_id, "Performance deleted");
    Ok(())
}

/// Resolve a performance's setlist in order
///
/// Ids whose rehearsal is gone yield [`SetlistEntry::Missing`] rather than
/// an error.
pub async fn performance_setlist(
    pool: &SqlitePool,
    actor: &Actor,
    performance_id: i64,
) -> Result<Vec<SetlistEntry>> {
    let mut conn = pool.acquire().await?;
    authorize(&mut *conn, actor, Role::User).await?;
    let performance = fetch_performance(&mut conn, actor.group_id, performance_id).await?;

    let known = group_rehearsals(&mut conn, actor.group_id).await?;

    let entries: Vec<SetlistEntry> = performance
        .setlist
        .iter()
        .map(|&id| match known.get(&id) {
            Some((title, mastered)) => SetlistEntry::Rehearsal {
                id,
                title: title.clone(),
                mastered: *mastered,
            },
            None => SetlistEntry::Missing { id },
        })
        .collect();

    let missing = entries.iter().filter(|e| e.is_missing()).count();
    if missing > 0 {
        debug!(performance_id, missing, "Setlist has dangling rehearsal references");
    }
    Ok(entries)
}
