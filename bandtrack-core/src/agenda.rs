//! Group agenda: rehearsal events merged with performances by date
//!
//! A rehearsal event is a dated slot (optionally with a start time and a
//! location). Any active member may create, edit or delete one.

use crate::access::{authorize, Actor, GroupId, Role, UserId};
use crate::db::{max_lock_wait_ms, retry_on_lock};
use crate::{text, time, Error, Result};
use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use serde::Serialize;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection, SqlitePool};
use tracing::{debug, info};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RehearsalEvent {
    pub id: i64,
    pub group_id: GroupId,
    pub date: NaiveDate,
    pub time: Option<NaiveTime>,
    pub location: Option<String>,
    pub creator_id: UserId,
    pub creator_name: String,
    pub created_at: DateTime<Utc>,
}

/// Fields of a rehearsal event, for creation and full replacement
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NewRehearsalEvent {
    /// `YYYY-MM-DD` or `YYYY-MM-DDTHH:MM`
    pub date: String,
    pub location: Option<String>,
}

impl NewRehearsalEvent {
    /// Normalized stored date and trimmed location
    fn clean(&self) -> Result<(String, Option<String>)> {
        let (date, time) = time::parse_date_time(&text::required(&self.date, "date")?)?;
        Ok((
            time::format_date_time(date, time),
            text::optional(self.location.as_deref()),
        ))
    }
}

/// One agenda line
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum AgendaItem {
    Rehearsal {
        id: i64,
        date: NaiveDate,
        time: Option<NaiveTime>,
        location: Option<String>,
    },
    Performance {
        id: i64,
        date: NaiveDate,
        title: String,
        location: Option<String>,
    },
}

impl AgendaItem {
    pub fn date(&self) -> NaiveDate {
        match self {
            AgendaItem::Rehearsal { date, .. } | AgendaItem::Performance { date, .. } => *date,
        }
    }

    fn sort_key(&self) -> (NaiveDate, Option<NaiveTime>) {
        match self {
            AgendaItem::Rehearsal { date, time, .. } => (*date, *time),
            AgendaItem::Performance { date, .. } => (*date, None),
        }
    }
}

const EVENT_SELECT: &str = r#"
    SELECT e.id, e.group_id, e.date, e.location, e.creator_id,
           COALESCE(m.nickname, u.handle) AS creator_name, e.created_at
    FROM rehearsal_events e
    JOIN users u ON u.id = e.creator_id
    LEFT JOIN memberships m ON m.user_id = e.creator_id AND m.group_id = e.group_id
"#;

fn event_from_row(row: &SqliteRow) -> Result<RehearsalEvent> {
    let stored: String = row.try_get("date")?;
    let (date, time) = time::parse_date_time(&stored)?;

    Ok(RehearsalEvent {
        id: row.try_get("id")?,
        group_id: row.try_get("group_id")?,
        date,
        time,
        location: row.try_get("location")?,
        creator_id: row.try_get("creator_id")?,
        creator_name: row.try_get("creator_name")?,
        created_at: row.try_get("created_at")?,
    })
}

async fn fetch_event(conn: &mut SqliteConnection, group_id: GroupId, event_id: i64) -> Result<RehearsalEvent> {
    let sql = format!("{} WHERE e.id = ? AND e.group_id = ?", EVENT_SELECT);
    let row = sqlx::query(&sql)
        .bind(event_id)
        .bind(group_id)
        .fetch_optional(&mut *conn)
        .await?
        .ok_or_else(|| Error::NotFound(format!("Rehearsal event {} not found", event_id)))?;
    event_from_row(&row)
}

/// Schedule a rehearsal event; any member may
pub async fn create_rehearsal_event(
    pool: &SqlitePool,
    actor: &Actor,
    new: &NewRehearsalEvent,
) -> Result<RehearsalEvent> {
    new.clean()?;
    let wait = max_lock_wait_ms(pool).await;

    let event = retry_on_lock("create rehearsal event", wait, move || async move {
        let mut tx = pool.begin().await?;
        authorize(&mut *tx, actor, Role::User).await?;
        let (date, location) = new.clean()?;

        let id = sqlx::query(
            "INSERT INTO rehearsal_events (group_id, date, location, creator_id, created_at) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(actor.group_id)
        .bind(&date)
        .bind(&location)
        .bind(actor.user_id)
        .bind(time::now())
        .execute(&mut *tx)
        .await?
        .last_insert_rowid();

        let event = fetch_event(&mut tx, actor.group_id, id).await?;
        tx.commit().await?;
        Ok(event)
    })
    .await?;

    info!(
        event_id = event.id,
        group_id = actor.group_id,
        user_id = actor.user_id,
        date = %event.date,
        "Rehearsal event created"
    );
    Ok(event)
}

pub async fn get_rehearsal_event(pool: &SqlitePool, actor: &Actor, event_id: i64) -> Result<RehearsalEvent> {
    let mut conn = pool.acquire().await?;
    authorize(&mut *conn, actor, Role::User).await?;
    fetch_event(&mut conn, actor.group_id, event_id).await
}

/// Replace date and location; any member may
pub async fn update_rehearsal_event(
    pool: &SqlitePool,
    actor: &Actor,
    event_id: i64,
    fields: &NewRehearsalEvent,
) -> Result<RehearsalEvent> {
    fields.clean()?;
    let wait = max_lock_wait_ms(pool).await;

    let event = retry_on_lock("update rehearsal event", wait, move || async move {
        let mut tx = pool.begin().await?;
        authorize(&mut *tx, actor, Role::User).await?;
        fetch_event(&mut tx, actor.group_id, event_id).await?;
        let (date, location) = fields.clean()?;

        sqlx::query("UPDATE rehearsal_events SET date = ?, location = ? WHERE id = ? AND group_id = ?")
            .bind(&date)
            .bind(&location)
            .bind(event_id)
            .bind(actor.group_id)
            .execute(&mut *tx)
            .await?;

        let event = fetch_event(&mut tx, actor.group_id, event_id).await?;
        tx.commit().await?;
        Ok(event)
    })
    .await?;

    info!(event_id, user_id = actor.user_id, "Rehearsal event updated");
    Ok(event)
}

/// Any member may
pub async fn delete_rehearsal_event(pool: &SqlitePool, actor: &Actor, event_id: i64) -> Result<()> {
    let wait = max_lock_wait_ms(pool).await;

    retry_on_lock("delete rehearsal event", wait, move || async move {
        let mut tx = pool.begin().await?;
        authorize(&mut *tx, actor, Role::User).await?;

        let deleted = sqlx::query("DELETE FROM rehearsal_events WHERE id = ? AND group_id = ?")
            .bind(event_id)
            .bind(actor.group_id)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        if deleted == 0 {
            return Err(Error::NotFound(format!("Rehearsal event {} not found", event_id)));
        }

        tx.commit().await?;
        Ok(())
    })
    .await?;

    info!(event_id, group_id = actor.group_id, user_id = actor.user_id, "Rehearsal event deleted");
    Ok(())
}

/// Rehearsal events and performances of the actor's group, by date
///
/// Both bounds are optional and inclusive. On the same day, untimed entries
/// come first, then events by start time; events precede performances on a tie.
pub async fn agenda(
    pool: &SqlitePool,
    actor: &Actor,
    start: Option<NaiveDate>,
    end: Option<NaiveDate>,
) -> Result<Vec<AgendaItem>> {
    if let (Some(s), Some(e)) = (start, end) {
        if s > e {
            return Err(Error::InvalidInput(format!("Agenda start {} is after end {}", s, e)));
        }
    }

    let mut conn = pool.acquire().await?;
    authorize(&mut *conn, actor, Role::User).await?;

    let start = start.map(|d| d.format("%F").to_string());
    let end = end.map(|d| d.format("%F").to_string());

    let events: Vec<(i64, String, Option<String>)> = sqlx::query_as(
        r#"
        SELECT id, date, location FROM rehearsal_events
        WHERE group_id = ?
          AND (? IS NULL OR substr(date, 1, 10) >= ?)
          AND (? IS NULL OR substr(date, 1, 10) <= ?)
        "#,
    )
    .bind(actor.group_id)
    .bind(&start)
    .bind(&start)
    .bind(&end)
    .bind(&end)
    .fetch_all(&mut *conn)
    .await?;

    let performances: Vec<(i64, String, String, Option<String>)> = sqlx::query_as(
        r#"
        SELECT id, date, name, location FROM performances
        WHERE group_id = ?
          AND (? IS NULL OR date >= ?)
          AND (? IS NULL OR date <= ?)
        "#,
    )
    .bind(actor.group_id)
    .bind(&start)
    .bind(&start)
    .bind(&end)
    .bind(&end)
    .fetch_all(&mut *conn)
    .await?;

    let mut items = Vec::with_capacity(events.len() + performances.len());
    for (id, stored, location) in events {
        let (date, time) = time::parse_date_time(&stored)?;
        items.push(AgendaItem::Rehearsal { id, date, time, location });
    }
    for (id, stored, title, location) in performances {
        items.push(AgendaItem::Performance {
            id,
            date: time::parse_date(&stored)?,
            title,
            location,
        });
    }
    items.sort_by_key(AgendaItem::sort_key);

    debug!(group_id = actor.group_id, count = items.len(), "Built agenda");
    Ok(items)
}
