//! Suggestions: proposed songs ranked by votes

use crate::access::{authorize, Actor, GroupId, Role, UserId};
use crate::db::{max_lock_wait_ms, retry_on_lock};
use crate::{text, time, Error, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection, SqlitePool};
use tracing::{debug, info};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Suggestion {
    pub id: i64,
    pub group_id: GroupId,
    pub title: String,
    pub author: Option<String>,
    pub youtube: Option<String>,
    pub url: Option<String>,
    /// Song this is a cover or version of
    pub version_of: Option<String>,
    pub likes: i64,
    pub creator_id: UserId,
    /// Creator's nickname in the group, else handle
    pub creator_name: String,
    pub created_at: DateTime<Utc>,
}

impl Suggestion {
    /// Best media reference: the video link, else the generic url
    pub fn media(&self) -> Option<&str> {
        self.youtube.as_deref().or(self.url.as_deref())
    }
}

/// Metadata of a suggestion, for creation and full replacement
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NewSuggestion {
    pub title: String,
    pub author: Option<String>,
    pub youtube: Option<String>,
    pub url: Option<String>,
    pub version_of: Option<String>,
}

/// Trimmed fields, title required
struct CleanSuggestion {
    title: String,
    author: Option<String>,
    youtube: Option<String>,
    url: Option<String>,
    version_of: Option<String>,
}

impl NewSuggestion {
    fn clean(&self) -> Result<CleanSuggestion> {
        Ok(CleanSuggestion {
            title: text::required(&self.title, "title")?,
            author: text::optional(self.author.as_deref()),
            youtube: text::optional(self.youtube.as_deref()),
            url: text::optional(self.url.as_deref()),
            version_of: text::optional(self.version_of.as_deref()),
        })
    }
}

const SUGGESTION_SELECT: &str = r#"
    SELECT s.id, s.group_id, s.title, s.author, s.youtube, s.url, s.version_of, s.likes,
           s.creator_id, COALESCE(m.nickname, u.handle) AS creator_name, s.created_at
    FROM suggestions s
    JOIN users u ON u.id = s.creator_id
    LEFT JOIN memberships m ON m.user_id = s.creator_id AND m.group_id = s.group_id
"#;

fn suggestion_from_row(row: &SqliteRow) -> Result<Suggestion> {
    Ok(Suggestion {
        id: row.try_get("id")?,
        group_id: row.try_get("group_id")?,
        title: row.try_get("title")?,
        author: row.try_get("author")?,
        youtube: row.try_get("youtube")?,
        url: row.try_get("url")?,
        version_of: row.try_get("version_of")?,
        likes: row.try_get("likes")?,
        creator_id: row.try_get("creator_id")?,
        creator_name: row.try_get("creator_name")?,
        created_at: row.try_get("created_at")?,
    })
}

/// A suggestion of the given group; other groups' ids are `NotFound`
pub(crate) async fn fetch_suggestion(
    conn: &mut SqliteConnection,
    group_id: GroupId,
    suggestion_id: i64,
) -> Result<Suggestion> {
    let sql = format!("{} WHERE s.id = ? AND s.group_id = ?", SUGGESTION_SELECT);
    let row = sqlx::query(&sql)
        .bind(suggestion_id)
        .bind(group_id)
        .fetch_optional(&mut *conn)
        .await?
        .ok_or_else(|| Error::NotFound(format!("Suggestion {} not found", suggestion_id)))?;
    suggestion_from_row(&row)
}

/// Insert a suggestion row with zero likes, returning its id
pub(crate) async fn insert_suggestion(
    conn: &mut SqliteConnection,
    group_id: GroupId,
    creator_id: UserId,
    fields: &NewSuggestion,
) -> Result<i64> {
    let fields = fields.clean()?;
    let id = sqlx::query(
        r#"
        INSERT INTO suggestions (group_id, title, author, youtube, url, version_of, likes, creator_id, created_at)
        VALUES (?, ?, ?, ?, ?, ?, 0, ?, ?)
        "#,
    )
    .bind(group_id)
    .bind(&fields.title)
    .bind(&fields.author)
    .bind(&fields.youtube)
    .bind(&fields.url)
    .bind(&fields.version_of)
    .bind(creator_id)
    .bind(time::now())
    .execute(&mut *conn)
    .await?
    .last_insert_rowid();
    Ok(id)
}

/// Propose a song in the actor's group; any member may
pub async fn create_suggestion(pool: &SqlitePool, actor: &Actor, new: &NewSuggestion) -> Result<Suggestion> {
    new.clean()?;
    let wait = max_lock_wait_ms(pool).await;

    let suggestion = retry_on_lock("create suggestion", wait, move || async move {
        let mut tx = pool.begin().await?;
        authorize(&mut *tx, actor, Role::User).await?;
        let id = insert_suggestion(&mut tx, actor.group_id, actor.user_id, new).await?;
        let suggestion = fetch_suggestion(&mut tx, actor.group_id, id).await?;
        tx.commit().await?;
        Ok(suggestion)
    })
    .await?;

    info!(
        suggestion_id = suggestion.id,
        group_id = actor.group_id,
        user_id = actor.user_id,
        title = %suggestion.title,
        "Suggestion created"
    );
    Ok(suggestion)
}

/// Suggestions of the actor's group, most liked first, then oldest first
pub async fn list_suggestions(pool: &SqlitePool, actor: &Actor) -> Result<Vec<Suggestion>> {
    let mut conn = pool.acquire().await?;
    authorize(&mut *conn, actor, Role::User).await?;

    let sql = format!(
        "{} WHERE s.group_id = ? ORDER BY s.likes DESC, s.created_at ASC, s.id ASC",
        SUGGESTION_SELECT
    );
    let rows = sqlx::query(&sql)
        .bind(actor.group_id)
        .fetch_all(&mut *conn)
        .await?;

    debug!(group_id = actor.group_id, count = rows.len(), "Listed suggestions");
    rows.iter().map(suggestion_from_row).collect()
}

pub async fn get_suggestion(pool: &SqlitePool, actor: &Actor, suggestion_id: i64) -> Result<Suggestion> {
    let mut conn = pool.acquire().await?;
    authorize(&mut *conn, actor, Role::User).await?;
    fetch_suggestion(&mut conn, actor.group_id, suggestion_id).await
}

/// Replace a suggestion's metadata; creator or moderator+
///
/// Votes and likes are untouched.
pub async fn update_suggestion(
    pool: &SqlitePool,
    actor: &Actor,
    suggestion_id: i64,
    fields: &NewSuggestion,
) -> Result<Suggestion> {
    fields.clean()?;
    let wait = max_lock_wait_ms(pool).await;

    let suggestion = retry_on_lock("update suggestion", wait, move || async move {
        let mut tx = pool.begin().await?;
        let access = authorize(&mut *tx, actor, Role::User).await?;
        let current = fetch_suggestion(&mut tx, actor.group_id, suggestion_id).await?;
        access.require_manage(current.creator_id, "suggestion")?;

        let fields = fields.clean()?;
        sqlx::query(
            "UPDATE suggestions SET title = ?, author = ?, youtube = ?, url = ?, version_of = ? WHERE id = ? AND group_id = ?",
        )
        .bind(&fields.title)
        .bind(&fields.author)
        .bind(&fields.youtube)
        .bind(&fields.url)
        .bind(&fields.version_of)
        .bind(suggestion_id)
        .bind(actor.group_id)
        .execute(&mut *tx)
        .await?;

        let suggestion = fetch_suggestion(&mut tx, actor.group_id, suggestion_id).await?;
        tx.commit().await?;
        Ok(suggestion)
    })
    .await?;

    info!(suggestion_id, user_id = actor.user_id, "Suggestion updated");
    Ok(suggestion)
}

/// Hard delete; creator or moderator+. Vote rows go with it.
pub async fn delete_suggestion(pool: &SqlitePool, actor: &Actor, suggestion_id: i64) -> Result<()> {
    let wait = max_lock_wait_ms(pool).await;

    retry_on_lock("delete suggestion", wait, move || async move {
        let mut tx = pool.begin().await?;
        let access = authorize(&mut *tx, actor, Role::User).await?;
        let current = fetch_suggestion(&mut tx, actor.group_id, suggestion_id).await?;
        access.require_manage(current.creator_id, "suggestion")?;

        sqlx::query("DELETE FROM suggestions WHERE id = ? AND group_id = ?")
            .bind(suggestion_id)
            .bind(actor.group_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    })
    .await?;

    info!(suggestion_id, group_id = actor.group_id, user_id = actor.user_id, "Suggestion deleted");
    Ok(())
}
