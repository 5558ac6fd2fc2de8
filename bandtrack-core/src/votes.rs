//! Vote ledger
//!
//! Per-(suggestion, user) vote counts backing the denormalized `likes`
//! column of a suggestion. Votes are repeatable: every upvote adds one, so a
//! member can push a song they care about ("like pressure"). The ledger row
//! and the aggregate are always written in the same transaction, keeping
//! `likes == SUM(count)` for every suggestion.

use crate::access::{authorize, Actor, Role, UserId};
use crate::db::{max_lock_wait_ms, retry_on_lock};
use crate::{Error, Result};
use serde::Serialize;
use sqlx::{SqliteConnection, SqlitePool};
use std::collections::HashMap;
use tracing::debug;

/// State of a suggestion's votes after a ledger change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct VoteTally {
    pub suggestion_id: i64,
    /// Aggregate over all members
    pub likes: i64,
    /// Acting member's own count
    pub own_count: i64,
}

async fn tally(conn: &mut SqliteConnection, suggestion_id: i64, user_id: UserId) -> Result<VoteTally> {
    let (likes, own_count): (i64, i64) = sqlx::query_as(
        r#"
        SELECT s.likes,
               COALESCE((SELECT v.count FROM suggestion_votes v
                         WHERE v.suggestion_id = s.id AND v.user_id = ?), 0)
        FROM suggestions s
        WHERE s.id = ?
        "#,
    )
    .bind(user_id)
    .bind(suggestion_id)
    .fetch_one(&mut *conn)
    .await?;

    Ok(VoteTally {
        suggestion_id,
        likes,
        own_count,
    })
}

/// Add one vote for the actor
///
/// Not a has-voted flag: calling twice counts twice.
pub async fn upvote(pool: &SqlitePool, actor: &Actor, suggestion_id: i64) -> Result<VoteTally> {
    let wait = max_lock_wait_ms(pool).await;

    let tally = retry_on_lock("upvote", wait, move || async move {
        let mut tx = pool.begin().await?;
        authorize(&mut *tx, actor, Role::User).await?;

        // Aggregate first: its write lock serializes concurrent voters
        let updated = sqlx::query("UPDATE suggestions SET likes = likes + 1 WHERE id = ? AND group_id = ?")
            .bind(suggestion_id)
            .bind(actor.group_id)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        if updated == 0 {
            return Err(Error::NotFound(format!("Suggestion {} not found", suggestion_id)));
        }

        sqlx::query(
            r#"
            INSERT INTO suggestion_votes (suggestion_id, user_id, count) VALUES (?, ?, 1)
            ON CONFLICT(suggestion_id, user_id) DO UPDATE SET count = count + 1
            "#,
        )
        .bind(suggestion_id)
        .bind(actor.user_id)
        .execute(&mut *tx)
        .await?;

        let tally = tally(&mut tx, suggestion_id, actor.user_id).await?;
        tx.commit().await?;
        Ok(tally)
    })
    .await?;

    debug!(
        suggestion_id,
        user_id = actor.user_id,
        likes = tally.likes,
        "Upvoted suggestion"
    );
    Ok(tally)
}

/// Take back one of the actor's votes
///
/// Fails with `Conflict` when the actor has no vote left on the suggestion.
pub async fn remove_vote(pool: &SqlitePool, actor: &Actor, suggestion_id: i64) -> Result<VoteTally> {
    let wait = max_lock_wait_ms(pool).await;

    let tally = retry_on_lock("remove vote", wait, move || async move {
        let mut tx = pool.begin().await?;
        authorize(&mut *tx, actor, Role::User).await?;

        let removed = sqlx::query(
            r#"
            UPDATE suggestion_votes SET count = count - 1
            WHERE suggestion_id = ? AND user_id = ? AND count > 0
              AND suggestion_id IN (SELECT id FROM suggestions WHERE group_id = ?)
            "#,
        )
        .bind(suggestion_id)
        .bind(actor.user_id)
        .bind(actor.group_id)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if removed == 0 {
            let exists: bool = sqlx::query_scalar(
                "SELECT EXISTS(SELECT 1 FROM suggestions WHERE id = ? AND group_id = ?)",
            )
            .bind(suggestion_id)
            .bind(actor.group_id)
            .fetch_one(&mut *tx)
            .await?;
            return Err(if exists {
                Error::Conflict("No vote to remove".to_string())
            } else {
                Error::NotFound(format!("Suggestion {} not found", suggestion_id))
            });
        }

        sqlx::query("UPDATE suggestions SET likes = likes - 1 WHERE id = ? AND likes > 0")
            .bind(suggestion_id)
            .execute(&mut *tx)
            .await?;

        let tally = tally(&mut tx, suggestion_id, actor.user_id).await?;
        tx.commit().await?;
        Ok(tally)
    })
    .await?;

    debug!(
        suggestion_id,
        user_id = actor.user_id,
        likes = tally.likes,
        "Removed vote"
    );
    Ok(tally)
}

/// The actor's own vote count per suggestion in their group
pub async fn my_votes(pool: &SqlitePool, actor: &Actor) -> Result<HashMap<i64, i64>> {
    let mut conn = pool.acquire().await?;
    authorize(&mut *conn, actor, Role::User).await?;

    let rows: Vec<(i64, i64)> = sqlx::query_as(
        r#"
        SELECT v.suggestion_id, v.count
        FROM suggestion_votes v
        JOIN suggestions s ON s.id = v.suggestion_id
        WHERE v.user_id = ? AND s.group_id = ? AND v.count > 0
        "#,
    )
    .bind(actor.user_id)
    .bind(actor.group_id)
    .fetch_all(&mut *conn)
    .await?;

    Ok(rows.into_iter().collect())
}

/// Per-member vote counts on one suggestion, largest first
pub async fn votes_for(pool: &SqlitePool, actor: &Actor, suggestion_id: i64) -> Result<Vec<(UserId, i64)>> {
    let mut conn = pool.acquire().await?;
    authorize(&mut *conn, actor, Role::User).await?;

    let exists: bool =
        sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM suggestions WHERE id = ? AND group_id = ?)")
            .bind(suggestion_id)
            .bind(actor.group_id)
            .fetch_one(&mut *conn)
            .await?;
    if !exists {
        return Err(Error::NotFound(format!("Suggestion {} not found", suggestion_id)));
    }

    let rows = sqlx::query_as(
        "SELECT user_id, count FROM suggestion_votes WHERE suggestion_id = ? AND count > 0 ORDER BY count DESC, user_id ASC",
    )
    .bind(suggestion_id)
    .fetch_all(&mut *conn)
    .await?;
    Ok(rows)
}
