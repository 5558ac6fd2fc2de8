//! Group registry
//!
//! Groups, their invitation codes and the system default group. Every group
//! owns a settings row and at least its creator's admin membership.

use crate::access::{authorize, Actor, GroupId, Role, UserId};
use crate::db::{init::get_setting, max_lock_wait_ms, retry_on_lock};
use crate::{text, time, Error, Result};
use chrono::{DateTime, Utc};
use rand::Rng;
use serde::Serialize;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection, SqlitePool};
use tracing::{debug, info};

const CODE_ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
const CODE_ATTEMPTS: usize = 32;
const DEFAULT_CODE_LENGTH: usize = 6;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Group {
    pub id: GroupId,
    pub name: String,
    pub invitation_code: String,
    pub description: Option<String>,
    pub logo_url: Option<String>,
    /// Unset for the default group until the first user registers
    pub owner_id: Option<UserId>,
    pub is_default: bool,
    pub created_at: DateTime<Utc>,
}

/// A group as seen from one member's group list
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GroupSummary {
    pub id: GroupId,
    pub name: String,
    pub role: Role,
}

/// Partial update of a group's profile
///
/// `None` leaves a field untouched; an empty description or logo clears it.
#[derive(Debug, Clone, Default)]
pub struct GroupChanges {
    pub name: Option<String>,
    pub description: Option<String>,
    pub logo_url: Option<String>,
}

const GROUP_COLUMNS: &str =
    "id, name, invitation_code, description, logo_url, owner_id, is_default, created_at";

fn group_from_row(row: &SqliteRow) -> Result<Group> {
    Ok(Group {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        invitation_code: row.try_get("invitation_code")?,
        description: row.try_get("description")?,
        logo_url: row.try_get("logo_url")?,
        owner_id: row.try_get("owner_id")?,
        is_default: row.try_get("is_default")?,
        created_at: row.try_get("created_at")?,
    })
}

/// Random code of uppercase letters and digits
pub fn generate_invitation_code(length: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..length)
        .map(|_| CODE_ALPHABET[rng.gen_range(0..CODE_ALPHABET.len())] as char)
        .collect()
}

async fn invitation_code_length(pool: &SqlitePool) -> Result<usize> {
    let length = get_setting(pool, "invitation_code_length")
        .await?
        .and_then(|v| v.trim().parse::<usize>().ok())
        .unwrap_or(DEFAULT_CODE_LENGTH);
    Ok(length.clamp(4, 32))
}

/// Generate a code not used by any group, regenerating on collision
pub(crate) async fn unique_invitation_code(conn: &mut SqliteConnection, length: usize) -> Result<String> {
    for _ in 0..CODE_ATTEMPTS {
        let code = generate_invitation_code(length);
        let taken: bool =
            sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM groups WHERE invitation_code = ?)")
                .bind(&code)
                .fetch_one(&mut *conn)
                .await?;
        if !taken {
            return Ok(code);
        }
        debug!("Invitation code collision, regenerating");
    }

    Err(Error::Conflict(
        "Could not generate a unique invitation code".to_string(),
    ))
}

pub(crate) async fn fetch_group(conn: &mut SqliteConnection, group_id: GroupId) -> Result<Group> {
    let sql = format!("SELECT {} FROM groups WHERE id = ?", GROUP_COLUMNS);
    let row = sqlx::query(&sql)
        .bind(group_id)
        .fetch_optional(&mut *conn)
        .await?
        .ok_or_else(|| Error::NotFound(format!("Group {} not found", group_id)))?;
    group_from_row(&row)
}

pub(crate) async fn insert_group_settings(
    conn: &mut SqliteConnection,
    group_id: GroupId,
    name: &str,
) -> Result<()> {
    sqlx::query(
        "INSERT OR IGNORE INTO group_settings (group_id, group_name, dark_mode, template) VALUES (?, ?, 1, 'classic')",
    )
    .bind(group_id)
    .bind(name)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Id of the system default group, if it exists
pub async fn default_group_id(pool: &SqlitePool) -> Result<Option<GroupId>> {
    let id = sqlx::query_scalar("SELECT id FROM groups WHERE is_default = 1")
        .fetch_optional(pool)
        .await?;
    Ok(id)
}

/// Create the system default group if missing
pub async fn ensure_default_group(pool: &SqlitePool) -> Result<GroupId> {
    if let Some(id) = default_group_id(pool).await? {
        return Ok(id);
    }

    let name = get_setting(pool, "default_group_name")
        .await?
        .and_then(|v| text::optional(Some(&v)))
        .unwrap_or_else(|| "Band".to_string());
    let length = invitation_code_length(pool).await?;

    let mut tx = pool.begin().await?;
    let code = unique_invitation_code(&mut tx, length).await?;

    let inserted = sqlx::query(
        "INSERT INTO groups (name, invitation_code, is_default, created_at) VALUES (?, ?, 1, ?)",
    )
    .bind(&name)
    .bind(&code)
    .bind(time::now())
    .execute(&mut *tx)
    .await;

    let group_id = match inserted {
        Ok(result) => result.last_insert_rowid(),
        Err(sqlx::Error::Database(db_err)) if db_err.is_unique_violation() => {
            // Created concurrently by another initializer
            drop(tx);
            return default_group_id(pool)
                .await?
                .ok_or_else(|| Error::Internal("Default group vanished".to_string()));
        }
        Err(e) => return Err(e.into()),
    };

    insert_group_settings(&mut tx, group_id, &name).await?;
    tx.commit().await?;

    info!(group_id, name = %name, "Created default group");
    Ok(group_id)
}

/// Create a group; the creator becomes its owner and admin
pub async fn create_group(
    pool: &SqlitePool,
    creator_id: UserId,
    name: &str,
    description: Option<&str>,
    logo_url: Option<&str>,
) -> Result<Group> {
    let name = text::required(name, "name")?;
    let description = text::optional(description);
    let logo_url = text::optional(logo_url);
    let length = invitation_code_length(pool).await?;
    let wait = max_lock_wait_ms(pool).await;

    let (name, description, logo_url) = (name.as_str(), description.as_deref(), logo_url.as_deref());
    let group = retry_on_lock("create group", wait, move || {
        create_group_once(pool, creator_id, name, description, logo_url, length)
    })
    .await?;

    info!(group_id = group.id, creator_id, name = %group.name, "Group created");
    Ok(group)
}

async fn create_group_once(
    pool: &SqlitePool,
    creator_id: UserId,
    name: &str,
    description: Option<&str>,
    logo_url: Option<&str>,
    code_length: usize,
) -> Result<Group> {
    let mut tx = pool.begin().await?;

    let creator_exists: bool = sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM users WHERE id = ?)")
        .bind(creator_id)
        .fetch_one(&mut *tx)
        .await?;
    if !creator_exists {
        return Err(Error::NotFound(format!("User {} not found", creator_id)));
    }

    let code = unique_invitation_code(&mut tx, code_length).await?;
    let now = time::now();

    let group_id = sqlx::query(
        r#"
        INSERT INTO groups (name, invitation_code, description, logo_url, owner_id, is_default, created_at)
        VALUES (?, ?, ?, ?, ?, 0, ?)
        "#,
    )
    .bind(name)
    .bind(&code)
    .bind(description)
    .bind(logo_url)
    .bind(creator_id)
    .bind(now)
    .execute(&mut *tx)
    .await
    .map_err(|e| Error::from_unique_violation(e, "Invitation code already in use"))?
    .last_insert_rowid();

    insert_group_settings(&mut tx, group_id, name).await?;

    sqlx::query(
        "INSERT INTO memberships (user_id, group_id, role, nickname, active, joined_at) VALUES (?, ?, 'admin', NULL, 1, ?)",
    )
    .bind(creator_id)
    .bind(group_id)
    .bind(now)
    .execute(&mut *tx)
    .await?;

    let group = fetch_group(&mut tx, group_id).await?;
    tx.commit().await?;
    Ok(group)
}

/// The actor's selected group; any active member may read it
pub async fn get_group(pool: &SqlitePool, actor: &Actor) -> Result<Group> {
    let mut conn = pool.acquire().await?;
    authorize(&mut *conn, actor, Role::User).await?;
    fetch_group(&mut conn, actor.group_id).await
}

/// Look a group up by invitation code (case-insensitive)
pub async fn find_group_by_code(pool: &SqlitePool, code: &str) -> Result<Option<Group>> {
    let code = code.trim().to_uppercase();
    if code.is_empty() {
        return Ok(None);
    }

    let sql = format!("SELECT {} FROM groups WHERE invitation_code = ?", GROUP_COLUMNS);
    let row = sqlx::query(&sql).bind(&code).fetch_optional(pool).await?;
    row.as_ref().map(group_from_row).transpose()
}

/// Groups in which the user holds an active membership
pub async fn groups_for_user(pool: &SqlitePool, user_id: UserId) -> Result<Vec<GroupSummary>> {
    let rows = sqlx::query(
        r#"
        SELECT g.id, g.name, m.role
        FROM groups g
        JOIN memberships m ON m.group_id = g.id
        WHERE m.user_id = ? AND m.active = 1
        ORDER BY m.joined_at ASC, g.id ASC
        "#,
    )
    .bind(user_id)
    .fetch_all(pool)
    .await?;

    rows.iter()
        .map(|row| {
            Ok(GroupSummary {
                id: row.try_get("id")?,
                name: row.try_get("name")?,
                role: row.try_get::<String, _>("role")?.parse()?,
            })
        })
        .collect()
}

/// Update name, description or logo; group admin only
///
/// A new name is mirrored into the group's settings row.
pub async fn update_group(pool: &SqlitePool, actor: &Actor, changes: &GroupChanges) -> Result<Group> {
    if let Some(name) = &changes.name {
        text::required(name, "name")?;
    }
    let wait = max_lock_wait_ms(pool).await;

    let group = retry_on_lock("update group", wait, move || update_group_once(pool, actor, changes)).await?;
    info!(group_id = group.id, user_id = actor.user_id, "Group updated");
    Ok(group)
}

async fn update_group_once(pool: &SqlitePool, actor: &Actor, changes: &GroupChanges) -> Result<Group> {
    let mut tx = pool.begin().await?;
    authorize(&mut *tx, actor, Role::Admin).await?;
    let current = fetch_group(&mut tx, actor.group_id).await?;

    let name = match &changes.name {
        Some(name) => text::required(name, "name")?,
        None => current.name.clone(),
    };
    let description = match &changes.description {
        Some(d) => text::optional(Some(d)),
        None => current.description.clone(),
    };
    let logo_url = match &changes.logo_url {
        Some(l) => text::optional(Some(l)),
        None => current.logo_url.clone(),
    };

    sqlx::query("UPDATE groups SET name = ?, description = ?, logo_url = ? WHERE id = ?")
        .bind(&name)
        .bind(&description)
        .bind(&logo_url)
        .bind(actor.group_id)
        .execute(&mut *tx)
        .await?;

    if name != current.name {
        insert_group_settings(&mut tx, actor.group_id, &name).await?;
        sqlx::query("UPDATE group_settings SET group_name = ? WHERE group_id = ?")
            .bind(&name)
            .bind(actor.group_id)
            .execute(&mut *tx)
            .await?;
    }

    let group = fetch_group(&mut tx, actor.group_id).await?;
    tx.commit().await?;
    Ok(group)
}

/// Rename the actor's group; group admin only
pub async fn rename_group(pool: &SqlitePool, actor: &Actor, name: &str) -> Result<Group> {
    let changes = GroupChanges {
        name: Some(name.to_string()),
        ..Default::default()
    };
    update_group(pool, actor, &changes).await
}

/// Replace the invitation code; the old code stops working immediately
pub async fn rotate_invitation_code(pool: &SqlitePool, actor: &Actor) -> Result<String> {
    let length = invitation_code_length(pool).await?;
    let wait = max_lock_wait_ms(pool).await;

    let code = retry_on_lock("rotate invitation code", wait, move || async move {
        let mut tx = pool.begin().await?;
        authorize(&mut *tx, actor, Role::Admin).await?;

        let code = unique_invitation_code(&mut tx, length).await?;
        sqlx::query("UPDATE groups SET invitation_code = ? WHERE id = ?")
            .bind(&code)
            .bind(actor.group_id)
            .execute(&mut *tx)
            .await
            .map_err(|e| Error::from_unique_violation(e, "Invitation code already in use"))?;

        tx.commit().await?;
        Ok(code)
    })
    .await?;

    info!(group_id = actor.group_id, user_id = actor.user_id, "Invitation code rotated");
    Ok(code)
}

/// Delete the actor's group and everything it owns; group admin only
///
/// The system default group cannot be deleted.
pub async fn delete_group(pool: &SqlitePool, actor: &Actor) -> Result<()> {
    let wait = max_lock_wait_ms(pool).await;

    retry_on_lock("delete group", wait, move || async move {
        let mut tx = pool.begin().await?;
        authorize(&mut *tx, actor, Role::Admin).await?;

        let group = fetch_group(&mut tx, actor.group_id).await?;
        if group.is_default {
            return Err(Error::InvalidInput(
                "The default group cannot be deleted".to_string(),
            ));
        }

        sqlx::query("DELETE FROM groups WHERE id = ?")
            .bind(actor.group_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    })
    .await?;

    info!(group_id = actor.group_id, user_id = actor.user_id, "Group deleted");
    Ok(())
}
