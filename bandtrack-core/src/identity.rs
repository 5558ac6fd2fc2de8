//! Identity store
//!
//! Users, their handles and account-wide role. Credential material is an
//! opaque string produced and verified by the authentication layer; this
//! module only stores it.

use crate::access::{AccountRole, GroupId, UserId};
use crate::db::{max_lock_wait_ms, retry_on_lock};
use crate::{groups, text, time, Error, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection, SqlitePool};
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct User {
    pub id: UserId,
    pub handle: String,
    pub account_role: AccountRole,
    /// Group selected at last context switch
    pub last_group_id: Option<GroupId>,
    pub created_at: DateTime<Utc>,
}

const USER_COLUMNS: &str = "id, handle, account_role, last_group_id, created_at";

fn user_from_row(row: &SqliteRow) -> Result<User> {
    Ok(User {
        id: row.try_get("id")?,
        handle: row.try_get("handle")?,
        account_role: row.try_get::<String, _>("account_role")?.parse()?,
        last_group_id: row.try_get("last_group_id")?,
        created_at: row.try_get("created_at")?,
    })
}

/// Handles are compared and stored lower-cased
pub fn normalize_handle(handle: &str) -> Result<String> {
    text::required(&handle.to_lowercase(), "handle")
}

pub(crate) async fn fetch_user(conn: &mut SqliteConnection, user_id: UserId) -> Result<User> {
    let sql = format!("SELECT {} FROM users WHERE id = ?", USER_COLUMNS);
    let row = sqlx::query(&sql)
        .bind(user_id)
        .fetch_optional(&mut *conn)
        .await?
        .ok_or_else(|| Error::NotFound(format!("User {} not found", user_id)))?;
    user_from_row(&row)
}

/// Register a new account
///
/// The first account becomes an account admin. Every new account joins the
/// default group with a group role mirroring its account role, and that
/// group becomes its active group.
pub async fn register_user(pool: &SqlitePool, handle: &str, credential: &str) -> Result<User> {
    let handle = normalize_handle(handle)?;
    if credential.is_empty() {
        return Err(Error::InvalidInput("credential is required".to_string()));
    }

    groups::ensure_default_group(pool).await?;
    let wait = max_lock_wait_ms(pool).await;

    let handle = handle.as_str();
    let user = retry_on_lock("register user", wait, move || register_once(pool, handle, credential)).await?;

    info!(
        user_id = user.id,
        handle = %user.handle,
        account_role = %user.account_role,
        "User registered"
    );
    Ok(user)
}

async fn register_once(pool: &SqlitePool, handle: &str, credential: &str) -> Result<User> {
    let mut tx = pool.begin().await?;

    let existing: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM users")
        .fetch_one(&mut *tx)
        .await?;
    let account_role = if existing == 0 {
        AccountRole::Admin
    } else {
        AccountRole::User
    };

    let user_id = sqlx::query(
        "INSERT INTO users (handle, credential, account_role, created_at) VALUES (?, ?, ?, ?)",
    )
    .bind(handle)
    .bind(credential)
    .bind(account_role.as_str())
    .bind(time::now())
    .execute(&mut *tx)
    .await
    .map_err(|e| Error::from_unique_violation(e, format!("Handle '{}' is already taken", handle)))?
    .last_insert_rowid();

    let default_group: Option<(GroupId, Option<UserId>)> =
        sqlx::query_as("SELECT id, owner_id FROM groups WHERE is_default = 1")
            .fetch_optional(&mut *tx)
            .await?;
    let (group_id, owner_id) =
        default_group.ok_or_else(|| Error::Internal("Default group is missing".to_string()))?;

    if owner_id.is_none() {
        sqlx::query("UPDATE groups SET owner_id = ? WHERE id = ?")
            .bind(user_id)
            .bind(group_id)
            .execute(&mut *tx)
            .await?;
    }

    sqlx::query(
        "INSERT OR IGNORE INTO memberships (user_id, group_id, role, active, joined_at) VALUES (?, ?, ?, 1, ?)",
    )
    .bind(user_id)
    .bind(group_id)
    .bind(account_role.default_group_role().as_str())
    .bind(time::now())
    .execute(&mut *tx)
    .await?;

    sqlx::query("UPDATE users SET last_group_id = ? WHERE id = ?")
        .bind(group_id)
        .bind(user_id)
        .execute(&mut *tx)
        .await?;

    let user = fetch_user(&mut tx, user_id).await?;
    tx.commit().await?;
    Ok(user)
}

pub async fn get_user(pool: &SqlitePool, user_id: UserId) -> Result<User> {
    let mut conn = pool.acquire().await?;
    fetch_user(&mut conn, user_id).await
}

pub async fn find_user_by_handle(pool: &SqlitePool, handle: &str) -> Result<Option<User>> {
    let handle = handle.trim().to_lowercase();
    let sql = format!("SELECT {} FROM users WHERE handle = ?", USER_COLUMNS);
    let row = sqlx::query(&sql).bind(&handle).fetch_optional(pool).await?;
    row.as_ref().map(user_from_row).transpose()
}

/// Stored credential for the authentication layer to verify
pub async fn credential_for(pool: &SqlitePool, handle: &str) -> Result<Option<(UserId, String)>> {
    let handle = handle.trim().to_lowercase();
    let row = sqlx::query_as("SELECT id, credential FROM users WHERE handle = ?")
        .bind(&handle)
        .fetch_optional(pool)
        .await?;
    Ok(row)
}

/// Replace the stored credential
pub async fn update_credential(pool: &SqlitePool, user_id: UserId, credential: &str) -> Result<()> {
    if credential.is_empty() {
        return Err(Error::InvalidInput("credential is required".to_string()));
    }

    let updated = sqlx::query("UPDATE users SET credential = ? WHERE id = ?")
        .bind(credential)
        .bind(user_id)
        .execute(pool)
        .await?
        .rows_affected();

    if updated == 0 {
        return Err(Error::NotFound(format!("User {} not found", user_id)));
    }
    Ok(())
}

async fn require_account_admin(conn: &mut SqliteConnection, user_id: UserId) -> Result<()> {
    let role: Option<String> = sqlx::query_scalar("SELECT account_role FROM users WHERE id = ?")
        .bind(user_id)
        .fetch_optional(&mut *conn)
        .await?;

    match role.as_deref().map(str::parse::<AccountRole>).transpose()? {
        Some(AccountRole::Admin) => Ok(()),
        _ => {
            warn!(user_id, "Denied: account admin required");
            Err(Error::Forbidden("Account admin role required".to_string()))
        }
    }
}

/// All accounts; account admins only
pub async fn list_users(pool: &SqlitePool, actor_id: UserId) -> Result<Vec<User>> {
    let mut conn = pool.acquire().await?;
    require_account_admin(&mut conn, actor_id).await?;

    let sql = format!("SELECT {} FROM users ORDER BY handle ASC", USER_COLUMNS);
    let rows = sqlx::query(&sql).fetch_all(&mut *conn).await?;
    rows.iter().map(user_from_row).collect()
}

/// Change an account role; account admins only
///
/// Admins cannot demote themselves. Group roles are left untouched.
pub async fn set_account_role(
    pool: &SqlitePool,
    actor_id: UserId,
    target_id: UserId,
    role: AccountRole,
) -> Result<User> {
    if actor_id == target_id && role != AccountRole::Admin {
        return Err(Error::InvalidInput(
            "Cannot change your own admin role".to_string(),
        ));
    }
    let wait = max_lock_wait_ms(pool).await;

    let user = retry_on_lock("set account role", wait, move || async move {
        let mut tx = pool.begin().await?;
        require_account_admin(&mut tx, actor_id).await?;

        let updated = sqlx::query("UPDATE users SET account_role = ? WHERE id = ?")
            .bind(role.as_str())
            .bind(target_id)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        if updated == 0 {
            return Err(Error::NotFound(format!("User {} not found", target_id)));
        }

        let user = fetch_user(&mut tx, target_id).await?;
        tx.commit().await?;
        Ok(user)
    })
    .await?;

    info!(actor_id, target_id, account_role = %role, "Account role changed");
    Ok(user)
}
