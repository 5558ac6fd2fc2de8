//! Membership ledger
//!
//! One row per (user, group) pair carrying the group role, an optional
//! nickname and the active flag. Inactive rows are kept but grant nothing.

use crate::access::{authorize, check_access, Actor, GroupId, Role, UserId};
use crate::db::{max_lock_wait_ms, retry_on_lock};
use crate::groups::{self, GroupSummary};
use crate::{text, time, Error, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection, SqlitePool};
use tracing::{debug, info};

/// A member as listed within one group
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Member {
    pub user_id: UserId,
    pub group_id: GroupId,
    pub handle: String,
    pub nickname: Option<String>,
    pub role: Role,
    pub active: bool,
    pub joined_at: DateTime<Utc>,
}

impl Member {
    /// Nickname within the group, falling back to the handle
    pub fn display_name(&self) -> &str {
        self.nickname.as_deref().unwrap_or(&self.handle)
    }
}

/// Partial membership update; `None` leaves a field untouched
#[derive(Debug, Clone, Default)]
pub struct MembershipChanges {
    pub role: Option<Role>,
    /// `Some("")` clears the nickname
    pub nickname: Option<String>,
    pub active: Option<bool>,
}

impl MembershipChanges {
    fn is_empty(&self) -> bool {
        self.role.is_none() && self.nickname.is_none() && self.active.is_none()
    }
}

const MEMBER_SELECT: &str = r#"
    SELECT m.user_id, m.group_id, u.handle, m.nickname, m.role, m.active, m.joined_at
    FROM memberships m
    JOIN users u ON u.id = m.user_id
"#;

fn member_from_row(row: &SqliteRow) -> Result<Member> {
    Ok(Member {
        user_id: row.try_get("user_id")?,
        group_id: row.try_get("group_id")?,
        handle: row.try_get("handle")?,
        nickname: row.try_get("nickname")?,
        role: row.try_get::<String, _>("role")?.parse()?,
        active: row.try_get("active")?,
        joined_at: row.try_get("joined_at")?,
    })
}

pub(crate) async fn fetch_member(
    conn: &mut SqliteConnection,
    user_id: UserId,
    group_id: GroupId,
) -> Result<Member> {
    let sql = format!("{} WHERE m.user_id = ? AND m.group_id = ?", MEMBER_SELECT);
    let row = sqlx::query(&sql)
        .bind(user_id)
        .bind(group_id)
        .fetch_optional(&mut *conn)
        .await?
        .ok_or_else(|| {
            Error::NotFound(format!(
                "User {} has no membership in group {}",
                user_id, group_id
            ))
        })?;
    member_from_row(&row)
}

async fn insert_membership(
    conn: &mut SqliteConnection,
    user_id: UserId,
    group_id: GroupId,
    role: Role,
    nickname: Option<&str>,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO memberships (user_id, group_id, role, nickname, active, joined_at) VALUES (?, ?, ?, ?, 1, ?)",
    )
    .bind(user_id)
    .bind(group_id)
    .bind(role.as_str())
    .bind(nickname)
    .bind(time::now())
    .execute(&mut *conn)
    .await
    .map_err(|e| Error::from_unique_violation(e, "Already a member of this group"))?;
    Ok(())
}

/// Join a group by invitation code with the base role
///
/// Any existing row for the pair, active or not, is a conflict: a
/// deactivated member cannot reactivate themself with the code.
pub async fn join_group(
    pool: &SqlitePool,
    user_id: UserId,
    code: &str,
    nickname: Option<&str>,
) -> Result<Member> {
    let code = text::required(code, "code")?;
    let group = groups::find_group_by_code(pool, &code)
        .await?
        .ok_or_else(|| Error::NotFound("Invalid invitation code".to_string()))?;
    let nickname = text::optional(nickname);
    let wait = max_lock_wait_ms(pool).await;

    let group_id = group.id;
    let nickname = nickname.as_deref();
    let member = retry_on_lock("join group", wait, move || async move {
        let mut tx = pool.begin().await?;
        insert_membership(&mut tx, user_id, group_id, Role::User, nickname).await?;
        let member = fetch_member(&mut tx, user_id, group_id).await?;
        tx.commit().await?;
        Ok(member)
    })
    .await?;

    info!(user_id, group_id, "Member joined via invitation code");
    Ok(member)
}

/// Add an existing user to the actor's group; group admin only
pub async fn add_member(
    pool: &SqlitePool,
    actor: &Actor,
    handle: &str,
    role: Role,
    nickname: Option<&str>,
) -> Result<Member> {
    let handle = crate::identity::normalize_handle(handle)?;
    let nickname = text::optional(nickname);
    let wait = max_lock_wait_ms(pool).await;

    let (handle, nickname) = (handle.as_str(), nickname.as_deref());
    let member = retry_on_lock("add member", wait, move || async move {
        let mut tx = pool.begin().await?;
        authorize(&mut *tx, actor, Role::Admin).await?;

        let user_id: UserId = sqlx::query_scalar("SELECT id FROM users WHERE handle = ?")
            .bind(handle)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| Error::NotFound(format!("User '{}' not found", handle)))?;

        insert_membership(&mut tx, user_id, actor.group_id, role, nickname).await?;
        let member = fetch_member(&mut tx, user_id, actor.group_id).await?;
        tx.commit().await?;
        Ok(member)
    })
    .await?;

    info!(
        group_id = actor.group_id,
        user_id = member.user_id,
        role = %member.role,
        added_by = actor.user_id,
        "Member added"
    );
    Ok(member)
}

/// Members of the actor's group in join order; any active member may list
pub async fn list_members(pool: &SqlitePool, actor: &Actor) -> Result<Vec<Member>> {
    let mut conn = pool.acquire().await?;
    authorize(&mut *conn, actor, Role::User).await?;

    let sql = format!(
        "{} WHERE m.group_id = ? ORDER BY m.joined_at ASC, m.id ASC",
        MEMBER_SELECT
    );
    let rows = sqlx::query(&sql)
        .bind(actor.group_id)
        .fetch_all(&mut *conn)
        .await?;

    debug!(group_id = actor.group_id, count = rows.len(), "Listed members");
    rows.iter().map(member_from_row).collect()
}

/// One member of the actor's group; any active member may read
pub async fn get_member(pool: &SqlitePool, actor: &Actor, user_id: UserId) -> Result<Member> {
    let mut conn = pool.acquire().await?;
    authorize(&mut *conn, actor, Role::User).await?;
    fetch_member(&mut conn, user_id, actor.group_id).await
}

/// Change role, nickname or active flag of a member; group admin only
///
/// Takes effect on the target's very next call since access is always
/// resolved from the ledger.
pub async fn update_membership(
    pool: &SqlitePool,
    actor: &Actor,
    user_id: UserId,
    changes: &MembershipChanges,
) -> Result<Member> {
    if changes.is_empty() {
        return Err(Error::InvalidInput("No membership changes supplied".to_string()));
    }
    let wait = max_lock_wait_ms(pool).await;

    let member = retry_on_lock("update membership", wait, move || async move {
        let mut tx = pool.begin().await?;
        authorize(&mut *tx, actor, Role::Admin).await?;
        let current = fetch_member(&mut tx, user_id, actor.group_id).await?;

        let role = changes.role.unwrap_or(current.role);
        let nickname = match &changes.nickname {
            Some(n) => text::optional(Some(n)),
            None => current.nickname.clone(),
        };
        let active = changes.active.unwrap_or(current.active);

        sqlx::query(
            "UPDATE memberships SET role = ?, nickname = ?, active = ? WHERE user_id = ? AND group_id = ?",
        )
        .bind(role.as_str())
        .bind(&nickname)
        .bind(active)
        .bind(user_id)
        .bind(actor.group_id)
        .execute(&mut *tx)
        .await?;

        let member = fetch_member(&mut tx, user_id, actor.group_id).await?;
        tx.commit().await?;
        Ok(member)
    })
    .await?;

    info!(
        group_id = actor.group_id,
        user_id,
        role = %member.role,
        active = member.active,
        updated_by = actor.user_id,
        "Membership updated"
    );
    Ok(member)
}

/// Hard-delete a membership; group admin, or the member leaving
///
/// If the group was the user's active one, the active group falls back to
/// another active membership, or none.
pub async fn remove_member(pool: &SqlitePool, actor: &Actor, user_id: UserId) -> Result<()> {
    let wait = max_lock_wait_ms(pool).await;

    retry_on_lock("remove member", wait, move || async move {
        let mut tx = pool.begin().await?;
        let minimum = if user_id == actor.user_id {
            Role::User
        } else {
            Role::Admin
        };
        authorize(&mut *tx, actor, minimum).await?;

        let deleted = sqlx::query("DELETE FROM memberships WHERE user_id = ? AND group_id = ?")
            .bind(user_id)
            .bind(actor.group_id)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        if deleted == 0 {
            return Err(Error::NotFound(format!(
                "User {} has no membership in group {}",
                user_id, actor.group_id
            )));
        }

        sqlx::query(
            r#"
            UPDATE users SET last_group_id = (
                SELECT m.group_id FROM memberships m
                WHERE m.user_id = users.id AND m.active = 1
                ORDER BY m.joined_at ASC, m.id ASC
                LIMIT 1
            )
            WHERE id = ? AND last_group_id = ?
            "#,
        )
        .bind(user_id)
        .bind(actor.group_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    })
    .await?;

    if user_id == actor.user_id {
        info!(group_id = actor.group_id, user_id, "Member left group");
    } else {
        info!(group_id = actor.group_id, user_id, removed_by = actor.user_id, "Member removed");
    }
    Ok(())
}

/// Select the group subsequent calls act on; requires an active membership
pub async fn switch_active_group(
    pool: &SqlitePool,
    user_id: UserId,
    group_id: GroupId,
) -> Result<GroupSummary> {
    let wait = max_lock_wait_ms(pool).await;

    let summary = retry_on_lock("switch active group", wait, move || async move {
        let mut tx = pool.begin().await?;
        let access = check_access(&mut *tx, user_id, group_id, Role::User).await?;

        sqlx::query("UPDATE users SET last_group_id = ? WHERE id = ?")
            .bind(group_id)
            .bind(user_id)
            .execute(&mut *tx)
            .await?;

        let group = groups::fetch_group(&mut tx, group_id).await?;
        tx.commit().await?;
        Ok(GroupSummary {
            id: group.id,
            name: group.name,
            role: access.role(),
        })
    })
    .await?;

    info!(user_id, group_id, "Switched active group");
    Ok(summary)
}

/// The user's active group, if it is still backed by an active membership
pub async fn active_group(pool: &SqlitePool, user_id: UserId) -> Result<Option<GroupSummary>> {
    let row = sqlx::query(
        r#"
        SELECT g.id, g.name, m.role
        FROM users u
        JOIN groups g ON g.id = u.last_group_id
        JOIN memberships m ON m.group_id = g.id AND m.user_id = u.id
        WHERE u.id = ? AND m.active = 1
        "#,
    )
    .bind(user_id)
    .fetch_optional(pool)
    .await?;

    row.map(|row| {
        Ok(GroupSummary {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            role: row.try_get::<String, _>("role")?.parse()?,
        })
    })
    .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::groups::create_group;
    use crate::identity::{get_user, register_user};

    struct Band {
        pool: SqlitePool,
        admin: Actor,
        group_id: GroupId,
        code: String,
        ben: UserId,
    }

    async fn band() -> Band {
        let pool = crate::db::test_pool().await;
        let ana = register_user(&pool, "ana", "secret").await.unwrap();
        let ben = register_user(&pool, "ben", "secret").await.unwrap();
        let group = create_group(&pool, ana.id, "Band", None, None).await.unwrap();
        Band {
            admin: Actor::new(ana.id, group.id),
            group_id: group.id,
            code: group.invitation_code,
            ben: ben.id,
            pool,
        }
    }

    #[tokio::test]
    async fn test_join_by_code() {
        let b = band().await;

        let member = join_group(&b.pool, b.ben, &b.code.to_lowercase(), Some(" Benny "))
            .await
            .unwrap();
        assert_eq!(member.role, Role::User);
        assert_eq!(member.display_name(), "Benny");
        assert!(member.active);

        let again = join_group(&b.pool, b.ben, &b.code, None).await;
        assert!(matches!(again, Err(Error::Conflict(_))));

        let unknown = join_group(&b.pool, b.ben, "ZZZZZZZZ", None).await;
        assert!(matches!(unknown, Err(Error::NotFound(_))));
    }

    #[tokio::test]
    async fn test_inactive_member_cannot_rejoin() {
        let b = band().await;
        join_group(&b.pool, b.ben, &b.code, None).await.unwrap();
        let changes = MembershipChanges {
            active: Some(false),
            ..Default::default()
        };
        update_membership(&b.pool, &b.admin, b.ben, &changes).await.unwrap();

        assert!(matches!(
            join_group(&b.pool, b.ben, &b.code, None).await,
            Err(Error::Conflict(_))
        ));
        assert!(matches!(
            list_members(&b.pool, &Actor::new(b.ben, b.group_id)).await,
            Err(Error::Forbidden(_))
        ));
    }

    #[tokio::test]
    async fn test_add_member_requires_admin() {
        let b = band().await;
        let carla = register_user(&b.pool, "carla", "secret").await.unwrap();
        join_group(&b.pool, b.ben, &b.code, None).await.unwrap();

        let as_member = add_member(&b.pool, &Actor::new(b.ben, b.group_id), "carla", Role::User, None).await;
        assert!(matches!(as_member, Err(Error::Forbidden(_))));

        let added = add_member(&b.pool, &b.admin, "Carla", Role::Moderator, None).await.unwrap();
        assert_eq!(added.user_id, carla.id);
        assert_eq!(added.role, Role::Moderator);

        assert!(matches!(
            add_member(&b.pool, &b.admin, "carla", Role::User, None).await,
            Err(Error::Conflict(_))
        ));
        assert!(matches!(
            add_member(&b.pool, &b.admin, "nobody", Role::User, None).await,
            Err(Error::NotFound(_))
        ));

        let members = list_members(&b.pool, &b.admin).await.unwrap();
        let handles: Vec<_> = members.iter().map(|m| m.handle.as_str()).collect();
        assert_eq!(handles, vec!["ana", "ben", "carla"]);
    }

    #[tokio::test]
    async fn test_update_membership_validates() {
        let b = band().await;
        join_group(&b.pool, b.ben, &b.code, None).await.unwrap();

        assert!(matches!(
            update_membership(&b.pool, &b.admin, b.ben, &MembershipChanges::default()).await,
            Err(Error::InvalidInput(_))
        ));
        let promote = MembershipChanges {
            role: Some(Role::Moderator),
            nickname: Some("Bass".to_string()),
            ..Default::default()
        };
        assert!(matches!(
            update_membership(&b.pool, &Actor::new(b.ben, b.group_id), b.ben, &promote).await,
            Err(Error::Forbidden(_))
        ));

        let updated = update_membership(&b.pool, &b.admin, b.ben, &promote).await.unwrap();
        assert_eq!(updated.role, Role::Moderator);
        assert_eq!(updated.nickname.as_deref(), Some("Bass"));

        assert!(matches!(
            update_membership(&b.pool, &b.admin, 9999, &promote).await,
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_leave_falls_back_to_other_group() {
        let b = band().await;
        join_group(&b.pool, b.ben, &b.code, None).await.unwrap();
        let ben_actor = Actor::new(b.ben, b.group_id);

        let summary = switch_active_group(&b.pool, b.ben, b.group_id).await.unwrap();
        assert_eq!(summary.role, Role::User);
        assert_eq!(active_group(&b.pool, b.ben).await.unwrap().unwrap().id, b.group_id);

        remove_member(&b.pool, &ben_actor, b.ben).await.unwrap();

        let default_id = groups::default_group_id(&b.pool).await.unwrap().unwrap();
        let ben = get_user(&b.pool, b.ben).await.unwrap();
        assert_eq!(ben.last_group_id, Some(default_id));
        assert!(matches!(
            switch_active_group(&b.pool, b.ben, b.group_id).await,
            Err(Error::Forbidden(_))
        ));
    }

    #[tokio::test]
    async fn test_remove_last_membership_clears_active_group() {
        let b = band().await;
        let default_id = groups::default_group_id(&b.pool).await.unwrap().unwrap();
        let default_admin = Actor::new(b.admin.user_id, default_id);

        remove_member(&b.pool, &default_admin, b.ben).await.unwrap();

        assert_eq!(get_user(&b.pool, b.ben).await.unwrap().last_group_id, None);
        assert!(active_group(&b.pool, b.ben).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_member_cannot_remove_others() {
        let b = band().await;
        join_group(&b.pool, b.ben, &b.code, None).await.unwrap();

        let result = remove_member(&b.pool, &Actor::new(b.ben, b.group_id), b.admin.user_id).await;
        assert!(matches!(result, Err(Error::Forbidden(_))));
        assert!(matches!(
            remove_member(&b.pool, &b.admin, 9999).await,
            Err(Error::NotFound(_))
        ));
    }
}
