//! Per-group settings
//!
//! One row per group: display name, theme and the next-rehearsal hint shown
//! to members. The display name mirrors the group's name.

use crate::access::{authorize, Actor, GroupId, Role};
use crate::db::{max_lock_wait_ms, retry_on_lock};
use crate::groups::{fetch_group, insert_group_settings};
use crate::{text, time, Error, Result};
use chrono::NaiveDate;
use serde::Serialize;
use sqlx::{Row, SqliteConnection, SqlitePool};
use tracing::info;

pub const DEFAULT_TEMPLATE: &str = "classic";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GroupSettings {
    pub group_id: GroupId,
    pub group_name: String,
    pub dark_mode: bool,
    pub template: String,
    pub next_rehearsal_date: Option<NaiveDate>,
    pub next_rehearsal_location: Option<String>,
}

/// Partial settings update; `None` keeps the stored value
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SettingsChanges {
    pub group_name: Option<String>,
    pub dark_mode: Option<bool>,
    /// Empty resets to the default template
    pub template: Option<String>,
    /// `YYYY-MM-DD`; empty clears the hint
    pub next_rehearsal_date: Option<String>,
    /// Empty clears the hint
    pub next_rehearsal_location: Option<String>,
}

impl SettingsChanges {
    fn is_empty(&self) -> bool {
        self.group_name.is_none()
            && self.dark_mode.is_none()
            && self.template.is_none()
            && self.next_rehearsal_date.is_none()
            && self.next_rehearsal_location.is_none()
    }
}

/// Settings row of a group, created with defaults when missing
async fn load_settings(conn: &mut SqliteConnection, group_id: GroupId) -> Result<GroupSettings> {
    let group = fetch_group(conn, group_id).await?;
    insert_group_settings(conn, group_id, &group.name).await?;

    let row = sqlx::query(
        r#"
        SELECT group_name, dark_mode, template, next_rehearsal_date, next_rehearsal_location
        FROM group_settings WHERE group_id = ?
        "#,
    )
    .bind(group_id)
    .fetch_one(&mut *conn)
    .await?;

    let template: Option<String> = row.try_get("template")?;
    let date: Option<String> = row.try_get("next_rehearsal_date")?;
    Ok(GroupSettings {
        group_id,
        group_name: row.try_get("group_name")?,
        dark_mode: row.try_get("dark_mode")?,
        template: text::optional(template.as_deref()).unwrap_or_else(|| DEFAULT_TEMPLATE.to_string()),
        next_rehearsal_date: date
            .as_deref()
            .and_then(|d| text::optional(Some(d)))
            .map(|d| time::parse_date(&d))
            .transpose()?,
        next_rehearsal_location: row.try_get("next_rehearsal_location")?,
    })
}

/// Settings of the actor's group; any member may read
pub async fn group_settings(pool: &SqlitePool, actor: &Actor) -> Result<GroupSettings> {
    let wait = max_lock_wait_ms(pool).await;

    retry_on_lock("read group settings", wait, move || async move {
        let mut tx = pool.begin().await?;
        authorize(&mut *tx, actor, Role::User).await?;
        let settings = load_settings(&mut tx, actor.group_id).await?;
        tx.commit().await?;
        Ok(settings)
    })
    .await
}

/// Update the actor's group settings; group admin only
///
/// A new display name is written to the group as well.
pub async fn update_group_settings(
    pool: &SqlitePool,
    actor: &Actor,
    changes: &SettingsChanges,
) -> Result<GroupSettings> {
    if changes.is_empty() {
        return Err(Error::InvalidInput("No settings changes supplied".to_string()));
    }
    if let Some(name) = &changes.group_name {
        text::required(name, "group name")?;
    }
    if let Some(date) = changes.next_rehearsal_date.as_deref().and_then(|d| text::optional(Some(d))) {
        time::parse_date(&date)?;
    }
    let wait = max_lock_wait_ms(pool).await;

    let settings = retry_on_lock("update group settings", wait, move || async move {
        let mut tx = pool.begin().await?;
        authorize(&mut *tx, actor, Role::Admin).await?;
        let current = load_settings(&mut tx, actor.group_id).await?;

        let group_name = match &changes.group_name {
            Some(name) => text::required(name, "group name")?,
            None => current.group_name.clone(),
        };
        let template = match &changes.template {
            Some(t) => text::optional(Some(t)).unwrap_or_else(|| DEFAULT_TEMPLATE.to_string()),
            None => current.template.clone(),
        };
        let next_date = match &changes.next_rehearsal_date {
            Some(d) => text::optional(Some(d)).map(|d| time::parse_date(&d)).transpose()?,
            None => current.next_rehearsal_date,
        };
        let next_location = match &changes.next_rehearsal_location {
            Some(l) => text::optional(Some(l)),
            None => current.next_rehearsal_location.clone(),
        };

        sqlx::query(
            r#"
            UPDATE group_settings
            SET group_name = ?, dark_mode = ?, template = ?, next_rehearsal_date = ?, next_rehearsal_location = ?
            WHERE group_id = ?
            "#,
        )
        .bind(&group_name)
        .bind(changes.dark_mode.unwrap_or(current.dark_mode))
        .bind(&template)
        .bind(next_date)
        .bind(&next_location)
        .bind(actor.group_id)
        .execute(&mut *tx)
        .await?;

        if group_name != current.group_name {
            sqlx::query("UPDATE groups SET name = ? WHERE id = ?")
                .bind(&group_name)
                .bind(actor.group_id)
                .execute(&mut *tx)
                .await?;
        }

        let settings = load_settings(&mut tx, actor.group_id).await?;
        tx.commit().await?;
        Ok(settings)
    })
    .await?;

    info!(group_id = actor.group_id, user_id = actor.user_id, "Group settings updated");
    Ok(settings)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::groups::{create_group, get_group};
    use crate::identity::register_user;
    use crate::membership::join_group;

    async fn setup() -> (SqlitePool, Actor, Actor) {
        let pool = crate::db::test_pool().await;
        let ana = register_user(&pool, "ana", "secret").await.unwrap();
        let ben = register_user(&pool, "ben", "secret").await.unwrap();
        let group = create_group(&pool, ana.id, "Band", None, None).await.unwrap();
        join_group(&pool, ben.id, &group.invitation_code, None).await.unwrap();
        (pool, Actor::new(ana.id, group.id), Actor::new(ben.id, group.id))
    }

    #[tokio::test]
    async fn test_missing_row_is_recreated() {
        let (pool, _ana, ben) = setup().await;
        sqlx::query("DELETE FROM group_settings WHERE group_id = ?")
            .bind(ben.group_id)
            .execute(&pool)
            .await
            .unwrap();

        let settings = group_settings(&pool, &ben).await.unwrap();
        assert_eq!(settings.group_name, "Band");
        assert!(settings.dark_mode);
        assert_eq!(settings.template, DEFAULT_TEMPLATE);
        assert_eq!(settings.next_rehearsal_date, None);
    }

    #[tokio::test]
    async fn test_update_is_admin_only_and_syncs_name() {
        let (pool, ana, ben) = setup().await;
        let changes = SettingsChanges {
            group_name: Some("The Encores".to_string()),
            dark_mode: Some(false),
            template: Some("  ".to_string()),
            next_rehearsal_date: Some("2026-11-02".to_string()),
            next_rehearsal_location: Some("Studio B".to_string()),
        };

        assert!(matches!(
            update_group_settings(&pool, &ben, &changes).await,
            Err(Error::Forbidden(_))
        ));

        let settings = update_group_settings(&pool, &ana, &changes).await.unwrap();
        assert_eq!(settings.group_name, "The Encores");
        assert!(!settings.dark_mode);
        assert_eq!(settings.template, DEFAULT_TEMPLATE);
        assert_eq!(settings.next_rehearsal_date, NaiveDate::from_ymd_opt(2026, 11, 2));
        assert_eq!(settings.next_rehearsal_location.as_deref(), Some("Studio B"));
        assert_eq!(get_group(&pool, &ben).await.unwrap().name, "The Encores");

        let cleared = update_group_settings(
            &pool,
            &ana,
            &SettingsChanges {
                next_rehearsal_date: Some(String::new()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        assert_eq!(cleared.next_rehearsal_date, None);
        assert_eq!(cleared.next_rehearsal_location.as_deref(), Some("Studio B"));
    }

    #[tokio::test]
    async fn test_update_validates_input() {
        let (pool, ana, _ben) = setup().await;
        assert!(matches!(
            update_group_settings(&pool, &ana, &SettingsChanges::default()).await,
            Err(Error::InvalidInput(_))
        ));
        assert!(matches!(
            update_group_settings(
                &pool,
                &ana,
                &SettingsChanges {
                    next_rehearsal_date: Some("next tuesday".to_string()),
                    ..Default::default()
                }
            )
            .await,
            Err(Error::InvalidInput(_))
        ));
    }
}
