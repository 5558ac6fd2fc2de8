//! Shared fixtures for integration tests

#![allow(dead_code)]

use bandtrack_core::db::init_database;
use bandtrack_core::groups::create_group;
use bandtrack_core::identity::register_user;
use bandtrack_core::membership::join_group;
use bandtrack_core::{Actor, UserId};
use sqlx::SqlitePool;
use tempfile::TempDir;

/// File-backed database in a fresh temp directory
///
/// Keep the `TempDir` alive for as long as the pool is used.
pub async fn file_pool() -> (TempDir, SqlitePool) {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let pool = init_database(&dir.path().join("bandtrack.db"))
        .await
        .expect("Failed to initialize database");
    (dir, pool)
}

/// A band with its creator (group admin) and any number of plain members
pub struct Band {
    pub admin: Actor,
    pub members: Vec<Actor>,
    pub invitation_code: String,
}

impl Band {
    pub fn group_id(&self) -> i64 {
        self.admin.group_id
    }

    pub fn member(&self, index: usize) -> Actor {
        self.members[index]
    }
}

pub async fn register(pool: &SqlitePool, handle: &str) -> UserId {
    register_user(pool, handle, "secret")
        .await
        .expect("Failed to register user")
        .id
}

/// Create a group owned by `admin_handle` and join every other handle to it
pub async fn band(pool: &SqlitePool, name: &str, admin_handle: &str, member_handles: &[&str]) -> Band {
    let admin_id = register(pool, admin_handle).await;
    let group = create_group(pool, admin_id, name, None, None)
        .await
        .expect("Failed to create group");

    let mut members = Vec::new();
    for handle in member_handles {
        let user_id = register(pool, handle).await;
        join_group(pool, user_id, &group.invitation_code, None)
            .await
            .expect("Failed to join group");
        members.push(Actor::new(user_id, group.id));
    }

    Band {
        admin: Actor::new(admin_id, group.id),
        members,
        invitation_code: group.invitation_code,
    }
}

/// `likes` and the ledger sum for one suggestion
pub async fn ledger_totals(pool: &SqlitePool, suggestion_id: i64) -> (i64, i64) {
    sqlx::query_as(
        r#"
        SELECT s.likes,
               COALESCE((SELECT SUM(v.count) FROM suggestion_votes v WHERE v.suggestion_id = s.id), 0)
        FROM suggestions s WHERE s.id = ?
        "#,
    )
    .bind(suggestion_id)
    .fetch_one(pool)
    .await
    .expect("Failed to read ledger totals")
}
