//! Access control
//!
//! Resolves "does user U hold at least role R in group G" from the membership
//! ledger. The result is a [`GroupAccess`] capability that lives for a single
//! operation: it is rebuilt from the ledger on every call (inside the
//! operation's own transaction for writes) and never stored, so a demotion,
//! removal or group switch takes effect on the very next call.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tracing::warn;

pub type UserId = i64;
pub type GroupId = i64;

/// Group-scoped role, ordered `User < Moderator < Admin`
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Moderator,
    Admin,
}

impl Role {
    pub fn rank(self) -> u8 {
        match self {
            Role::User => 1,
            Role::Moderator => 2,
            Role::Admin => 3,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Moderator => "moderator",
            Role::Admin => "admin",
        }
    }

    /// True if this role satisfies a `minimum` requirement
    pub fn satisfies(self, minimum: Role) -> bool {
        self.rank() >= minimum.rank()
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "user" => Ok(Role::User),
            "moderator" => Ok(Role::Moderator),
            "admin" => Ok(Role::Admin),
            other => Err(Error::InvalidInput(format!("Unknown role '{}'", other))),
        }
    }
}

/// Account-wide role, independent of any group role
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccountRole {
    User,
    Admin,
}

impl AccountRole {
    pub fn as_str(self) -> &'static str {
        match self {
            AccountRole::User => "user",
            AccountRole::Admin => "admin",
        }
    }

    /// Group role granted in the default group at registration
    pub fn default_group_role(self) -> Role {
        match self {
            AccountRole::User => Role::User,
            AccountRole::Admin => Role::Admin,
        }
    }
}

impl fmt::Display for AccountRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AccountRole {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "user" => Ok(AccountRole::User),
            "admin" => Ok(AccountRole::Admin),
            other => Err(Error::InvalidInput(format!("Unknown account role '{}'", other))),
        }
    }
}

/// Acting user and the group selected for the request
///
/// Supplied by the session layer on every call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Actor {
    pub user_id: UserId,
    pub group_id: GroupId,
}

impl Actor {
    pub fn new(user_id: UserId, group_id: GroupId) -> Self {
        Self { user_id, group_id }
    }
}

/// Proof that a user held a role in a group at the time of the check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GroupAccess {
    user_id: UserId,
    group_id: GroupId,
    role: Role,
}

impl GroupAccess {
    pub fn user_id(&self) -> UserId {
        self.user_id
    }

    pub fn group_id(&self) -> GroupId {
        self.group_id
    }

    /// Actual role held, which may exceed the minimum that was requested
    pub fn role(&self) -> Role {
        self.role
    }

    pub fn at_least(&self, minimum: Role) -> bool {
        self.role.satisfies(minimum)
    }

    /// Own item or moderator+
    pub fn can_manage(&self, creator_id: UserId) -> bool {
        self.user_id == creator_id || self.at_least(Role::Moderator)
    }

    pub fn require_manage(&self, creator_id: UserId, what: &str) -> Result<()> {
        if self.can_manage(creator_id) {
            return Ok(());
        }
        warn!(
            user_id = self.user_id,
            group_id = self.group_id,
            role = %self.role,
            "Denied {}: not creator and below moderator",
            what
        );
        Err(Error::Forbidden(format!(
            "Only the creator or a moderator can modify this {}",
            what
        )))
    }
}

/// `checkAccess(userId, groupId, minimumRole) -> role | denied`
///
/// Absent or inactive memberships are denied, as are roles ranked below
/// `minimum`. Accepts a pool or a connection inside an open transaction.
pub async fn check_access<'e, E>(
    executor: E,
    user_id: UserId,
    group_id: GroupId,
    minimum: Role,
) -> Result<GroupAccess>
where
    E: sqlx::SqliteExecutor<'e>,
{
    let membership: Option<(String, bool)> =
        sqlx::query_as("SELECT role, active FROM memberships WHERE user_id = ? AND group_id = ?")
            .bind(user_id)
            .bind(group_id)
            .fetch_optional(executor)
            .await?;

    let role = match membership {
        Some((role, true)) => role.parse::<Role>()?,
        Some((_, false)) | None => {
            warn!(user_id, group_id, "Denied: not an active member of group");
            return Err(Error::Forbidden(format!(
                "User {} is not a member of group {}",
                user_id, group_id
            )));
        }
    };

    if !role.satisfies(minimum) {
        warn!(user_id, group_id, role = %role, required = %minimum, "Denied: role too low");
        return Err(Error::Forbidden(format!("{} role required", minimum)));
    }

    Ok(GroupAccess {
        user_id,
        group_id,
        role,
    })
}

/// [`check_access`] for the actor's selected group
pub async fn authorize<'e, E>(executor: E, actor: &Actor, minimum: Role) -> Result<GroupAccess>
where
    E: sqlx::SqliteExecutor<'e>,
{
    check_access(executor, actor.user_id, actor.group_id, minimum).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_order() {
        assert!(Role::Admin > Role::Moderator);
        assert!(Role::Moderator > Role::User);
        assert!(Role::Admin.satisfies(Role::User));
        assert!(!Role::User.satisfies(Role::Moderator));
    }

    #[test]
    fn test_role_parse() {
        assert_eq!("Moderator".parse::<Role>().unwrap(), Role::Moderator);
        assert_eq!(" admin ".parse::<Role>().unwrap(), Role::Admin);
        assert!(matches!("owner".parse::<Role>(), Err(Error::InvalidInput(_))));
        assert!(matches!("moderator".parse::<AccountRole>(), Err(Error::InvalidInput(_))));
    }

    #[test]
    fn test_can_manage() {
        let member = GroupAccess {
            user_id: 2,
            group_id: 1,
            role: Role::User,
        };
        assert!(member.can_manage(2));
        assert!(!member.can_manage(3));
        assert!(matches!(member.require_manage(3, "rehearsal"), Err(Error::Forbidden(_))));

        let moderator = GroupAccess {
            role: Role::Moderator,
            ..member
        };
        assert!(moderator.can_manage(3));
    }

    #[tokio::test]
    async fn test_check_access_against_ledger() {
        let pool = crate::db::test_pool().await;

        sqlx::query("INSERT INTO users (id, handle, credential) VALUES (10, 'ana', 'x'), (11, 'ben', 'x')")
            .execute(&pool)
            .await
            .unwrap();
        let group_id: i64 = sqlx::query_scalar("SELECT id FROM groups WHERE is_default = 1")
            .fetch_one(&pool)
            .await
            .unwrap();
        sqlx::query("INSERT INTO memberships (user_id, group_id, role, active) VALUES (10, ?, 'moderator', 1), (11, ?, 'admin', 0)")
            .bind(group_id)
            .bind(group_id)
            .execute(&pool)
            .await
            .unwrap();

        let access = check_access(&pool, 10, group_id, Role::User).await.unwrap();
        assert_eq!(access.role(), Role::Moderator, "Returns the actual role, not the minimum");
        assert!(matches!(
            check_access(&pool, 10, group_id, Role::Admin).await,
            Err(Error::Forbidden(_))
        ));

        // Inactive admin is not a member at all
        assert!(matches!(
            check_access(&pool, 11, group_id, Role::User).await,
            Err(Error::Forbidden(_))
        ));

        // Unknown group
        assert!(matches!(
            check_access(&pool, 10, group_id + 100, Role::User).await,
            Err(Error::Forbidden(_))
        ));
    }
}
