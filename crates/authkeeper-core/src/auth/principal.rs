//! Names of users and roles, and the identity bound to a connection.
//!
//! # Overview
//!
//! Users and roles are both scoped to a database:
//! - [`UserName`] identifies a principal record (`user@db`)
//! - [`RoleName`] identifies a built-in or user-defined role (`role@db`)
//! - [`AuthenticatedUser`] is what a successful handshake leaves behind on
//!   the connection: the name, the mechanism used, and the roles and
//!   privileges resolved at that moment
//!
//! # Example
//!
//! ```
//! use authkeeper_core::auth::{RoleName, UserName};
//!
//! let user = UserName::new("spencer", "test");
//! assert_eq!(user.to_string(), "spencer@test");
//! assert_eq!(user.record_id(), "test.spencer");
//!
//! let role = RoleName::new("readWrite", "test");
//! assert_eq!(role.to_string(), "readWrite@test");
//! ```

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use super::mechanism::Mechanism;
use crate::authz::privileges::PrivilegeSet;
use crate::error::InvalidDatabaseName;

/// Characters never allowed in a database name.
const FORBIDDEN_DB_CHARS: &[char] = &['/', '\\', '.', '"', '$', '*', '<', '>', ':', '|', '?', '\0'];

/// Check that `db` can name a database and its snapshot directory.
///
/// # Errors
///
/// Returns [`InvalidDatabaseName`] for an empty name, whitespace, or any of
/// `/ \ . " $ * < > : | ?` and NUL.
pub fn validate_database_name(db: &str) -> Result<(), InvalidDatabaseName> {
    let reason = if db.is_empty() {
        "must not be empty"
    } else if db.chars().any(char::is_whitespace) {
        "must not contain whitespace"
    } else if db.contains(FORBIDDEN_DB_CHARS) {
        "contains a forbidden character"
    } else {
        return Ok(());
    };
    Err(InvalidDatabaseName {
        name: db.to_string(),
        reason,
    })
}

/// Fully qualified user name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize, Serialize)]
pub struct UserName {
    /// The user name, unique within `db`.
    pub user: String,
    /// The database the user is defined in.
    pub db: String,
}

impl UserName {
    pub fn new(user: impl Into<String>, db: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            db: db.into(),
        }
    }

    /// Identifier of the user's record: `db.user`.
    #[must_use]
    pub fn record_id(&self) -> String {
        format!("{}.{}", self.db, self.user)
    }
}

impl fmt::Display for UserName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.user, self.db)
    }
}

/// Fully qualified role name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize, Serialize)]
pub struct RoleName {
    /// The role name.
    pub role: String,
    /// The database the role is defined in.
    pub db: String,
}

impl RoleName {
    pub fn new(role: impl Into<String>, db: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            db: db.into(),
        }
    }
}

impl fmt::Display for RoleName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.role, self.db)
    }
}

/// Identity bound to a connection after a successful handshake.
///
/// Roles and privileges are resolved once, at authentication time, and stay
/// fixed until the connection re-authenticates or logs out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthenticatedUser {
    /// Who authenticated.
    pub name: UserName,
    /// How they authenticated.
    pub mechanism: Mechanism,
    /// Roles held at authentication time.
    pub roles: BTreeSet<RoleName>,
    /// Effective privileges resolved from `roles`.
    pub privileges: PrivilegeSet,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_name_display() {
        let name = UserName::new("admin", "admin");
        assert_eq!(name.to_string(), "admin@admin");
        assert_eq!(name.record_id(), "admin.admin");
    }

    #[test]
    fn test_role_names_order_by_role_then_db() {
        let mut roles = BTreeSet::new();
        roles.insert(RoleName::new("readWrite", "b"));
        roles.insert(RoleName::new("read", "a"));
        roles.insert(RoleName::new("readWrite", "b"));

        assert_eq!(roles.len(), 2);
        let first = roles.iter().next().unwrap();
        assert_eq!(first.role, "read");
    }

    #[test]
    fn test_database_name_rules() {
        for db in ["test", "admin", "shop_2024", "a-b"] {
            assert!(validate_database_name(db).is_ok(), "{db}");
        }
        for db in ["", "x/y", "/etc", "..", "a.b", "a\\b", "a b", "a\tb", "$db", "a\0b"] {
            assert!(validate_database_name(db).is_err(), "{db:?}");
        }
    }

    #[test]
    fn test_role_name_json_shape() {
        let role = RoleName::new("dbAdmin", "test");
        let json = serde_json::to_value(&role).unwrap();
        assert_eq!(json, serde_json::json!({"role": "dbAdmin", "db": "test"}));
    }
}
