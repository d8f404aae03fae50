//! Principal records.
//!
//! [`UserStore`] is the shared, concurrent map of user documents. Each
//! mutation happens under the entry's shard lock, so a reader sees a record
//! either entirely before or entirely after a change.

use std::collections::BTreeSet;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

use crate::auth::principal::{RoleName, UserName};
use crate::error::{UserManagementError, UserManagementResult};

use super::credentials::{CredentialStore, UserCredentials};

/// A stored principal.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct UserDocument {
    /// `db.user`, unique across the deployment.
    #[serde(rename = "_id")]
    pub id: String,
    pub user: String,
    pub db: String,
    pub credentials: UserCredentials,
    /// Held roles. A set, so grants are idempotent.
    #[serde(default)]
    pub roles: BTreeSet<RoleName>,
    #[serde(rename = "customData", default, skip_serializing_if = "Option::is_none")]
    pub custom_data: Option<Map<String, Value>>,
}

impl UserDocument {
    /// Create a document, deriving credentials from a cleartext password.
    pub fn with_password(
        name: &UserName,
        password: &str,
        iterations: u32,
        roles: BTreeSet<RoleName>,
    ) -> Self {
        Self {
            id: name.record_id(),
            user: name.user.clone(),
            db: name.db.clone(),
            credentials: UserCredentials::derive(&name.user, password, iterations),
            roles,
            custom_data: None,
        }
    }

    #[must_use]
    pub fn name(&self) -> UserName {
        UserName::new(self.user.clone(), self.db.clone())
    }

    /// Move this document into another database.
    ///
    /// Roles defined in the old database follow the user; roles from other
    /// databases (e.g. `admin`) are left as they are.
    #[must_use]
    pub fn rehome(mut self, db: &str) -> Self {
        if self.db == db {
            return self;
        }
        let old_db = std::mem::replace(&mut self.db, db.to_string());
        self.id = format!("{}.{}", self.db, self.user);
        self.roles = self
            .roles
            .into_iter()
            .map(|r| {
                if r.db == old_db {
                    RoleName::new(r.role, db)
                } else {
                    r
                }
            })
            .collect();
        self
    }

    /// Public view: everything except credential material.
    #[must_use]
    pub fn to_info(&self) -> Value {
        let mut info = Map::new();
        info.insert("_id".into(), Value::String(self.id.clone()));
        info.insert("user".into(), Value::String(self.user.clone()));
        info.insert("db".into(), Value::String(self.db.clone()));
        info.insert(
            "roles".into(),
            serde_json::to_value(&self.roles).unwrap_or(Value::Array(Vec::new())),
        );
        if let Some(custom) = &self.custom_data {
            info.insert("customData".into(), Value::Object(custom.clone()));
        }
        Value::Object(info)
    }
}

/// Partial update of a user. Omitted fields stay unchanged; present fields
/// replace the stored value entirely.
#[derive(Debug, Clone, Default)]
pub struct UserUpdate {
    pub password: Option<String>,
    pub custom_data: Option<Map<String, Value>>,
    pub roles: Option<BTreeSet<RoleName>>,
}

impl UserUpdate {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.password.is_none() && self.custom_data.is_none() && self.roles.is_none()
    }
}

/// Concurrent store of user documents keyed by [`UserName`].
#[derive(Debug)]
pub struct UserStore {
    users: DashMap<UserName, UserDocument>,
    scram_iterations: u32,
}

impl UserStore {
    /// Create an empty store; `scram_iterations` is used when a password changes.
    #[must_use]
    pub fn new(scram_iterations: u32) -> Self {
        Self {
            users: DashMap::new(),
            scram_iterations,
        }
    }

    #[must_use]
    pub fn scram_iterations(&self) -> u32 {
        self.scram_iterations
    }

    /// Insert a new user.
    ///
    /// # Errors
    ///
    /// Returns [`UserManagementError::DuplicateUser`] if the name is taken.
    pub fn add_user(&self, doc: UserDocument) -> UserManagementResult<()> {
        match self.users.entry(doc.name()) {
            Entry::Occupied(e) => Err(UserManagementError::DuplicateUser(e.key().clone())),
            Entry::Vacant(e) => {
                debug!(user = %e.key(), "user added");
                e.insert(doc);
                Ok(())
            }
        }
    }

    /// Insert or replace a user.
    pub fn upsert_user(&self, doc: UserDocument) {
        self.users.insert(doc.name(), doc);
    }

    /// Fetch a user.
    ///
    /// # Errors
    ///
    /// Returns [`UserManagementError::UserNotFound`] if the user does not exist.
    pub fn get_user(&self, name: &UserName) -> UserManagementResult<UserDocument> {
        self.users
            .get(name)
            .map(|doc| doc.clone())
            .ok_or_else(|| UserManagementError::UserNotFound(name.clone()))
    }

    #[must_use]
    pub fn contains(&self, name: &UserName) -> bool {
        self.users.contains_key(name)
    }

    /// All users defined in `db`, in no particular order.
    #[must_use]
    pub fn get_users(&self, db: &str) -> Vec<UserDocument> {
        self.users
            .iter()
            .filter(|entry| entry.key().db == db)
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Every user in every database.
    #[must_use]
    pub fn all_users(&self) -> Vec<UserDocument> {
        self.users.iter().map(|entry| entry.value().clone()).collect()
    }

    /// Apply a partial update.
    ///
    /// # Errors
    ///
    /// Returns [`UserManagementError::UserNotFound`] if the user does not exist.
    pub fn update_user(&self, name: &UserName, update: UserUpdate) -> UserManagementResult<()> {
        // Derive before taking the entry lock
        let credentials = update
            .password
            .as_deref()
            .map(|pw| UserCredentials::derive(&name.user, pw, self.scram_iterations));

        let mut doc = self
            .users
            .get_mut(name)
            .ok_or_else(|| UserManagementError::UserNotFound(name.clone()))?;

        if let Some(credentials) = credentials {
            doc.credentials = credentials;
        }
        if let Some(custom_data) = update.custom_data {
            doc.custom_data = Some(custom_data);
        }
        if let Some(roles) = update.roles {
            doc.roles = roles;
        }
        Ok(())
    }

    /// Mutate a user's role set in place.
    ///
    /// # Errors
    ///
    /// Returns [`UserManagementError::UserNotFound`] if the user does not exist.
    pub fn modify_roles<F>(&self, name: &UserName, f: F) -> UserManagementResult<BTreeSet<RoleName>>
    where
        F: FnOnce(&mut BTreeSet<RoleName>),
    {
        let mut doc = self
            .users
            .get_mut(name)
            .ok_or_else(|| UserManagementError::UserNotFound(name.clone()))?;
        f(&mut doc.roles);
        Ok(doc.roles.clone())
    }

    /// Remove a role from every user holding it. Returns how many users changed.
    pub fn strip_role(&self, role: &RoleName) -> usize {
        let mut changed = 0;
        for mut entry in self.users.iter_mut() {
            if entry.roles.remove(role) {
                changed += 1;
            }
        }
        changed
    }

    /// Remove a user.
    ///
    /// # Errors
    ///
    /// Returns [`UserManagementError::UserNotFound`] if the user does not exist.
    pub fn drop_user(&self, name: &UserName) -> UserManagementResult<()> {
        self.users
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| UserManagementError::UserNotFound(name.clone()))
    }

    /// Remove every user of `db`. Returns the number removed.
    pub fn drop_all_users(&self, db: &str) -> usize {
        let before = self.users.len();
        self.users.retain(|name, _| name.db != db);
        before.saturating_sub(self.users.len())
    }

    #[must_use]
    pub fn user_count(&self) -> usize {
        self.users.len()
    }
}

impl CredentialStore for UserStore {
    fn get_credentials(&self, user: &UserName) -> Option<UserCredentials> {
        self.users.get(user).map(|doc| doc.credentials.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::sasl::scram::MIN_ITERATIONS;

    fn store_with(users: &[(&str, &str)]) -> UserStore {
        let store = UserStore::new(MIN_ITERATIONS);
        for (user, db) in users {
            let name = UserName::new(*user, *db);
            store
                .add_user(UserDocument::with_password(
                    &name,
                    "password",
                    MIN_ITERATIONS,
                    BTreeSet::new(),
                ))
                .unwrap();
        }
        store
    }

    #[test]
    fn test_add_and_get() {
        let store = store_with(&[("spencer", "test")]);
        let doc = store.get_user(&UserName::new("spencer", "test")).unwrap();
        assert_eq!(doc.id, "test.spencer");
        assert!(doc.credentials.verify_password("spencer", "password"));
    }

    #[test]
    fn test_duplicate_user() {
        let store = store_with(&[("spencer", "test")]);
        let name = UserName::new("spencer", "test");
        let result = store.add_user(UserDocument::with_password(
            &name,
            "other",
            MIN_ITERATIONS,
            BTreeSet::new(),
        ));
        assert_eq!(result, Err(UserManagementError::DuplicateUser(name.clone())));

        // Original credentials untouched
        assert!(store.validate(&name, "password"));
    }

    #[test]
    fn test_same_user_name_in_two_databases() {
        let store = store_with(&[("andy", "test"), ("andy", "other")]);
        assert_eq!(store.user_count(), 2);
        assert_eq!(store.get_users("test").len(), 1);
    }

    #[test]
    fn test_get_missing_user() {
        let store = store_with(&[]);
        let name = UserName::new("ghost", "test");
        assert_eq!(
            store.get_user(&name),
            Err(UserManagementError::UserNotFound(name))
        );
    }

    #[test]
    fn test_update_replaces_only_present_fields() {
        let store = store_with(&[("spencer", "test")]);
        let name = UserName::new("spencer", "test");

        let mut custom = Map::new();
        custom.insert("zipCode".into(), Value::from(10028));
        store
            .update_user(
                &name,
                UserUpdate {
                    custom_data: Some(custom.clone()),
                    ..UserUpdate::default()
                },
            )
            .unwrap();

        let doc = store.get_user(&name).unwrap();
        assert_eq!(doc.custom_data, Some(custom));
        assert!(doc.credentials.verify_password("spencer", "password"));

        store
            .update_user(
                &name,
                UserUpdate {
                    password: Some("password2".into()),
                    ..UserUpdate::default()
                },
            )
            .unwrap();

        let updated = store.get_user(&name).unwrap();
        assert!(updated.credentials.verify_password("spencer", "password2"));
        assert_ne!(
            updated.credentials.password_digest,
            doc.credentials.password_digest
        );
        assert!(updated.custom_data.is_some());
    }

    #[test]
    fn test_update_missing_user() {
        let store = store_with(&[]);
        let result = store.update_user(&UserName::new("ghost", "test"), UserUpdate::default());
        assert!(matches!(result, Err(UserManagementError::UserNotFound(_))));
    }

    #[test]
    fn test_drop_user_and_drop_all() {
        let store = store_with(&[("a", "test"), ("b", "test"), ("c", "other")]);

        store.drop_user(&UserName::new("a", "test")).unwrap();
        assert!(store.drop_user(&UserName::new("a", "test")).is_err());

        assert_eq!(store.drop_all_users("test"), 1);
        assert_eq!(store.drop_all_users("test"), 0);
        assert_eq!(store.user_count(), 1);
    }

    #[test]
    fn test_strip_role() {
        let store = store_with(&[("a", "test"), ("b", "test")]);
        let role = RoleName::new("custom", "test");
        store
            .modify_roles(&UserName::new("a", "test"), |roles| {
                roles.insert(role.clone());
            })
            .unwrap();

        assert_eq!(store.strip_role(&role), 1);
        assert!(store
            .get_user(&UserName::new("a", "test"))
            .unwrap()
            .roles
            .is_empty());
    }

    #[test]
    fn test_rehome_moves_local_roles() {
        let name = UserName::new("u", "src");
        let roles = BTreeSet::from([RoleName::new("read", "src"), RoleName::new("root", "admin")]);
        let doc = UserDocument::with_password(&name, "pw", MIN_ITERATIONS, roles).rehome("dst");

        assert_eq!(doc.id, "dst.u");
        assert_eq!(doc.db, "dst");
        assert!(doc.roles.contains(&RoleName::new("read", "dst")));
        assert!(doc.roles.contains(&RoleName::new("root", "admin")));
    }

    #[test]
    fn test_info_hides_credentials() {
        let name = UserName::new("u", "test");
        let doc = UserDocument::with_password(&name, "pw", MIN_ITERATIONS, BTreeSet::new());
        let info = doc.to_info();
        assert!(info.get("credentials").is_none());
        assert_eq!(info["user"], "u");
        assert_eq!(info["roles"], serde_json::json!([]));
    }
}
