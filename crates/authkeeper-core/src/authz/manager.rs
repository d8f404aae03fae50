//! Administrative writes over users and roles.
//!
//! Every mutation takes the update lock first. A writer that cannot get it
//! within the configured timeout fails with
//! [`UserManagementError::LockBusy`] instead of queueing forever.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, MutexGuard};
use serde_json::{Map, Value};
use tracing::info;

use crate::auth::mechanism::Mechanism;
use crate::auth::principal::{validate_database_name, AuthenticatedUser, RoleName, UserName};
use crate::error::{UserManagementError, UserManagementResult};
use crate::store::users::{UserDocument, UserStore, UserUpdate};

use super::privileges::Privilege;
use super::roles::{ResolvedRoles, RoleDocument, RoleRegistry};

/// Arguments of `createUser`.
#[derive(Debug, Clone)]
pub struct CreateUserRequest {
    pub name: UserName,
    pub password: String,
    pub roles: BTreeSet<RoleName>,
    pub custom_data: Option<Map<String, Value>>,
}

/// Owns the user store and role registry and serializes writes to both.
#[derive(Debug)]
pub struct AuthorizationManager {
    users: Arc<UserStore>,
    roles: Arc<RoleRegistry>,
    update_lock: Mutex<()>,
    lock_timeout: Duration,
}

impl AuthorizationManager {
    #[must_use]
    pub fn new(users: Arc<UserStore>, roles: Arc<RoleRegistry>, lock_timeout: Duration) -> Self {
        Self {
            users,
            roles,
            update_lock: Mutex::new(()),
            lock_timeout,
        }
    }

    #[must_use]
    pub fn users(&self) -> &Arc<UserStore> {
        &self.users
    }

    #[must_use]
    pub fn roles(&self) -> &Arc<RoleRegistry> {
        &self.roles
    }

    /// Take the update lock, or fail after the configured timeout.
    ///
    /// # Errors
    ///
    /// Returns [`UserManagementError::LockBusy`] on timeout.
    pub fn lock_for_update(&self, operation: &str) -> UserManagementResult<MutexGuard<'_, ()>> {
        self.update_lock
            .try_lock_for(self.lock_timeout)
            .ok_or_else(|| UserManagementError::LockBusy(operation.to_string()))
    }

    fn check_roles_exist(&self, roles: &BTreeSet<RoleName>) -> UserManagementResult<()> {
        match self.roles.first_missing(roles) {
            Some(missing) => Err(UserManagementError::UnknownRole(missing.clone())),
            None => Ok(()),
        }
    }

    /// Create a user.
    ///
    /// # Errors
    ///
    /// Fails on an invalid database name, an empty name or password, an
    /// unknown role, or a duplicate user.
    pub fn create_user(&self, request: CreateUserRequest) -> UserManagementResult<()> {
        self.insert_user(request, false)
    }

    /// Create the first user of the deployment.
    ///
    /// # Errors
    ///
    /// As [`create_user`](Self::create_user), plus
    /// [`UserManagementError::Unauthorized`] if any user exists by the time
    /// the update lock is held.
    pub fn create_first_user(&self, request: CreateUserRequest) -> UserManagementResult<()> {
        self.insert_user(request, true)
    }

    fn insert_user(&self, request: CreateUserRequest, first: bool) -> UserManagementResult<()> {
        validate_database_name(&request.name.db)
            .map_err(|err| UserManagementError::InvalidArgument(err.to_string()))?;
        if request.name.user.is_empty() {
            return Err(UserManagementError::InvalidArgument(
                "user name must not be empty".into(),
            ));
        }
        if request.password.is_empty() {
            return Err(UserManagementError::InvalidArgument(
                "password must not be empty".into(),
            ));
        }

        let _guard = self.lock_for_update("createUser")?;
        if first && self.users.user_count() > 0 {
            return Err(UserManagementError::Unauthorized(format!(
                "users exist, not authorized on {} to execute command createUser",
                request.name.db
            )));
        }
        self.check_roles_exist(&request.roles)?;
        if self.users.contains(&request.name) {
            return Err(UserManagementError::DuplicateUser(request.name));
        }

        let mut doc = UserDocument::with_password(
            &request.name,
            &request.password,
            self.users.scram_iterations(),
            request.roles,
        );
        doc.custom_data = request.custom_data;
        self.users.add_user(doc)?;

        info!(user = %request.name, "user created");
        Ok(())
    }

    /// Update a user's password, custom data or role set.
    ///
    /// # Errors
    ///
    /// Fails on an empty update, an empty password, an unknown role or a
    /// missing user.
    pub fn update_user(&self, name: &UserName, update: UserUpdate) -> UserManagementResult<()> {
        if update.is_empty() {
            return Err(UserManagementError::InvalidArgument(
                "must specify at least one field to update".into(),
            ));
        }
        if update.password.as_deref() == Some("") {
            return Err(UserManagementError::InvalidArgument(
                "password must not be empty".into(),
            ));
        }

        let _guard = self.lock_for_update("updateUser")?;
        if let Some(roles) = &update.roles {
            self.check_roles_exist(roles)?;
        }
        self.users.update_user(name, update)?;

        info!(user = %name, "user updated");
        Ok(())
    }

    /// Remove a user.
    ///
    /// # Errors
    ///
    /// Fails if the user does not exist.
    pub fn drop_user(&self, name: &UserName) -> UserManagementResult<()> {
        let _guard = self.lock_for_update("dropUser")?;
        self.users.drop_user(name)?;
        info!(user = %name, "user dropped");
        Ok(())
    }

    /// Remove every user of a database.
    ///
    /// # Errors
    ///
    /// Fails only if the update lock is busy.
    pub fn drop_all_users(&self, db: &str) -> UserManagementResult<usize> {
        let _guard = self.lock_for_update("dropAllUsersFromDatabase")?;
        let removed = self.users.drop_all_users(db);
        info!(db = %db, removed, "all users dropped");
        Ok(removed)
    }

    /// Grant roles. All-or-nothing: one unknown role leaves the user untouched.
    ///
    /// # Errors
    ///
    /// Fails if the user does not exist or any role is unknown.
    pub fn grant_roles(
        &self,
        name: &UserName,
        roles: &BTreeSet<RoleName>,
    ) -> UserManagementResult<BTreeSet<RoleName>> {
        let _guard = self.lock_for_update("grantRolesToUser")?;
        if !self.users.contains(name) {
            return Err(UserManagementError::UserNotFound(name.clone()));
        }
        self.check_roles_exist(roles)?;

        let held = self
            .users
            .modify_roles(name, |held| held.extend(roles.iter().cloned()))?;
        info!(user = %name, granted = roles.len(), "roles granted");
        Ok(held)
    }

    /// Revoke roles. Roles that are not held, or do not exist, are ignored.
    ///
    /// # Errors
    ///
    /// Fails only if the user does not exist.
    pub fn revoke_roles(
        &self,
        name: &UserName,
        roles: &BTreeSet<RoleName>,
    ) -> UserManagementResult<BTreeSet<RoleName>> {
        let _guard = self.lock_for_update("revokeRolesFromUser")?;
        let held = self.users.modify_roles(name, |held| {
            for role in roles {
                held.remove(role);
            }
        })?;
        info!(user = %name, "roles revoked");
        Ok(held)
    }

    /// Create a user-defined role.
    ///
    /// # Errors
    ///
    /// See [`RoleRegistry::create_role`].
    pub fn create_role(
        &self,
        name: &RoleName,
        privileges: Vec<Privilege>,
        roles: BTreeSet<RoleName>,
    ) -> UserManagementResult<()> {
        let _guard = self.lock_for_update("createRole")?;
        self.roles
            .create_role(RoleDocument::new(name, privileges, roles))?;
        info!(role = %name, "role created");
        Ok(())
    }

    /// Drop a user-defined role and remove it from every holder.
    ///
    /// # Errors
    ///
    /// See [`RoleRegistry::drop_role`].
    pub fn drop_role(&self, name: &RoleName) -> UserManagementResult<usize> {
        let _guard = self.lock_for_update("dropRole")?;
        self.roles.drop_role(name)?;
        let stripped = self.users.strip_role(name);
        info!(role = %name, stripped, "role dropped");
        Ok(stripped)
    }

    /// Drop every user and user-defined role of a database.
    ///
    /// # Errors
    ///
    /// Fails only if the update lock is busy.
    pub fn drop_database(&self, db: &str) -> UserManagementResult<(usize, usize)> {
        let _guard = self.lock_for_update("dropDatabase")?;
        let users = self.users.drop_all_users(db);
        let roles = self.roles.drop_all_roles(db);
        Ok((users, roles))
    }

    /// Resolve roles and privileges of an existing user.
    #[must_use]
    pub fn resolve_user(&self, name: &UserName) -> Option<ResolvedRoles> {
        let doc = self.users.get_user(name).ok()?;
        Some(self.roles.resolve(&doc.roles))
    }

    /// Snapshot of a user's identity, taken at authentication time.
    #[must_use]
    pub fn authenticated_user(
        &self,
        name: &UserName,
        mechanism: Mechanism,
    ) -> Option<AuthenticatedUser> {
        let doc = self.users.get_user(name).ok()?;
        let resolved = self.roles.resolve(&doc.roles);
        Some(AuthenticatedUser {
            name: name.clone(),
            mechanism,
            roles: doc.roles,
            privileges: resolved.privileges,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::sasl::scram::MIN_ITERATIONS;
    use crate::authz::privileges::{ActionType, ResourcePattern};

    fn manager() -> AuthorizationManager {
        AuthorizationManager::new(
            Arc::new(UserStore::new(MIN_ITERATIONS)),
            Arc::new(RoleRegistry::new()),
            Duration::from_millis(50),
        )
    }

    fn create(manager: &AuthorizationManager, user: &str, db: &str, roles: &[&str]) {
        manager
            .create_user(CreateUserRequest {
                name: UserName::new(user, db),
                password: "password".into(),
                roles: roles.iter().map(|r| RoleName::new(*r, db)).collect(),
                custom_data: None,
            })
            .unwrap();
    }

    #[test]
    fn test_first_user_only_while_empty() {
        let manager = manager();
        let request = |user: &str| CreateUserRequest {
            name: UserName::new(user, "admin"),
            password: "password".into(),
            roles: BTreeSet::from([RoleName::new("root", "admin")]),
            custom_data: None,
        };

        manager.create_first_user(request("root")).unwrap();
        let result = manager.create_first_user(request("intruder"));
        assert!(matches!(result, Err(UserManagementError::Unauthorized(_))));
        assert_eq!(manager.users().user_count(), 1);
    }

    #[test]
    fn test_create_user_with_unknown_role() {
        let manager = manager();
        let result = manager.create_user(CreateUserRequest {
            name: UserName::new("spencer", "test"),
            password: "pw".into(),
            roles: BTreeSet::from([RoleName::new("fakeRole", "test")]),
            custom_data: None,
        });
        assert!(matches!(result, Err(UserManagementError::UnknownRole(_))));
        assert_eq!(manager.users().user_count(), 0);
    }

    #[test]
    fn test_create_user_rejects_empty_password() {
        let manager = manager();
        let result = manager.create_user(CreateUserRequest {
            name: UserName::new("spencer", "test"),
            password: String::new(),
            roles: BTreeSet::new(),
            custom_data: None,
        });
        assert!(matches!(result, Err(UserManagementError::InvalidArgument(_))));
    }

    #[test]
    fn test_grant_is_atomic() {
        let manager = manager();
        create(&manager, "spencer", "test", &["read"]);
        let name = UserName::new("spencer", "test");

        let result = manager.grant_roles(
            &name,
            &BTreeSet::from([
                RoleName::new("readWrite", "test"),
                RoleName::new("fakeRole", "test"),
            ]),
        );
        assert!(matches!(result, Err(UserManagementError::UnknownRole(_))));
        let doc = manager.users().get_user(&name).unwrap();
        assert_eq!(doc.roles, BTreeSet::from([RoleName::new("read", "test")]));
    }

    #[test]
    fn test_grant_is_idempotent() {
        let manager = manager();
        create(&manager, "spencer", "test", &["read"]);
        let name = UserName::new("spencer", "test");

        let held = manager
            .grant_roles(&name, &BTreeSet::from([RoleName::new("read", "test")]))
            .unwrap();
        assert_eq!(held.len(), 1);
    }

    #[test]
    fn test_grant_to_missing_user() {
        let manager = manager();
        let result = manager.grant_roles(
            &UserName::new("ghost", "test"),
            &BTreeSet::from([RoleName::new("read", "test")]),
        );
        assert!(matches!(result, Err(UserManagementError::UserNotFound(_))));
    }

    #[test]
    fn test_revoke_ignores_unknown_roles() {
        let manager = manager();
        create(&manager, "spencer", "test", &["read", "dbAdmin"]);
        let name = UserName::new("spencer", "test");

        let held = manager
            .revoke_roles(
                &name,
                &BTreeSet::from([
                    RoleName::new("dbAdmin", "test"),
                    RoleName::new("fakeRole", "test"),
                    RoleName::new("userAdmin", "test"),
                ]),
            )
            .unwrap();
        assert_eq!(held, BTreeSet::from([RoleName::new("read", "test")]));

        let missing = manager.revoke_roles(&UserName::new("ghost", "test"), &BTreeSet::new());
        assert!(matches!(missing, Err(UserManagementError::UserNotFound(_))));
    }

    #[test]
    fn test_drop_role_strips_holders() {
        let manager = manager();
        let custom = RoleName::new("reporting", "test");
        manager
            .create_role(&custom, Vec::new(), BTreeSet::new())
            .unwrap();
        create(&manager, "a", "test", &["reporting"]);
        create(&manager, "b", "test", &["read"]);

        assert_eq!(manager.drop_role(&custom).unwrap(), 1);
        assert!(manager
            .users()
            .get_user(&UserName::new("a", "test"))
            .unwrap()
            .roles
            .is_empty());
    }

    #[test]
    fn test_update_user_requires_a_field() {
        let manager = manager();
        create(&manager, "spencer", "test", &[]);
        let result = manager.update_user(&UserName::new("spencer", "test"), UserUpdate::default());
        assert!(matches!(result, Err(UserManagementError::InvalidArgument(_))));
    }

    #[test]
    fn test_update_user_checks_roles() {
        let manager = manager();
        create(&manager, "spencer", "test", &["read"]);
        let name = UserName::new("spencer", "test");
        let result = manager.update_user(
            &name,
            UserUpdate {
                roles: Some(BTreeSet::from([RoleName::new("fakeRole", "test")])),
                ..UserUpdate::default()
            },
        );
        assert!(matches!(result, Err(UserManagementError::UnknownRole(_))));
        assert_eq!(manager.users().get_user(&name).unwrap().roles.len(), 1);
    }

    #[test]
    fn test_lock_busy() {
        let manager = manager();
        let _held = manager.lock_for_update("test").unwrap();

        let result = manager.drop_all_users("test");
        assert!(matches!(result, Err(UserManagementError::LockBusy(_))));
    }

    #[test]
    fn test_authenticated_user_snapshot() {
        let manager = manager();
        create(&manager, "spencer", "test", &["readWrite"]);

        let user = manager
            .authenticated_user(&UserName::new("spencer", "test"), Mechanism::Plain)
            .unwrap();
        assert_eq!(user.mechanism, Mechanism::Plain);
        assert!(user
            .privileges
            .is_authorized(&ResourcePattern::Database("test".into()), ActionType::Insert));
        assert!(manager
            .authenticated_user(&UserName::new("ghost", "test"), Mechanism::Plain)
            .is_none());
    }
}
