//! Built-in and user-defined roles.
//!
//! Built-in roles are implicit: `read`, `readWrite`, `dbAdmin`, `userAdmin`
//! and `dbOwner` exist in every database; the `*AnyDatabase` roles,
//! `clusterAdmin` and `root` exist only in `admin`. User-defined roles are
//! stored in a [`RoleRegistry`] and may inherit other roles.

use std::collections::BTreeSet;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::auth::principal::RoleName;
use crate::error::{UserManagementError, UserManagementResult};

use super::privileges::{ActionType, Privilege, PrivilegeSet, ResourcePattern};

/// Database that holds deployment-wide roles.
pub const ADMIN_DB: &str = "admin";

/// The fixed set of built-in roles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BuiltinRole {
    Read,
    ReadWrite,
    DbAdmin,
    UserAdmin,
    DbOwner,
    ReadAnyDatabase,
    ReadWriteAnyDatabase,
    UserAdminAnyDatabase,
    DbAdminAnyDatabase,
    ClusterAdmin,
    Root,
}

impl BuiltinRole {
    /// Look up a built-in role, honouring which database it may live in.
    #[must_use]
    pub fn lookup(role: &RoleName) -> Option<Self> {
        let any_db = match role.role.as_str() {
            "read" => Some(Self::Read),
            "readWrite" => Some(Self::ReadWrite),
            "dbAdmin" => Some(Self::DbAdmin),
            "userAdmin" => Some(Self::UserAdmin),
            "dbOwner" => Some(Self::DbOwner),
            _ => None,
        };
        if any_db.is_some() {
            return any_db;
        }
        if role.db != ADMIN_DB {
            return None;
        }
        match role.role.as_str() {
            "readAnyDatabase" => Some(Self::ReadAnyDatabase),
            "readWriteAnyDatabase" => Some(Self::ReadWriteAnyDatabase),
            "userAdminAnyDatabase" => Some(Self::UserAdminAnyDatabase),
            "dbAdminAnyDatabase" => Some(Self::DbAdminAnyDatabase),
            "clusterAdmin" => Some(Self::ClusterAdmin),
            "root" => Some(Self::Root),
            _ => None,
        }
    }

    /// Built-in role names available in `db`.
    #[must_use]
    pub fn names_in(db: &str) -> Vec<&'static str> {
        let mut names = vec!["read", "readWrite", "dbAdmin", "userAdmin", "dbOwner"];
        if db == ADMIN_DB {
            names.extend([
                "readAnyDatabase",
                "readWriteAnyDatabase",
                "userAdminAnyDatabase",
                "dbAdminAnyDatabase",
                "clusterAdmin",
                "root",
            ]);
        }
        names
    }

    /// Privileges granted by this role when defined in `db`.
    #[must_use]
    pub fn privileges(self, db: &str) -> PrivilegeSet {
        let this_db = ResourcePattern::Database(db.to_string());
        let mut set = PrivilegeSet::new();
        match self {
            Self::Read => set.add_actions(this_db, ActionType::READ),
            Self::ReadWrite => {
                set.add_actions(this_db.clone(), ActionType::READ);
                set.add_actions(this_db, ActionType::WRITE);
            }
            Self::DbAdmin => set.add_actions(this_db, ActionType::DB_ADMIN),
            Self::UserAdmin => set.add_actions(this_db, ActionType::USER_ADMIN),
            Self::DbOwner => {
                for actions in [
                    ActionType::READ,
                    ActionType::WRITE,
                    ActionType::DB_ADMIN,
                    ActionType::USER_ADMIN,
                ] {
                    set.add_actions(this_db.clone(), actions);
                }
            }
            Self::ReadAnyDatabase => {
                set.add_actions(ResourcePattern::AnyDatabase, ActionType::READ);
                set.add_actions(ResourcePattern::Cluster, &[ActionType::ListDatabases]);
            }
            Self::ReadWriteAnyDatabase => {
                set.add_actions(ResourcePattern::AnyDatabase, ActionType::READ);
                set.add_actions(ResourcePattern::AnyDatabase, ActionType::WRITE);
                set.add_actions(ResourcePattern::Cluster, &[ActionType::ListDatabases]);
            }
            Self::UserAdminAnyDatabase => {
                set.add_actions(ResourcePattern::AnyDatabase, ActionType::USER_ADMIN);
                set.add_actions(ResourcePattern::Cluster, &[ActionType::ListDatabases]);
            }
            Self::DbAdminAnyDatabase => {
                set.add_actions(ResourcePattern::AnyDatabase, ActionType::DB_ADMIN);
                set.add_actions(ResourcePattern::Cluster, &[ActionType::ListDatabases]);
            }
            Self::ClusterAdmin => {
                set.add_actions(ResourcePattern::Cluster, ActionType::CLUSTER_ADMIN);
                set.add_actions(ResourcePattern::AnyDatabase, &[ActionType::DropDatabase]);
            }
            Self::Root => set.add_actions(ResourcePattern::AnyResource, ActionType::ALL),
        }
        set
    }
}

/// A user-defined role.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct RoleDocument {
    /// `db.role`.
    #[serde(rename = "_id")]
    pub id: String,
    pub role: String,
    pub db: String,
    #[serde(default)]
    pub privileges: Vec<Privilege>,
    /// Inherited roles.
    #[serde(default)]
    pub roles: BTreeSet<RoleName>,
}

impl RoleDocument {
    pub fn new(name: &RoleName, privileges: Vec<Privilege>, roles: BTreeSet<RoleName>) -> Self {
        Self {
            id: format!("{}.{}", name.db, name.role),
            role: name.role.clone(),
            db: name.db.clone(),
            privileges,
            roles,
        }
    }

    #[must_use]
    pub fn name(&self) -> RoleName {
        RoleName::new(self.role.clone(), self.db.clone())
    }

    /// Move the role into another database, carrying local inherited roles and
    /// database-scoped privileges along.
    #[must_use]
    pub fn rehome(mut self, db: &str) -> Self {
        if self.db == db {
            return self;
        }
        let old_db = std::mem::replace(&mut self.db, db.to_string());
        self.id = format!("{}.{}", self.db, self.role);
        self.roles = self
            .roles
            .into_iter()
            .map(|r| if r.db == old_db { RoleName::new(r.role, db) } else { r })
            .collect();
        for privilege in &mut self.privileges {
            if privilege.resource == ResourcePattern::Database(old_db.clone()) {
                privilege.resource = ResourcePattern::Database(db.to_string());
            }
        }
        self
    }
}

/// Result of resolving a set of roles.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolvedRoles {
    /// Directly held plus transitively inherited roles.
    pub roles: BTreeSet<RoleName>,
    pub privileges: PrivilegeSet,
}

/// Registry of user-defined roles. Built-ins are answered without storage.
#[derive(Debug, Default)]
pub struct RoleRegistry {
    custom: DashMap<RoleName, RoleDocument>,
}

impl RoleRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn is_builtin(role: &RoleName) -> bool {
        BuiltinRole::lookup(role).is_some()
    }

    /// Whether a role exists, built-in or user-defined.
    #[must_use]
    pub fn role_exists(&self, role: &RoleName) -> bool {
        Self::is_builtin(role) || self.custom.contains_key(role)
    }

    /// First role in `roles` that does not exist, if any.
    #[must_use]
    pub fn first_missing<'a, I>(&self, roles: I) -> Option<&'a RoleName>
    where
        I: IntoIterator<Item = &'a RoleName>,
    {
        roles.into_iter().find(|role| !self.role_exists(role))
    }

    /// Register a user-defined role.
    ///
    /// # Errors
    ///
    /// Fails for a built-in name, an existing role, or an unknown inherited role.
    pub fn create_role(&self, doc: RoleDocument) -> UserManagementResult<()> {
        let name = doc.name();
        if Self::is_builtin(&name) {
            return Err(UserManagementError::BuiltinRole(name));
        }
        if let Some(missing) = self.first_missing(&doc.roles) {
            return Err(UserManagementError::UnknownRole(missing.clone()));
        }
        check_scope(&doc)?;
        match self.custom.entry(name) {
            Entry::Occupied(e) => Err(UserManagementError::DuplicateRole(e.key().clone())),
            Entry::Vacant(e) => {
                e.insert(doc);
                Ok(())
            }
        }
    }

    /// Insert or replace a user-defined role without validation.
    pub fn upsert_role(&self, doc: RoleDocument) {
        self.custom.insert(doc.name(), doc);
    }

    /// Remove a user-defined role and strip it from roles inheriting it.
    ///
    /// # Errors
    ///
    /// Fails for a built-in role or a role that does not exist.
    pub fn drop_role(&self, role: &RoleName) -> UserManagementResult<RoleDocument> {
        if Self::is_builtin(role) {
            return Err(UserManagementError::BuiltinRole(role.clone()));
        }
        let (_, doc) = self
            .custom
            .remove(role)
            .ok_or_else(|| UserManagementError::UnknownRole(role.clone()))?;
        for mut entry in self.custom.iter_mut() {
            entry.roles.remove(role);
        }
        Ok(doc)
    }

    /// Remove every user-defined role of `db`.
    pub fn drop_all_roles(&self, db: &str) -> usize {
        let before = self.custom.len();
        self.custom.retain(|name, _| name.db != db);
        before.saturating_sub(self.custom.len())
    }

    #[must_use]
    pub fn get_role(&self, role: &RoleName) -> Option<RoleDocument> {
        self.custom.get(role).map(|doc| doc.clone())
    }

    /// Databases holding at least one user-defined role.
    #[must_use]
    pub fn databases(&self) -> BTreeSet<String> {
        self.custom.iter().map(|entry| entry.key().db.clone()).collect()
    }

    /// User-defined roles of `db`, sorted by name.
    #[must_use]
    pub fn roles_in(&self, db: &str) -> Vec<RoleDocument> {
        let mut roles: Vec<_> = self
            .custom
            .iter()
            .filter(|entry| entry.key().db == db)
            .map(|entry| entry.value().clone())
            .collect();
        roles.sort_by(|a, b| a.role.cmp(&b.role));
        roles
    }

    /// Walk `roles` and everything they inherit. Cycles and unknown roles are
    /// tolerated; each role is visited once.
    #[must_use]
    pub fn resolve(&self, roles: &BTreeSet<RoleName>) -> ResolvedRoles {
        let mut resolved = ResolvedRoles::default();
        let mut pending: Vec<RoleName> = roles.iter().cloned().collect();

        while let Some(role) = pending.pop() {
            if !resolved.roles.insert(role.clone()) {
                continue;
            }
            if let Some(builtin) = BuiltinRole::lookup(&role) {
                resolved.privileges.merge(&builtin.privileges(&role.db));
            } else if let Some(doc) = self.custom.get(&role) {
                for privilege in &doc.privileges {
                    resolved.privileges.add_privilege(privilege);
                }
                pending.extend(doc.roles.iter().cloned());
            }
        }
        resolved
    }

    /// Command-facing description of a role.
    #[must_use]
    pub fn role_info(&self, role: &RoleName, show_privileges: bool) -> Option<Value> {
        let builtin = Self::is_builtin(role);
        let inherited = match self.custom.get(role) {
            Some(doc) => doc.roles.clone(),
            None if builtin => BTreeSet::new(),
            None => return None,
        };

        let mut info = Map::new();
        info.insert("role".into(), Value::String(role.role.clone()));
        info.insert("db".into(), Value::String(role.db.clone()));
        info.insert("isBuiltin".into(), Value::Bool(builtin));
        info.insert(
            "roles".into(),
            serde_json::to_value(&inherited).unwrap_or(Value::Array(Vec::new())),
        );
        if show_privileges {
            let privileges = self
                .resolve(&BTreeSet::from([role.clone()]))
                .privileges
                .to_privileges();
            info.insert(
                "privileges".into(),
                serde_json::to_value(privileges).unwrap_or(Value::Array(Vec::new())),
            );
        }
        Some(Value::Object(info))
    }
}

/// Roles outside `admin` may only carry privileges on, and inherit roles
/// from, their own database.
fn check_scope(doc: &RoleDocument) -> UserManagementResult<()> {
    if doc.db == ADMIN_DB {
        return Ok(());
    }
    let own = ResourcePattern::Database(doc.db.clone());
    if let Some(privilege) = doc.privileges.iter().find(|p| p.resource != own) {
        return Err(UserManagementError::InvalidArgument(format!(
            "roles on the '{}' database cannot grant privileges on {}",
            doc.db, privilege.resource
        )));
    }
    if let Some(parent) = doc.roles.iter().find(|r| r.db != doc.db) {
        return Err(UserManagementError::InvalidArgument(format!(
            "roles on the '{}' database cannot inherit {parent}",
            doc.db
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn role(name: &str, db: &str) -> RoleName {
        RoleName::new(name, db)
    }

    #[test]
    fn test_builtin_scoping() {
        assert!(RoleRegistry::is_builtin(&role("readWrite", "test")));
        assert!(RoleRegistry::is_builtin(&role("root", "admin")));
        assert!(!RoleRegistry::is_builtin(&role("root", "test")));
        assert!(!RoleRegistry::is_builtin(&role("fakeRole", "test")));
        assert_eq!(BuiltinRole::names_in("test").len(), 5);
        assert_eq!(BuiltinRole::names_in("admin").len(), 11);
    }

    #[test]
    fn test_builtin_privileges() {
        let test = ResourcePattern::Database("test".into());
        let read = BuiltinRole::Read.privileges("test");
        assert!(read.is_authorized(&test, ActionType::Find));
        assert!(!read.is_authorized(&test, ActionType::Insert));

        let owner = BuiltinRole::DbOwner.privileges("test");
        assert!(owner.is_authorized(&test, ActionType::CreateUser));
        assert!(owner.is_authorized(&test, ActionType::DropDatabase));

        let root = BuiltinRole::Root.privileges("admin");
        assert!(root.is_authorized(&ResourcePattern::Cluster, ActionType::Shutdown));
    }

    #[test]
    fn test_create_and_drop_custom_role() {
        let registry = RoleRegistry::new();
        let name = role("reporting", "test");
        registry
            .create_role(RoleDocument::new(
                &name,
                vec![Privilege::new(
                    ResourcePattern::Database("test".into()),
                    &[ActionType::Find],
                )],
                BTreeSet::new(),
            ))
            .unwrap();
        assert!(registry.role_exists(&name));

        let dup = registry.create_role(RoleDocument::new(&name, vec![], BTreeSet::new()));
        assert_eq!(dup, Err(UserManagementError::DuplicateRole(name.clone())));

        registry.drop_role(&name).unwrap();
        assert!(!registry.role_exists(&name));
        assert!(matches!(
            registry.drop_role(&name),
            Err(UserManagementError::UnknownRole(_))
        ));
    }

    #[test]
    fn test_builtin_roles_are_immutable() {
        let registry = RoleRegistry::new();
        let read = role("read", "test");
        assert!(matches!(
            registry.create_role(RoleDocument::new(&read, vec![], BTreeSet::new())),
            Err(UserManagementError::BuiltinRole(_))
        ));
        assert!(matches!(
            registry.drop_role(&read),
            Err(UserManagementError::BuiltinRole(_))
        ));
    }

    #[test]
    fn test_custom_role_scoped_to_its_database() {
        let registry = RoleRegistry::new();
        for resource in [
            ResourcePattern::Database("admin".into()),
            ResourcePattern::AnyDatabase,
            ResourcePattern::AnyResource,
        ] {
            let result = registry.create_role(RoleDocument::new(
                &role("escalate", "test"),
                vec![Privilege::new(resource, &[ActionType::GrantRole])],
                BTreeSet::new(),
            ));
            assert!(matches!(result, Err(UserManagementError::InvalidArgument(_))));
        }

        let result = registry.create_role(RoleDocument::new(
            &role("escalate", "test"),
            vec![],
            BTreeSet::from([role("root", "admin")]),
        ));
        assert!(matches!(result, Err(UserManagementError::InvalidArgument(_))));
        assert!(!registry.role_exists(&role("escalate", "test")));

        registry
            .create_role(RoleDocument::new(
                &role("operator", "admin"),
                vec![Privilege::new(ResourcePattern::AnyDatabase, &[ActionType::Find])],
                BTreeSet::from([role("read", "test")]),
            ))
            .unwrap();
    }

    #[test]
    fn test_create_role_with_unknown_parent() {
        let registry = RoleRegistry::new();
        let result = registry.create_role(RoleDocument::new(
            &role("child", "test"),
            vec![],
            BTreeSet::from([role("missing", "test")]),
        ));
        assert_eq!(
            result,
            Err(UserManagementError::UnknownRole(role("missing", "test")))
        );
    }

    #[test]
    fn test_resolve_inherits_and_survives_cycles() {
        let registry = RoleRegistry::new();
        registry.upsert_role(RoleDocument::new(
            &role("a", "test"),
            vec![],
            BTreeSet::from([role("b", "test"), role("read", "test")]),
        ));
        registry.upsert_role(RoleDocument::new(
            &role("b", "test"),
            vec![Privilege::new(
                ResourcePattern::Database("test".into()),
                &[ActionType::Insert],
            )],
            BTreeSet::from([role("a", "test")]),
        ));

        let resolved = registry.resolve(&BTreeSet::from([role("a", "test")]));
        assert_eq!(resolved.roles.len(), 3);
        let test = ResourcePattern::Database("test".into());
        assert!(resolved.privileges.is_authorized(&test, ActionType::Insert));
        assert!(resolved.privileges.is_authorized(&test, ActionType::Find));
    }

    #[test]
    fn test_drop_role_strips_inheritance() {
        let registry = RoleRegistry::new();
        registry.upsert_role(RoleDocument::new(&role("base", "test"), vec![], BTreeSet::new()));
        registry.upsert_role(RoleDocument::new(
            &role("derived", "test"),
            vec![],
            BTreeSet::from([role("base", "test")]),
        ));

        registry.drop_role(&role("base", "test")).unwrap();
        assert!(registry
            .get_role(&role("derived", "test"))
            .unwrap()
            .roles
            .is_empty());
    }

    #[test]
    fn test_role_info() {
        let registry = RoleRegistry::new();
        let info = registry.role_info(&role("read", "test"), true).unwrap();
        assert_eq!(info["isBuiltin"], true);
        assert!(info["privileges"].as_array().is_some());
        assert!(registry.role_info(&role("nope", "test"), false).is_none());
    }

    #[test]
    fn test_role_document_rehome() {
        let doc = RoleDocument::new(
            &role("r", "src"),
            vec![Privilege::new(
                ResourcePattern::Database("src".into()),
                &[ActionType::Find],
            )],
            BTreeSet::from([role("read", "src")]),
        )
        .rehome("dst");
        assert_eq!(doc.id, "dst.r");
        assert!(doc.roles.contains(&role("read", "dst")));
        assert_eq!(
            doc.privileges[0].resource,
            ResourcePattern::Database("dst".into())
        );
    }
}
