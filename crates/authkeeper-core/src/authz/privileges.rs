//! Actions, resources and privilege sets.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};

/// An action a privilege allows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ActionType {
    Find,
    Insert,
    Update,
    Remove,
    ListCollections,
    ListIndexes,
    CreateCollection,
    DropCollection,
    CreateIndex,
    DropIndex,
    DropDatabase,
    CreateUser,
    DropUser,
    UpdateUser,
    GrantRole,
    RevokeRole,
    ViewUser,
    CreateRole,
    DropRole,
    ViewRole,
    ListDatabases,
    ServerStatus,
    Shutdown,
}

impl ActionType {
    /// Actions of the `read` role.
    pub const READ: &'static [ActionType] = &[Self::Find, Self::ListCollections, Self::ListIndexes];

    /// Actions `readWrite` adds on top of `read`.
    pub const WRITE: &'static [ActionType] = &[
        Self::Insert,
        Self::Update,
        Self::Remove,
        Self::CreateCollection,
        Self::DropCollection,
        Self::CreateIndex,
        Self::DropIndex,
    ];

    /// Actions of the `dbAdmin` role.
    pub const DB_ADMIN: &'static [ActionType] = &[
        Self::ListCollections,
        Self::ListIndexes,
        Self::CreateCollection,
        Self::DropCollection,
        Self::CreateIndex,
        Self::DropIndex,
        Self::DropDatabase,
    ];

    /// Actions of the `userAdmin` role.
    pub const USER_ADMIN: &'static [ActionType] = &[
        Self::CreateUser,
        Self::DropUser,
        Self::UpdateUser,
        Self::GrantRole,
        Self::RevokeRole,
        Self::ViewUser,
        Self::CreateRole,
        Self::DropRole,
        Self::ViewRole,
    ];

    /// Cluster-wide actions of `clusterAdmin`.
    pub const CLUSTER_ADMIN: &'static [ActionType] =
        &[Self::ListDatabases, Self::ServerStatus, Self::Shutdown];

    /// Every action.
    pub const ALL: &'static [ActionType] = &[
        Self::Find,
        Self::Insert,
        Self::Update,
        Self::Remove,
        Self::ListCollections,
        Self::ListIndexes,
        Self::CreateCollection,
        Self::DropCollection,
        Self::CreateIndex,
        Self::DropIndex,
        Self::DropDatabase,
        Self::CreateUser,
        Self::DropUser,
        Self::UpdateUser,
        Self::GrantRole,
        Self::RevokeRole,
        Self::ViewUser,
        Self::CreateRole,
        Self::DropRole,
        Self::ViewRole,
        Self::ListDatabases,
        Self::ServerStatus,
        Self::Shutdown,
    ];
}

impl fmt::Display for ActionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = serde_json::to_value(self)
            .ok()
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_default();
        f.write_str(&name)
    }
}

/// What a privilege applies to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ResourcePattern {
    /// A single database.
    Database(String),
    /// Every database.
    AnyDatabase,
    /// Deployment-wide operations.
    Cluster,
    /// Everything, including the cluster.
    AnyResource,
}

impl ResourcePattern {
    /// Whether this pattern covers `target`.
    #[must_use]
    pub fn matches(&self, target: &ResourcePattern) -> bool {
        match (self, target) {
            (Self::AnyResource, _) => true,
            (Self::AnyDatabase, Self::Database(_) | Self::AnyDatabase) => true,
            (Self::Database(a), Self::Database(b)) => a == b,
            (Self::Cluster, Self::Cluster) => true,
            _ => false,
        }
    }
}

impl fmt::Display for ResourcePattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Database(db) => write!(f, "database '{db}'"),
            Self::AnyDatabase => f.write_str("any database"),
            Self::Cluster => f.write_str("cluster"),
            Self::AnyResource => f.write_str("any resource"),
        }
    }
}

/// A set of actions on one resource.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Privilege {
    pub resource: ResourcePattern,
    pub actions: BTreeSet<ActionType>,
}

impl Privilege {
    pub fn new(resource: ResourcePattern, actions: &[ActionType]) -> Self {
        Self {
            resource,
            actions: actions.iter().copied().collect(),
        }
    }
}

/// Union of privileges, merged per resource.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PrivilegeSet {
    by_resource: BTreeMap<ResourcePattern, BTreeSet<ActionType>>,
}

impl PrivilegeSet {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_privilege(&mut self, privilege: &Privilege) {
        self.by_resource
            .entry(privilege.resource.clone())
            .or_default()
            .extend(privilege.actions.iter().copied());
    }

    pub fn add_actions(&mut self, resource: ResourcePattern, actions: &[ActionType]) {
        self.by_resource
            .entry(resource)
            .or_default()
            .extend(actions.iter().copied());
    }

    pub fn merge(&mut self, other: &PrivilegeSet) {
        for (resource, actions) in &other.by_resource {
            self.by_resource
                .entry(resource.clone())
                .or_default()
                .extend(actions.iter().copied());
        }
    }

    /// Whether any held privilege allows `action` on `resource`.
    #[must_use]
    pub fn is_authorized(&self, resource: &ResourcePattern, action: ActionType) -> bool {
        self.by_resource
            .iter()
            .any(|(pattern, actions)| pattern.matches(resource) && actions.contains(&action))
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_resource.is_empty()
    }

    /// Flattened view, one privilege per resource.
    #[must_use]
    pub fn to_privileges(&self) -> Vec<Privilege> {
        self.by_resource
            .iter()
            .map(|(resource, actions)| Privilege {
                resource: resource.clone(),
                actions: actions.clone(),
            })
            .collect()
    }
}
