//! Role-based authorization.
//!
//! - [`privileges`]: actions, resource patterns and privilege sets
//! - [`roles`]: built-in roles and the registry of user-defined ones
//! - [`manager`]: serialized administrative writes over users and roles
//! - [`session`]: what a single connection is allowed to do

pub mod manager;
pub mod privileges;
pub mod roles;
pub mod session;

pub use manager::{AuthorizationManager, CreateUserRequest};
pub use privileges::{ActionType, Privilege, PrivilegeSet, ResourcePattern};
pub use roles::{BuiltinRole, ResolvedRoles, RoleDocument, RoleRegistry, ADMIN_DB};
pub use session::AuthorizationSession;
