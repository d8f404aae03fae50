//! Per-connection authorization state.

use std::collections::BTreeMap;

use crate::auth::principal::{AuthenticatedUser, UserName};

use super::privileges::{ActionType, ResourcePattern};

/// Users logged in on one connection, at most one per database.
#[derive(Debug, Clone, Default)]
pub struct AuthorizationSession {
    by_db: BTreeMap<String, AuthenticatedUser>,
}

impl AuthorizationSession {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind a user, replacing any earlier login on the same database.
    pub fn login(&mut self, user: AuthenticatedUser) -> Option<AuthenticatedUser> {
        self.by_db.insert(user.name.db.clone(), user)
    }

    /// Remove the login on `db`.
    pub fn logout(&mut self, db: &str) -> Option<AuthenticatedUser> {
        self.by_db.remove(db)
    }

    pub fn logout_all(&mut self) {
        self.by_db.clear();
    }

    #[must_use]
    pub fn user_for(&self, db: &str) -> Option<&AuthenticatedUser> {
        self.by_db.get(db)
    }

    #[must_use]
    pub fn authenticated_names(&self) -> Vec<UserName> {
        self.by_db.values().map(|u| u.name.clone()).collect()
    }

    #[must_use]
    pub fn is_authenticated(&self) -> bool {
        !self.by_db.is_empty()
    }

    /// Whether any logged-in user may perform `action` on `resource`.
    #[must_use]
    pub fn is_authorized(&self, resource: &ResourcePattern, action: ActionType) -> bool {
        self.by_db
            .values()
            .any(|u| u.privileges.is_authorized(resource, action))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::mechanism::Mechanism;
    use crate::authz::privileges::PrivilegeSet;
    use std::collections::BTreeSet;

    fn user(name: &str, db: &str, actions: &[ActionType]) -> AuthenticatedUser {
        let mut privileges = PrivilegeSet::new();
        privileges.add_actions(ResourcePattern::Database(db.to_string()), actions);
        AuthenticatedUser {
            name: UserName::new(name, db),
            mechanism: Mechanism::ChallengeResponse,
            roles: BTreeSet::new(),
            privileges,
        }
    }

    #[test]
    fn test_login_replaces_same_db() {
        let mut session = AuthorizationSession::new();
        assert!(session.login(user("a", "test", &[])).is_none());
        let previous = session.login(user("b", "test", &[])).unwrap();
        assert_eq!(previous.name.user, "a");
        assert_eq!(session.authenticated_names(), vec![UserName::new("b", "test")]);
    }

    #[test]
    fn test_privileges_union_across_dbs() {
        let mut session = AuthorizationSession::new();
        session.login(user("a", "test", &[ActionType::Find]));
        session.login(user("b", "other", &[ActionType::CreateUser]));

        let test = ResourcePattern::Database("test".into());
        let other = ResourcePattern::Database("other".into());
        assert!(session.is_authorized(&test, ActionType::Find));
        assert!(session.is_authorized(&other, ActionType::CreateUser));
        assert!(!session.is_authorized(&test, ActionType::CreateUser));

        session.logout("other");
        assert!(!session.is_authorized(&other, ActionType::CreateUser));
    }
}
