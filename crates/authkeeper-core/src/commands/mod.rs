//! Administrative command dispatch.
//!
//! A command is a JSON document whose first key names the command. Each
//! group of commands has a handler; the [`CommandDispatcher`] checks
//! authorization, routes to the handler and folds the outcome into a
//! [`CommandReply`].

pub mod auth;
pub mod database;
pub mod roles;
pub mod users;

pub use auth::AuthHandler;
pub use database::DatabaseHandler;
pub use roles::RoleHandler;
pub use users::UserHandler;

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::auth::principal::{validate_database_name, RoleName};
use crate::auth::session::ClientSession;
use crate::authz::manager::AuthorizationManager;
use crate::authz::privileges::{ActionType, ResourcePattern};
use crate::config::SecurityConfig;
use crate::error::{CommandError, CommandResult, ErrorKind};
use crate::metrics::AuthMetrics;
use crate::store::indexes::IndexCatalog;

/// Every command the dispatcher understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandName {
    GetNonce,
    Authenticate,
    SaslStart,
    SaslContinue,
    Logout,
    CreateUser,
    UpdateUser,
    DropUser,
    DropAllUsersFromDatabase,
    UsersInfo,
    GrantRolesToUser,
    RevokeRolesFromUser,
    CreateRole,
    DropRole,
    RolesInfo,
    DropDatabase,
    ListIndexes,
    CreateIndexes,
}

impl CommandName {
    pub const ALL: &'static [CommandName] = &[
        Self::GetNonce,
        Self::Authenticate,
        Self::SaslStart,
        Self::SaslContinue,
        Self::Logout,
        Self::CreateUser,
        Self::UpdateUser,
        Self::DropUser,
        Self::DropAllUsersFromDatabase,
        Self::UsersInfo,
        Self::GrantRolesToUser,
        Self::RevokeRolesFromUser,
        Self::CreateRole,
        Self::DropRole,
        Self::RolesInfo,
        Self::DropDatabase,
        Self::ListIndexes,
        Self::CreateIndexes,
    ];

    /// Name as it appears in a command document.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::GetNonce => "getnonce",
            Self::Authenticate => "authenticate",
            Self::SaslStart => "saslStart",
            Self::SaslContinue => "saslContinue",
            Self::Logout => "logout",
            Self::CreateUser => "createUser",
            Self::UpdateUser => "updateUser",
            Self::DropUser => "dropUser",
            Self::DropAllUsersFromDatabase => "dropAllUsersFromDatabase",
            Self::UsersInfo => "usersInfo",
            Self::GrantRolesToUser => "grantRolesToUser",
            Self::RevokeRolesFromUser => "revokeRolesFromUser",
            Self::CreateRole => "createRole",
            Self::DropRole => "dropRole",
            Self::RolesInfo => "rolesInfo",
            Self::DropDatabase => "dropDatabase",
            Self::ListIndexes => "listIndexes",
            Self::CreateIndexes => "createIndexes",
        }
    }

    /// Look a command up by its exact name.
    #[must_use]
    pub fn parse(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|c| c.as_str() == name)
    }

    /// Action required on the target database. `None` for the handshake
    /// commands, which anyone may run.
    #[must_use]
    pub const fn required_action(self) -> Option<ActionType> {
        match self {
            Self::GetNonce
            | Self::Authenticate
            | Self::SaslStart
            | Self::SaslContinue
            | Self::Logout => None,
            Self::CreateUser => Some(ActionType::CreateUser),
            Self::UpdateUser => Some(ActionType::UpdateUser),
            Self::DropUser | Self::DropAllUsersFromDatabase => Some(ActionType::DropUser),
            Self::UsersInfo => Some(ActionType::ViewUser),
            Self::GrantRolesToUser => Some(ActionType::GrantRole),
            Self::RevokeRolesFromUser => Some(ActionType::RevokeRole),
            Self::CreateRole => Some(ActionType::CreateRole),
            Self::DropRole => Some(ActionType::DropRole),
            Self::RolesInfo => Some(ActionType::ViewRole),
            Self::DropDatabase => Some(ActionType::DropDatabase),
            Self::ListIndexes => Some(ActionType::ListIndexes),
            Self::CreateIndexes => Some(ActionType::CreateIndex),
        }
    }
}

impl fmt::Display for CommandName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How the gate let a command through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    /// Authorization is switched off.
    Open,
    /// Unauthenticated `createUser` while no users exist.
    FirstUser,
    /// The session's privileges cover the command's database.
    Enforced,
}

/// One command invocation as seen by a handler.
#[derive(Debug)]
pub struct CommandContext<'a> {
    pub session: &'a mut ClientSession,
    pub db: &'a str,
    pub name: CommandName,
    pub access: Access,
}

impl CommandContext<'_> {
    /// Require `action` on another database the command reaches into, such
    /// as the database of a granted role or a looked-up user.
    ///
    /// # Errors
    ///
    /// Returns `Unauthorized` when access is enforced and no logged-in user
    /// holds `action` on `db`.
    pub fn require(&self, db: &str, action: ActionType) -> CommandResult<()> {
        if self.access != Access::Enforced
            || self
                .session
                .authz
                .is_authorized(&ResourcePattern::Database(db.to_string()), action)
        {
            return Ok(());
        }
        Err(CommandError::unauthorized(format!(
            "not authorized on {db} to execute command {} ({action})",
            self.name
        )))
    }

    /// [`require`](Self::require) for the database of every role in `roles`.
    ///
    /// # Errors
    ///
    /// Returns `Unauthorized` for the first role database not covered.
    pub fn require_for_roles<'r>(
        &self,
        roles: impl IntoIterator<Item = &'r RoleName>,
        action: ActionType,
    ) -> CommandResult<()> {
        let dbs: BTreeSet<&str> = roles.into_iter().map(|role| role.db.as_str()).collect();
        dbs.into_iter().try_for_each(|db| self.require(db, action))
    }
}

/// Trait for command handlers.
pub trait CommandHandler: Send + Sync + fmt::Debug {
    /// Run the command and return the reply body, without `ok`.
    fn handle(
        &self,
        ctx: &mut CommandContext<'_>,
        doc: &Map<String, Value>,
    ) -> CommandResult<Map<String, Value>>;
}

/// Reply document of a dispatched command.
///
/// Success: `{..., "ok": 1}`. Failure: `{"ok": 0, "errmsg", "codeName"}`
/// plus `"code"` for the kinds that have a wire code.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandReply(Map<String, Value>);

impl CommandReply {
    #[must_use]
    pub fn success(mut body: Map<String, Value>) -> Self {
        body.insert("ok".into(), Value::from(1));
        Self(body)
    }

    #[must_use]
    pub fn failure(err: &CommandError) -> Self {
        let mut body = Map::new();
        body.insert("ok".into(), Value::from(0));
        body.insert("errmsg".into(), Value::String(err.message.clone()));
        body.insert("codeName".into(), Value::String(err.kind.name().into()));
        if let Some(code) = err.code() {
            body.insert("code".into(), Value::from(code));
        }
        Self(body)
    }

    #[must_use]
    pub fn is_ok(&self) -> bool {
        self.0.get("ok").and_then(Value::as_i64) == Some(1)
    }

    /// Numeric error code, present only for 17 and 18.
    #[must_use]
    pub fn code(&self) -> Option<i64> {
        self.0.get("code").and_then(Value::as_i64)
    }

    #[must_use]
    pub fn code_name(&self) -> Option<&str> {
        self.0.get("codeName").and_then(Value::as_str)
    }

    #[must_use]
    pub fn errmsg(&self) -> Option<&str> {
        self.0.get("errmsg").and_then(Value::as_str)
    }

    #[must_use]
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.0.get(field)
    }

    #[must_use]
    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    #[must_use]
    pub fn into_value(self) -> Value {
        Value::Object(self.0)
    }
}

impl fmt::Display for CommandReply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", Value::Object(self.0.clone()))
    }
}

/// Routes command documents to handlers.
#[derive(Debug)]
pub struct CommandDispatcher {
    manager: Arc<AuthorizationManager>,
    authorization: bool,
    auth: AuthHandler,
    users: UserHandler,
    roles: RoleHandler,
    database: DatabaseHandler,
    metrics: Option<Arc<AuthMetrics>>,
}

impl CommandDispatcher {
    #[must_use]
    pub fn new(
        manager: Arc<AuthorizationManager>,
        indexes: Arc<dyn IndexCatalog>,
        config: &SecurityConfig,
        metrics: Option<Arc<AuthMetrics>>,
    ) -> Self {
        Self {
            authorization: config.authorization,
            auth: AuthHandler::new(Arc::clone(&manager), config, metrics.clone()),
            users: UserHandler::new(Arc::clone(&manager)),
            roles: RoleHandler::new(Arc::clone(&manager)),
            database: DatabaseHandler::new(Arc::clone(&manager), indexes),
            manager,
            metrics,
        }
    }

    #[must_use]
    pub fn auth_handler(&self) -> &AuthHandler {
        &self.auth
    }

    fn handler_for(&self, name: CommandName) -> &dyn CommandHandler {
        match name {
            CommandName::GetNonce
            | CommandName::Authenticate
            | CommandName::SaslStart
            | CommandName::SaslContinue
            | CommandName::Logout => &self.auth,
            CommandName::CreateUser
            | CommandName::UpdateUser
            | CommandName::DropUser
            | CommandName::DropAllUsersFromDatabase
            | CommandName::UsersInfo
            | CommandName::GrantRolesToUser
            | CommandName::RevokeRolesFromUser => &self.users,
            CommandName::CreateRole | CommandName::DropRole | CommandName::RolesInfo => {
                &self.roles
            }
            CommandName::DropDatabase | CommandName::ListIndexes | CommandName::CreateIndexes => {
                &self.database
            }
        }
    }

    /// Run one command on behalf of `session` against database `db`.
    pub fn run(&self, session: &mut ClientSession, db: &str, command: &Value) -> CommandReply {
        let start = Instant::now();

        let Some((raw_name, doc)) = command
            .as_object()
            .and_then(|doc| doc.keys().next().map(|name| (name.clone(), doc)))
        else {
            return CommandReply::failure(&CommandError::invalid_argument(
                "command must be a non-empty document",
            ));
        };

        let name = CommandName::parse(&raw_name);
        let label = name.map_or("unknown", CommandName::as_str);
        if let Some(metrics) = &self.metrics {
            metrics.record_command(label);
        }

        let result = match (validate_database_name(db), name) {
            (Err(err), _) => Err(err.into()),
            (Ok(()), Some(name)) => match self.check_authorized(name, session, db) {
                Ok(access) => {
                    let mut ctx = CommandContext {
                        session: &mut *session,
                        db,
                        name,
                        access,
                    };
                    self.handler_for(name).handle(&mut ctx, doc)
                }
                Err(err) => Err(err),
            },
            (Ok(()), None) => Err(CommandError::invalid_argument(format!(
                "no such command: '{raw_name}'"
            ))),
        };

        if let Some(metrics) = &self.metrics {
            metrics.record_duration(label, start.elapsed().as_secs_f64());
            metrics.set_users(self.manager.users().user_count());
        }

        match result {
            Ok(body) => {
                debug!(session = session.id(), db = %db, command = label, "Command succeeded");
                CommandReply::success(body)
            }
            Err(err) => {
                if let Some(metrics) = &self.metrics {
                    metrics.record_error(label, err.kind.name());
                }
                if err.kind == ErrorKind::Internal {
                    warn!(
                        session = session.id(),
                        db = %db,
                        command = label,
                        error = %err,
                        "Command failed"
                    );
                } else {
                    debug!(
                        session = session.id(),
                        db = %db,
                        command = label,
                        error = %err,
                        "Command failed"
                    );
                }
                CommandReply::failure(&err)
            }
        }
    }

    fn check_authorized(
        &self,
        name: CommandName,
        session: &ClientSession,
        db: &str,
    ) -> CommandResult<Access> {
        if !self.authorization {
            return Ok(Access::Open);
        }
        let Some(action) = name.required_action() else {
            return Ok(Access::Enforced);
        };

        if session
            .authz
            .is_authorized(&ResourcePattern::Database(db.to_string()), action)
        {
            return Ok(Access::Enforced);
        }

        // First user may be created without credentials. The manager checks
        // the count again under the update lock.
        if name == CommandName::CreateUser && self.manager.users().user_count() == 0 {
            debug!(db = %db, "No users defined, allowing unauthenticated createUser");
            Ok(Access::FirstUser)
        } else {
            Err(CommandError::unauthorized(format!(
                "not authorized on {db} to execute command {name}"
            )))
        }
    }
}

/// Required non-empty string argument.
pub(crate) fn string_arg<'a>(doc: &'a Map<String, Value>, field: &str) -> CommandResult<&'a str> {
    match doc.get(field) {
        Some(Value::String(s)) if !s.is_empty() => Ok(s),
        Some(Value::String(_)) => Err(CommandError::invalid_argument(format!(
            "'{field}' must not be empty"
        ))),
        Some(_) => Err(CommandError::invalid_argument(format!(
            "'{field}' must be a string"
        ))),
        None => Err(CommandError::invalid_argument(format!("missing '{field}'"))),
    }
}

/// Optional string argument. Present but not a string is an error.
pub(crate) fn optional_string_arg<'a>(
    doc: &'a Map<String, Value>,
    field: &str,
) -> CommandResult<Option<&'a str>> {
    match doc.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s)),
        Some(_) => Err(CommandError::invalid_argument(format!(
            "'{field}' must be a string"
        ))),
    }
}

/// Optional document argument.
pub(crate) fn optional_object_arg(
    doc: &Map<String, Value>,
    field: &str,
) -> CommandResult<Option<Map<String, Value>>> {
    match doc.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Object(obj)) => Ok(Some(obj.clone())),
        Some(_) => Err(CommandError::invalid_argument(format!(
            "'{field}' must be a document"
        ))),
    }
}

/// Boolean flag, `true`/`false` or `1`/`0`.
pub(crate) fn flag_arg(doc: &Map<String, Value>, field: &str) -> bool {
    match doc.get(field) {
        Some(Value::Bool(b)) => *b,
        Some(Value::Number(n)) => n.as_f64().is_some_and(|n| n != 0.0),
        _ => false,
    }
}

/// Parse one role reference: a bare name in `default_db`, or `{role, db}`.
pub(crate) fn parse_role_name(value: &Value, default_db: &str) -> CommandResult<RoleName> {
    match value {
        Value::String(role) if !role.is_empty() => Ok(RoleName::new(role.as_str(), default_db)),
        Value::Object(obj) => {
            let role = string_arg(obj, "role")?;
            let db = string_arg(obj, "db")?;
            validate_database_name(db)?;
            Ok(RoleName::new(role, db))
        }
        _ => Err(CommandError::invalid_argument(
            "role must be a name or a {role, db} document",
        )),
    }
}

/// Parse a role array into a set; duplicates collapse.
pub(crate) fn parse_role_names(
    value: &Value,
    default_db: &str,
) -> CommandResult<BTreeSet<RoleName>> {
    let Value::Array(items) = value else {
        return Err(CommandError::invalid_argument("roles must be an array"));
    };
    items
        .iter()
        .map(|item| parse_role_name(item, default_db))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_command_names_round_trip() {
        for name in CommandName::ALL {
            assert_eq!(CommandName::parse(name.as_str()), Some(*name));
        }
        assert_eq!(CommandName::parse("GETNONCE"), None);
        assert_eq!(CommandName::parse("shutdown"), None);
    }

    #[test]
    fn test_handshake_commands_are_public() {
        for name in [
            CommandName::GetNonce,
            CommandName::Authenticate,
            CommandName::SaslStart,
            CommandName::SaslContinue,
            CommandName::Logout,
        ] {
            assert!(name.required_action().is_none());
        }
        assert_eq!(
            CommandName::GrantRolesToUser.required_action(),
            Some(ActionType::GrantRole)
        );
    }

    #[test]
    fn test_failure_reply_shape() {
        let reply = CommandReply::failure(&CommandError::authentication_failed());
        assert!(!reply.is_ok());
        assert_eq!(reply.code(), Some(18));
        assert_eq!(reply.code_name(), Some("AuthenticationFailed"));
        assert_eq!(reply.errmsg(), Some("auth failed"));

        let reply = CommandReply::failure(&CommandError::new(ErrorKind::NotFound, "gone"));
        assert_eq!(reply.code(), None);
        assert_eq!(reply.code_name(), Some("NotFound"));
    }

    #[test]
    fn test_success_reply_shape() {
        let mut body = Map::new();
        body.insert("nonce".into(), json!("abc"));
        let reply = CommandReply::success(body);
        assert!(reply.is_ok());
        assert_eq!(reply.get("nonce"), Some(&json!("abc")));
        assert_eq!(reply.into_value(), json!({"nonce": "abc", "ok": 1}));
    }

    #[test]
    fn test_parse_role_names() {
        let roles = parse_role_names(
            &json!(["read", {"role": "root", "db": "admin"}, "read"]),
            "test",
        )
        .unwrap();
        assert_eq!(roles.len(), 2);
        assert!(roles.contains(&RoleName::new("read", "test")));
        assert!(roles.contains(&RoleName::new("root", "admin")));

        assert!(parse_role_names(&json!("read"), "test").is_err());
        assert!(parse_role_names(&json!([1]), "test").is_err());
        assert!(parse_role_names(&json!([{"role": "read"}]), "test").is_err());
        assert!(parse_role_names(&json!([{"role": "read", "db": "../x"}]), "test").is_err());
    }

    #[test]
    fn test_argument_helpers() {
        let doc = json!({"a": "x", "b": "", "c": 1, "d": {"k": 1}, "t": true, "n": 0});
        let doc = doc.as_object().unwrap();

        assert_eq!(string_arg(doc, "a").unwrap(), "x");
        assert!(string_arg(doc, "b").is_err());
        assert!(string_arg(doc, "c").is_err());
        assert!(string_arg(doc, "missing").is_err());

        assert_eq!(optional_string_arg(doc, "missing").unwrap(), None);
        assert!(optional_string_arg(doc, "c").is_err());

        assert!(optional_object_arg(doc, "d").unwrap().is_some());
        assert!(optional_object_arg(doc, "a").is_err());

        assert!(flag_arg(doc, "t"));
        assert!(!flag_arg(doc, "n"));
        assert!(flag_arg(doc, "c"));
        assert!(!flag_arg(doc, "missing"));
    }
}
