//! User management commands.

use std::collections::BTreeSet;
use std::sync::Arc;

use serde_json::{Map, Value};

use crate::auth::principal::{validate_database_name, RoleName, UserName};
use crate::authz::manager::{AuthorizationManager, CreateUserRequest};
use crate::authz::privileges::ActionType;
use crate::error::{CommandError, CommandResult};
use crate::store::users::UserUpdate;

use super::{
    optional_object_arg, optional_string_arg, parse_role_names, string_arg, Access,
    CommandContext, CommandHandler, CommandName,
};

/// Handles `createUser`, `updateUser`, `dropUser`, `dropAllUsersFromDatabase`,
/// `usersInfo`, `grantRolesToUser` and `revokeRolesFromUser`.
#[derive(Debug)]
pub struct UserHandler {
    manager: Arc<AuthorizationManager>,
}

impl UserHandler {
    #[must_use]
    pub fn new(manager: Arc<AuthorizationManager>) -> Self {
        Self { manager }
    }

    fn create_user(
        &self,
        ctx: &CommandContext<'_>,
        doc: &Map<String, Value>,
    ) -> CommandResult<Map<String, Value>> {
        let user = string_arg(doc, "createUser")?;
        let password = string_arg(doc, "pwd")?;
        let roles = match doc.get("roles") {
            Some(roles) => parse_role_names(roles, ctx.db)?,
            None => BTreeSet::new(),
        };
        ctx.require_for_roles(&roles, ActionType::GrantRole)?;

        let request = CreateUserRequest {
            name: UserName::new(user, ctx.db),
            password: password.to_string(),
            roles,
            custom_data: optional_object_arg(doc, "customData")?,
        };
        if ctx.access == Access::FirstUser {
            self.manager.create_first_user(request)?;
        } else {
            self.manager.create_user(request)?;
        }
        Ok(Map::new())
    }

    fn update_user(
        &self,
        ctx: &CommandContext<'_>,
        doc: &Map<String, Value>,
    ) -> CommandResult<Map<String, Value>> {
        let name = UserName::new(string_arg(doc, "updateUser")?, ctx.db);
        let update = UserUpdate {
            password: optional_string_arg(doc, "pwd")?.map(str::to_string),
            custom_data: optional_object_arg(doc, "customData")?,
            roles: doc
                .get("roles")
                .map(|roles| parse_role_names(roles, ctx.db))
                .transpose()?,
        };
        if let Some(roles) = &update.roles {
            ctx.require_for_roles(roles, ActionType::GrantRole)?;
        }
        self.manager.update_user(&name, update)?;
        Ok(Map::new())
    }

    fn drop_user(&self, db: &str, doc: &Map<String, Value>) -> CommandResult<Map<String, Value>> {
        let name = UserName::new(string_arg(doc, "dropUser")?, db);
        self.manager.drop_user(&name)?;
        Ok(Map::new())
    }

    fn drop_all_users(&self, db: &str) -> CommandResult<Map<String, Value>> {
        let removed = self.manager.drop_all_users(db)?;
        let mut body = Map::new();
        body.insert("n".into(), Value::from(removed));
        Ok(body)
    }

    /// `usersInfo: 1` lists the database, a name or `{user, db}` looks up one
    /// user, an array looks up several and skips the missing ones.
    fn users_info(
        &self,
        ctx: &CommandContext<'_>,
        doc: &Map<String, Value>,
    ) -> CommandResult<Map<String, Value>> {
        let db = ctx.db;
        let store = self.manager.users();
        let users: Vec<Value> = match doc.get("usersInfo") {
            Some(Value::Number(_)) => {
                let mut users = store.get_users(db);
                users.sort_by(|a, b| a.user.cmp(&b.user));
                users.iter().map(|u| u.to_info()).collect()
            }
            Some(Value::Array(items)) => {
                let names = items
                    .iter()
                    .map(|item| parse_user_name(item, db))
                    .collect::<CommandResult<Vec<_>>>()?;
                for name in &names {
                    ctx.require(&name.db, ActionType::ViewUser)?;
                }
                names
                    .iter()
                    .filter_map(|name| store.get_user(name).ok())
                    .map(|u| u.to_info())
                    .collect()
            }
            Some(single) => {
                let name = parse_user_name(single, db)?;
                ctx.require(&name.db, ActionType::ViewUser)?;
                vec![store.get_user(&name)?.to_info()]
            }
            None => return Err(CommandError::invalid_argument("missing 'usersInfo'")),
        };

        let mut body = Map::new();
        body.insert("users".into(), Value::Array(users));
        Ok(body)
    }

    fn grant_roles(
        &self,
        ctx: &CommandContext<'_>,
        doc: &Map<String, Value>,
    ) -> CommandResult<Map<String, Value>> {
        let name = UserName::new(string_arg(doc, "grantRolesToUser")?, ctx.db);
        let roles = required_roles(doc, ctx.db)?;
        ctx.require_for_roles(&roles, ActionType::GrantRole)?;
        self.manager.grant_roles(&name, &roles)?;
        Ok(Map::new())
    }

    fn revoke_roles(
        &self,
        ctx: &CommandContext<'_>,
        doc: &Map<String, Value>,
    ) -> CommandResult<Map<String, Value>> {
        let name = UserName::new(string_arg(doc, "revokeRolesFromUser")?, ctx.db);
        let roles = required_roles(doc, ctx.db)?;
        ctx.require_for_roles(&roles, ActionType::RevokeRole)?;
        self.manager.revoke_roles(&name, &roles)?;
        Ok(Map::new())
    }
}

fn required_roles(doc: &Map<String, Value>, db: &str) -> CommandResult<BTreeSet<RoleName>> {
    let roles = doc
        .get("roles")
        .ok_or_else(|| CommandError::invalid_argument("missing 'roles'"))?;
    parse_role_names(roles, db)
}

fn parse_user_name(value: &Value, default_db: &str) -> CommandResult<UserName> {
    match value {
        Value::String(user) if !user.is_empty() => Ok(UserName::new(user.as_str(), default_db)),
        Value::Object(obj) => {
            let db = string_arg(obj, "db")?;
            validate_database_name(db)?;
            Ok(UserName::new(string_arg(obj, "user")?, db))
        }
        _ => Err(CommandError::invalid_argument(
            "user must be a name or a {user, db} document",
        )),
    }
}

impl CommandHandler for UserHandler {
    fn handle(
        &self,
        ctx: &mut CommandContext<'_>,
        doc: &Map<String, Value>,
    ) -> CommandResult<Map<String, Value>> {
        match ctx.name {
            CommandName::CreateUser => self.create_user(ctx, doc),
            CommandName::UpdateUser => self.update_user(ctx, doc),
            CommandName::DropUser => self.drop_user(ctx.db, doc),
            CommandName::DropAllUsersFromDatabase => self.drop_all_users(ctx.db),
            CommandName::UsersInfo => self.users_info(ctx, doc),
            CommandName::GrantRolesToUser => self.grant_roles(ctx, doc),
            CommandName::RevokeRolesFromUser => self.revoke_roles(ctx, doc),
            other => Err(CommandError::invalid_argument(format!(
                "{other} is not a user management command"
            ))),
        }
    }
}
