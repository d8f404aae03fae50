//! User-defined role commands.

use std::sync::Arc;

use serde_json::{Map, Value};

use crate::auth::principal::RoleName;
use crate::authz::manager::AuthorizationManager;
use crate::authz::privileges::{ActionType, Privilege};
use crate::authz::roles::BuiltinRole;
use crate::error::{CommandError, CommandResult};

use super::{
    flag_arg, parse_role_name, parse_role_names, string_arg, CommandContext, CommandHandler,
    CommandName,
};

/// Handles `createRole`, `dropRole` and `rolesInfo`.
#[derive(Debug)]
pub struct RoleHandler {
    manager: Arc<AuthorizationManager>,
}

impl RoleHandler {
    #[must_use]
    pub fn new(manager: Arc<AuthorizationManager>) -> Self {
        Self { manager }
    }

    fn create_role(
        &self,
        ctx: &CommandContext<'_>,
        doc: &Map<String, Value>,
    ) -> CommandResult<Map<String, Value>> {
        let db = ctx.db;
        let name = RoleName::new(string_arg(doc, "createRole")?, db);
        let privileges: Vec<Privilege> = match doc.get("privileges") {
            Some(value) => serde_json::from_value(value.clone())
                .map_err(|e| CommandError::invalid_argument(format!("invalid privileges: {e}")))?,
            None => Vec::new(),
        };
        let roles = match doc.get("roles") {
            Some(roles) => parse_role_names(roles, db)?,
            None => Default::default(),
        };
        ctx.require_for_roles(&roles, ActionType::GrantRole)?;

        self.manager.create_role(&name, privileges, roles)?;
        Ok(Map::new())
    }

    fn drop_role(&self, db: &str, doc: &Map<String, Value>) -> CommandResult<Map<String, Value>> {
        let name = RoleName::new(string_arg(doc, "dropRole")?, db);
        let stripped = self.manager.drop_role(&name)?;
        let mut body = Map::new();
        body.insert("usersUpdated".into(), Value::from(stripped));
        Ok(body)
    }

    /// `rolesInfo: 1` lists the database's user-defined roles (plus built-ins
    /// with `showBuiltinRoles`); a name or an array looks roles up. Unknown
    /// roles are left out of the reply.
    fn roles_info(
        &self,
        ctx: &CommandContext<'_>,
        doc: &Map<String, Value>,
    ) -> CommandResult<Map<String, Value>> {
        let db = ctx.db;
        let registry = self.manager.roles();
        let show_privileges = flag_arg(doc, "showPrivileges");

        let names: Vec<RoleName> = match doc.get("rolesInfo") {
            Some(Value::Number(_)) => {
                let mut names: Vec<RoleName> =
                    registry.roles_in(db).iter().map(|r| r.name()).collect();
                if flag_arg(doc, "showBuiltinRoles") {
                    names.extend(
                        BuiltinRole::names_in(db)
                            .into_iter()
                            .map(|role| RoleName::new(role, db)),
                    );
                }
                names
            }
            Some(Value::Array(items)) => items
                .iter()
                .map(|item| parse_role_name(item, db))
                .collect::<CommandResult<Vec<_>>>()?,
            Some(single) => vec![parse_role_name(single, db)?],
            None => return Err(CommandError::invalid_argument("missing 'rolesInfo'")),
        };
        ctx.require_for_roles(&names, ActionType::ViewRole)?;

        let roles: Vec<Value> = names
            .iter()
            .filter_map(|name| registry.role_info(name, show_privileges))
            .collect();

        let mut body = Map::new();
        body.insert("roles".into(), Value::Array(roles));
        Ok(body)
    }
}

impl CommandHandler for RoleHandler {
    fn handle(
        &self,
        ctx: &mut CommandContext<'_>,
        doc: &Map<String, Value>,
    ) -> CommandResult<Map<String, Value>> {
        match ctx.name {
            CommandName::CreateRole => self.create_role(ctx, doc),
            CommandName::DropRole => self.drop_role(ctx.db, doc),
            CommandName::RolesInfo => self.roles_info(ctx, doc),
            other => Err(CommandError::invalid_argument(format!(
                "{other} is not a role command"
            ))),
        }
    }
}
