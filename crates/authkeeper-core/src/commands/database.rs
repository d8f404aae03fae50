//! Database-level commands: dropping a database and its index definitions.

use std::sync::Arc;

use serde_json::{Map, Value};
use tracing::info;

use crate::authz::manager::AuthorizationManager;
use crate::error::{CommandError, CommandResult};
use crate::store::indexes::{IndexCatalog, IndexDefinition};

use super::{string_arg, CommandContext, CommandHandler, CommandName};

/// Handles `dropDatabase`, `listIndexes` and `createIndexes`.
#[derive(Debug)]
pub struct DatabaseHandler {
    manager: Arc<AuthorizationManager>,
    indexes: Arc<dyn IndexCatalog>,
}

impl DatabaseHandler {
    #[must_use]
    pub fn new(manager: Arc<AuthorizationManager>, indexes: Arc<dyn IndexCatalog>) -> Self {
        Self { manager, indexes }
    }

    /// Drops users, user-defined roles and index definitions of `db`.
    fn drop_database(&self, db: &str) -> CommandResult<Map<String, Value>> {
        let (users, roles) = self.manager.drop_database(db)?;
        let indexes = self.indexes.drop_indexes(db);
        info!(db, users, roles, indexes, "database dropped");

        let mut body = Map::new();
        body.insert("dropped".into(), Value::String(db.to_string()));
        body.insert("usersDropped".into(), Value::from(users));
        body.insert("rolesDropped".into(), Value::from(roles));
        body.insert("indexesDropped".into(), Value::from(indexes));
        Ok(body)
    }

    fn list_indexes(
        &self,
        db: &str,
        doc: &Map<String, Value>,
    ) -> CommandResult<Map<String, Value>> {
        let collection = string_arg(doc, "listIndexes")?;
        let indexes: Vec<Value> = self
            .indexes
            .list_indexes(db)
            .iter()
            .filter(|def| def.collection() == collection)
            .map(IndexDefinition::to_info)
            .collect();

        let mut body = Map::new();
        body.insert("indexes".into(), Value::Array(indexes));
        Ok(body)
    }

    fn create_indexes(
        &self,
        db: &str,
        doc: &Map<String, Value>,
    ) -> CommandResult<Map<String, Value>> {
        let collection = string_arg(doc, "createIndexes")?;
        let specs = doc
            .get("indexes")
            .and_then(Value::as_array)
            .ok_or_else(|| CommandError::invalid_argument("'indexes' must be an array"))?;
        if specs.is_empty() {
            return Err(CommandError::invalid_argument("'indexes' must not be empty"));
        }

        // Parse everything before touching the catalog.
        let defs = specs
            .iter()
            .map(|spec| -> CommandResult<IndexDefinition> {
                let spec = spec.as_object().ok_or_else(|| {
                    CommandError::invalid_argument("index spec must be a document")
                })?;
                Ok(IndexDefinition::from_spec(db, collection, spec)?)
            })
            .collect::<CommandResult<Vec<_>>>()?;

        let count = |indexes: &dyn IndexCatalog| {
            indexes
                .list_indexes(db)
                .iter()
                .filter(|def| def.collection() == collection)
                .count()
        };
        let before = count(self.indexes.as_ref());
        for def in defs {
            self.indexes.create_index(db, def)?;
        }
        let after = count(self.indexes.as_ref());

        let mut body = Map::new();
        body.insert("numIndexesBefore".into(), Value::from(before));
        body.insert("numIndexesAfter".into(), Value::from(after));
        Ok(body)
    }
}

impl CommandHandler for DatabaseHandler {
    fn handle(
        &self,
        ctx: &mut CommandContext<'_>,
        doc: &Map<String, Value>,
    ) -> CommandResult<Map<String, Value>> {
        let db = ctx.db;
        match ctx.name {
            CommandName::DropDatabase => self.drop_database(db),
            CommandName::ListIndexes => self.list_indexes(db, doc),
            CommandName::CreateIndexes => self.create_indexes(db, doc),
            other => Err(CommandError::invalid_argument(format!(
                "{other} is not a database command"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::Access;
    use std::collections::BTreeSet;
    use std::time::Duration;

    use serde_json::json;

    use crate::auth::principal::{RoleName, UserName};
    use crate::auth::sasl::scram::MIN_ITERATIONS;
    use crate::auth::session::ClientSession;
    use crate::authz::manager::CreateUserRequest;
    use crate::authz::roles::RoleRegistry;
    use crate::error::ErrorKind;
    use crate::store::indexes::InMemoryIndexCatalog;
    use crate::store::users::UserStore;

    fn handler() -> DatabaseHandler {
        let manager = Arc::new(AuthorizationManager::new(
            Arc::new(UserStore::new(MIN_ITERATIONS)),
            Arc::new(RoleRegistry::new()),
            Duration::from_millis(50),
        ));
        DatabaseHandler::new(manager, Arc::new(InMemoryIndexCatalog::new()))
    }

    fn call_in(
        handler: &DatabaseHandler,
        db: &str,
        name: CommandName,
        doc: Value,
    ) -> CommandResult<Map<String, Value>> {
        let mut session = ClientSession::new();
        let mut ctx = CommandContext {
            session: &mut session,
            db,
            name,
            access: Access::Open,
        };
        handler.handle(&mut ctx, doc.as_object().unwrap())
    }

    #[test]
    fn test_create_and_list_indexes() {
        let handler = handler();
        let body = call_in(
            &handler,
            "test",
            CommandName::CreateIndexes,
            json!({
                "createIndexes": "foo",
                "indexes": [{"key": {"a": 1}}, {"key": {"b": -1}, "name": "by_b", "unique": true}],
            }),
        )
        .unwrap();
        assert_eq!(body["numIndexesBefore"], 0);
        assert_eq!(body["numIndexesAfter"], 2);

        call_in(
            &handler,
            "test",
            CommandName::CreateIndexes,
            json!({"createIndexes": "bar", "indexes": [{"key": {"c": 1}}]}),
        )
        .unwrap();

        let body = call_in(
            &handler,
            "test",
            CommandName::ListIndexes,
            json!({"listIndexes": "foo"}),
        )
        .unwrap();
        let names: Vec<&str> = body["indexes"]
            .as_array()
            .unwrap()
            .iter()
            .map(|i| i["name"].as_str().unwrap())
            .collect();
        assert_eq!(names, vec!["a_1", "by_b"]);
    }

    #[test]
    fn test_create_indexes_rejects_bad_spec() {
        let handler = handler();
        let err = call_in(
            &handler,
            "test",
            CommandName::CreateIndexes,
            json!({"createIndexes": "foo", "indexes": [{"key": {"a": 1}}, {"key": {}}]}),
        )
        .unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidArgument);

        // Nothing from the batch was applied.
        let body = call_in(
            &handler,
            "test",
            CommandName::ListIndexes,
            json!({"listIndexes": "foo"}),
        )
        .unwrap();
        assert!(body["indexes"].as_array().unwrap().is_empty());
    }

    #[test]
    fn test_drop_database_scoped() {
        let handler = handler();
        for db in ["test", "other"] {
            handler
                .manager
                .create_user(CreateUserRequest {
                    name: UserName::new("spencer", db),
                    password: "password".into(),
                    roles: BTreeSet::from([RoleName::new("read", db)]),
                    custom_data: None,
                })
                .unwrap();
            call_in(
                &handler,
                db,
                CommandName::CreateIndexes,
                json!({"createIndexes": "foo", "indexes": [{"key": {"a": 1}}]}),
            )
            .unwrap();
        }

        let body = call_in(
            &handler,
            "test",
            CommandName::DropDatabase,
            json!({"dropDatabase": 1}),
        )
        .unwrap();
        assert_eq!(body["dropped"], "test");
        assert_eq!(body["usersDropped"], 1);
        assert_eq!(body["indexesDropped"], 1);

        assert!(handler.manager.users().get_users("test").is_empty());
        assert_eq!(handler.manager.users().get_users("other").len(), 1);
        assert_eq!(handler.indexes.list_indexes("other").len(), 1);
    }
}
