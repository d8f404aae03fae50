//! The authkeeper server: stores, dispatcher and persistence wired together.
//!
//! ```rust
//! use authkeeper_core::config::ServerConfig;
//! use authkeeper_core::server::AuthServer;
//! use serde_json::json;
//!
//! let server = AuthServer::open(ServerConfig::default()).unwrap();
//! let mut session = server.new_session();
//! let reply = server.run(&mut session, "test", &json!({"createUser": "alice", "pwd": "secret"}));
//! assert!(reply.is_ok());
//! ```

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, info, warn};

use crate::auth::principal::{validate_database_name, RoleName, UserName};
use crate::auth::session::ClientSession;
use crate::authz::manager::{AuthorizationManager, CreateUserRequest};
use crate::authz::roles::RoleRegistry;
use crate::commands::{CommandDispatcher, CommandReply};
use crate::config::{BootstrapUser, ServerConfig};
use crate::dump::{self, DumpContext, DumpReport, RestoreOptions, RestoreReport, MANIFEST_FILE};
use crate::error::{DumpError, DumpResult, ServerError, ServerResult};
use crate::metrics::AuthMetrics;
use crate::store::credentials::load_bootstrap_users;
use crate::store::indexes::{IndexCatalog, InMemoryIndexCatalog};
use crate::store::users::UserStore;

/// A running authkeeper instance.
#[derive(Debug)]
pub struct AuthServer {
    config: ServerConfig,
    manager: Arc<AuthorizationManager>,
    indexes: Arc<dyn IndexCatalog>,
    dispatcher: CommandDispatcher,
    metrics: Option<Arc<AuthMetrics>>,
}

impl AuthServer {
    /// Build a server from configuration.
    ///
    /// Snapshots found under `storage.data_dir` are restored first, then
    /// bootstrap users that do not exist yet are created.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid, a snapshot cannot be
    /// restored or a bootstrap user is rejected.
    pub fn open(config: ServerConfig) -> ServerResult<Self> {
        config.validate()?;

        let users = Arc::new(UserStore::new(config.security.scram_iterations));
        let roles = Arc::new(RoleRegistry::new());
        let manager = Arc::new(AuthorizationManager::new(
            users,
            roles,
            config.security.update_lock_timeout(),
        ));
        let indexes: Arc<dyn IndexCatalog> = Arc::new(InMemoryIndexCatalog::new());
        let metrics = config.metrics.enabled.then(|| Arc::new(AuthMetrics::new()));
        let dispatcher = CommandDispatcher::new(
            Arc::clone(&manager),
            Arc::clone(&indexes),
            &config.security,
            metrics.clone(),
        );

        let server = Self {
            config,
            manager,
            indexes,
            dispatcher,
            metrics,
        };

        if let Some(data_dir) = server.config.storage.data_dir.clone() {
            server.load_data_dir(&data_dir)?;
        }
        server.bootstrap_users()?;

        if let Some(metrics) = &server.metrics {
            metrics.set_users(server.manager.users().user_count());
        }
        info!(
            users = server.manager.users().user_count(),
            authorization = server.config.security.authorization,
            "Auth server ready"
        );
        Ok(server)
    }

    fn load_data_dir(&self, data_dir: &Path) -> ServerResult<()> {
        for db in snapshot_databases(data_dir)? {
            let report = self.restore(&db, &data_dir.join(&db), &RestoreOptions {
                drop: true,
                cancel: None,
            })?;
            debug!(db = %db, entries = report.applied(), "Loaded snapshot");
        }
        Ok(())
    }

    fn bootstrap_users(&self) -> ServerResult<()> {
        let Some(credentials) = &self.config.security.credentials else {
            return Ok(());
        };

        for user in load_bootstrap_users(credentials)? {
            let name = UserName::new(user.user.as_str(), user.db.as_str());
            if self.manager.users().contains(&name) {
                debug!(user = %name, "Bootstrap user already exists");
                continue;
            }
            self.manager
                .create_user(bootstrap_request(&name, &user))
                .map_err(|source| ServerError::Bootstrap {
                    user: name.clone(),
                    source,
                })?;
            info!(user = %name, "Created bootstrap user");
        }
        Ok(())
    }

    #[must_use]
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    #[must_use]
    pub fn manager(&self) -> &Arc<AuthorizationManager> {
        &self.manager
    }

    #[must_use]
    pub fn indexes(&self) -> &Arc<dyn IndexCatalog> {
        &self.indexes
    }

    #[must_use]
    pub fn dispatcher(&self) -> &CommandDispatcher {
        &self.dispatcher
    }

    #[must_use]
    pub fn metrics(&self) -> Option<&Arc<AuthMetrics>> {
        self.metrics.as_ref()
    }

    /// A fresh client connection.
    #[must_use]
    pub fn new_session(&self) -> ClientSession {
        ClientSession::new()
    }

    /// Run one command document for `session` against `db`.
    pub fn run(&self, session: &mut ClientSession, db: &str, command: &Value) -> CommandReply {
        self.dispatcher.run(session, db, command)
    }

    fn dump_context(&self) -> DumpContext<'_> {
        DumpContext {
            manager: &self.manager,
            indexes: self.indexes.as_ref(),
        }
    }

    /// Dump `db` under `destination/<db>/`.
    ///
    /// # Errors
    ///
    /// See [`dump::dump`].
    pub fn dump(&self, db: &str, destination: &Path) -> DumpResult<DumpReport> {
        dump::dump(self.dump_context(), db, destination)
    }

    /// Restore `db` from `source`.
    ///
    /// # Errors
    ///
    /// See [`dump::restore`].
    pub fn restore(
        &self,
        db: &str,
        source: &Path,
        options: &RestoreOptions,
    ) -> DumpResult<RestoreReport> {
        let result = dump::restore(self.dump_context(), db, source, options);
        if let Some(metrics) = &self.metrics {
            match &result {
                Ok(report) => metrics.record_restored(report.applied()),
                Err(DumpError::Interrupted { applied } | DumpError::Partial { applied, .. }) => {
                    metrics.record_restored(*applied);
                }
                Err(_) => {}
            }
            metrics.set_users(self.manager.users().user_count());
        }
        result
    }

    /// Databases with any users, user-defined roles or index definitions.
    #[must_use]
    pub fn databases(&self) -> BTreeSet<String> {
        let mut dbs: BTreeSet<String> = self
            .manager
            .users()
            .all_users()
            .into_iter()
            .map(|user| user.db)
            .collect();
        dbs.extend(self.manager.roles().databases());
        dbs.extend(self.indexes.databases());
        dbs
    }

    /// Write every database to `storage.data_dir`.
    ///
    /// Databases that were persisted before but are now empty get an empty
    /// snapshot, so dropped data stays dropped on the next start. Without a
    /// data directory this does nothing.
    ///
    /// # Errors
    ///
    /// Returns an error if the data directory cannot be read or a dump fails.
    pub fn persist(&self) -> ServerResult<Vec<DumpReport>> {
        let Some(data_dir) = &self.config.storage.data_dir else {
            return Ok(Vec::new());
        };

        let mut dbs = self.databases();
        if data_dir.is_dir() {
            dbs.extend(snapshot_databases(data_dir)?);
        }

        let mut reports = Vec::with_capacity(dbs.len());
        for db in &dbs {
            reports.push(self.dump(db, data_dir)?);
        }
        info!(dir = %data_dir.display(), databases = reports.len(), "Persisted auth metadata");
        Ok(reports)
    }
}

fn bootstrap_request(name: &UserName, user: &BootstrapUser) -> CreateUserRequest {
    CreateUserRequest {
        name: name.clone(),
        password: user.password(),
        roles: user
            .roles
            .iter()
            .map(|role| RoleName::new(role.as_str(), user.db.as_str()))
            .collect(),
        custom_data: None,
    }
}

/// Names of the subdirectories of `data_dir` that hold a snapshot manifest.
fn snapshot_databases(data_dir: &Path) -> ServerResult<BTreeSet<String>> {
    let io_err = |source| ServerError::DataDir {
        path: data_dir.display().to_string(),
        source,
    };

    if !data_dir.exists() {
        return Ok(BTreeSet::new());
    }

    let mut dbs = BTreeSet::new();
    for entry in fs::read_dir(data_dir).map_err(io_err)? {
        let path: PathBuf = entry.map_err(io_err)?.path();
        if !path.join(MANIFEST_FILE).is_file() {
            continue;
        }
        match path.file_name().and_then(|name| name.to_str()) {
            Some(db) if validate_database_name(db).is_ok() => {
                dbs.insert(db.to_string());
            }
            _ => warn!(path = %path.display(), "Skipping snapshot with an invalid database name"),
        }
    }
    Ok(dbs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    use crate::config::CredentialConfig;

    fn config_with_dir(dir: &Path) -> ServerConfig {
        let mut config = ServerConfig::default();
        config.storage.data_dir = Some(dir.to_path_buf());
        config
    }

    #[test]
    fn test_open_in_memory() {
        let server = AuthServer::open(ServerConfig::default()).unwrap();
        assert!(server.databases().is_empty());
        assert!(server.persist().unwrap().is_empty());
    }

    #[test]
    fn test_open_rejects_invalid_config() {
        let mut config = ServerConfig::default();
        config.security.enabled_mechanisms.clear();
        assert!(matches!(AuthServer::open(config), Err(ServerError::Config(_))));
    }

    #[test]
    fn test_bootstrap_users_created_once() {
        let mut config = ServerConfig::default();
        config.security.credentials = Some(CredentialConfig::Inline {
            users: vec![BootstrapUser {
                user: "admin".into(),
                db: "admin".into(),
                password: "secret".into(),
                roles: vec!["root".into()],
            }],
        });

        let server = AuthServer::open(config).unwrap();
        let admin = UserName::new("admin", "admin");
        let doc = server.manager().users().get_user(&admin).unwrap();
        assert!(doc.roles.contains(&RoleName::new("root", "admin")));
        assert!(doc.credentials.verify_password("admin", "secret"));
    }

    #[test]
    fn test_bootstrap_unknown_role_fails() {
        let mut config = ServerConfig::default();
        config.security.credentials = Some(CredentialConfig::Inline {
            users: vec![BootstrapUser {
                user: "app".into(),
                db: "shop".into(),
                password: "secret".into(),
                roles: vec!["root".into()],
            }],
        });
        assert!(matches!(
            AuthServer::open(config),
            Err(ServerError::Bootstrap { .. })
        ));
    }

    #[test]
    fn test_persist_and_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let server = AuthServer::open(config_with_dir(dir.path())).unwrap();
            let mut session = server.new_session();
            for (db, user) in [("shop", "alice"), ("blog", "bob")] {
                let reply = server.run(
                    &mut session,
                    db,
                    &json!({"createUser": user, "pwd": "password", "roles": ["read"]}),
                );
                assert!(reply.is_ok(), "{reply}");
            }
            let reports = server.persist().unwrap();
            assert_eq!(reports.len(), 2);
        }

        let server = AuthServer::open(config_with_dir(dir.path())).unwrap();
        assert_eq!(server.manager().users().user_count(), 2);
        assert!(server
            .manager()
            .users()
            .contains(&UserName::new("bob", "blog")));
    }

    #[test]
    fn test_dropped_database_stays_dropped() {
        let dir = TempDir::new().unwrap();
        {
            let server = AuthServer::open(config_with_dir(dir.path())).unwrap();
            let mut session = server.new_session();
            server.run(&mut session, "shop", &json!({"createUser": "alice", "pwd": "pw"}));
            server.persist().unwrap();
            let reply = server.run(&mut session, "shop", &json!({"dropDatabase": 1}));
            assert!(reply.is_ok());
            server.persist().unwrap();
        }

        let server = AuthServer::open(config_with_dir(dir.path())).unwrap();
        assert_eq!(server.manager().users().user_count(), 0);
    }

    #[test]
    fn test_restore_records_metrics() {
        let dir = TempDir::new().unwrap();
        let server = AuthServer::open(ServerConfig::default()).unwrap();
        let mut session = server.new_session();
        server.run(&mut session, "shop", &json!({"createUser": "alice", "pwd": "pw"}));
        server.dump("shop", dir.path()).unwrap();

        let report = server
            .restore("copy", &dir.path().join("shop"), &RestoreOptions::default())
            .unwrap();
        assert_eq!(report.users, 1);

        let metrics = server.metrics().unwrap();
        assert_eq!(metrics.restored_entries.get() as usize, 1);
        assert_eq!(metrics.users.get(), 2);
    }
}
