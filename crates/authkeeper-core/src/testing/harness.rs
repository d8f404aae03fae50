//! Test harness for integration testing of the auth server.
//!
//! Provides a complete test environment with:
//! - An [`AuthServer`] backed by a temporary data directory
//! - Helpers for running commands and logging in with each mechanism

use std::collections::BTreeSet;
use std::path::Path;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use serde_json::{json, Value};
use tempfile::TempDir;

use crate::auth::challenge::client_key;
use crate::auth::mechanism::Mechanism;
use crate::auth::principal::{RoleName, UserName};
use crate::auth::sasl::scram::{ScramClient, ScramSha256};
use crate::auth::session::ClientSession;
use crate::authz::manager::CreateUserRequest;
use crate::commands::CommandReply;
use crate::config::ServerConfig;
use crate::server::AuthServer;

/// Test harness for integration testing.
pub struct TestHarness {
    /// The server under test
    pub server: AuthServer,
    /// Temporary data directory, removed on drop
    data_dir: TempDir,
}

impl TestHarness {
    /// Create a harness with default configuration.
    ///
    /// Default config: authorization on, every mechanism enabled, no users.
    #[must_use]
    pub fn new() -> Self {
        TestHarnessBuilder::new().build()
    }

    /// Data directory used by [`persist`](Self::persist) and [`reopen`](Self::reopen).
    #[must_use]
    pub fn data_dir(&self) -> &Path {
        self.data_dir.path()
    }

    /// A fresh client connection.
    #[must_use]
    pub fn session(&self) -> ClientSession {
        self.server.new_session()
    }

    /// Run a command.
    pub fn run(&self, session: &mut ClientSession, db: &str, command: Value) -> CommandReply {
        self.server.run(session, db, &command)
    }

    /// Run a command and assert it succeeded.
    pub fn run_ok(&self, session: &mut ClientSession, db: &str, command: Value) -> CommandReply {
        let reply = self.run(session, db, command.clone());
        assert!(reply.is_ok(), "command {command} failed: {reply}");
        reply
    }

    /// Create a user directly, bypassing command authorization.
    pub fn create_user(&self, db: &str, user: &str, password: &str, roles: &[&str]) {
        self.server
            .manager()
            .create_user(CreateUserRequest {
                name: UserName::new(user, db),
                password: password.to_string(),
                roles: roles.iter().map(|role| RoleName::new(*role, db)).collect(),
                custom_data: None,
            })
            .expect("Failed to create user");
    }

    /// Roles currently held by a user.
    #[must_use]
    pub fn roles_of(&self, db: &str, user: &str) -> BTreeSet<RoleName> {
        self.server
            .manager()
            .users()
            .get_user(&UserName::new(user, db))
            .expect("user should exist")
            .roles
    }

    /// `getnonce` then `authenticate` with a correctly derived key.
    pub fn login_challenge(
        &self,
        session: &mut ClientSession,
        db: &str,
        user: &str,
        password: &str,
    ) -> CommandReply {
        let nonce = self.get_nonce(session, db);
        let key = client_key(user, password, &nonce);
        self.run(
            session,
            db,
            json!({"authenticate": 1, "user": user, "nonce": nonce, "key": key}),
        )
    }

    /// Ask for a nonce and return it.
    pub fn get_nonce(&self, session: &mut ClientSession, db: &str) -> String {
        let reply = self.run_ok(session, db, json!({"getnonce": 1}));
        reply
            .get("nonce")
            .and_then(Value::as_str)
            .expect("getnonce reply has a nonce")
            .to_string()
    }

    /// `authenticate` with mechanism `PLAIN`.
    pub fn login_plain(
        &self,
        session: &mut ClientSession,
        db: &str,
        user: &str,
        password: &str,
    ) -> CommandReply {
        self.run(
            session,
            db,
            json!({
                "authenticate": 1,
                "mechanism": Mechanism::Plain.mechanism_name(),
                "user": user,
                "pwd": password,
            }),
        )
    }

    /// Full SCRAM-SHA-256 conversation. Returns the last reply.
    pub fn login_scram(
        &self,
        session: &mut ClientSession,
        db: &str,
        user: &str,
        password: &str,
    ) -> CommandReply {
        let mut client = ScramClient::<ScramSha256>::new(user, password);
        let start = self.run(
            session,
            db,
            json!({
                "saslStart": 1,
                "mechanism": Mechanism::ScramSha256.mechanism_name(),
                "payload": BASE64.encode(client.client_first()),
            }),
        );
        if !start.is_ok() {
            return start;
        }

        let server_first = decode_reply_payload(&start);
        let Ok(client_final) = client.client_final(&server_first) else {
            panic!("server-first-message rejected by client: {server_first}");
        };
        let conversation_id = start.get("conversationId").cloned().unwrap_or(Value::Null);
        let reply = self.run(
            session,
            db,
            json!({
                "saslContinue": 1,
                "conversationId": conversation_id,
                "payload": BASE64.encode(client_final),
            }),
        );
        if reply.is_ok() {
            client
                .verify_server_final(&decode_reply_payload(&reply))
                .expect("server signature should verify");
        }
        reply
    }

    /// Write every database to the data directory.
    pub fn persist(&self) {
        self.server.persist().expect("Failed to persist");
    }

    /// Restart the server on the same data directory.
    #[must_use]
    pub fn reopen(self) -> Self {
        let config = self.server.config().clone();
        let server = AuthServer::open(config).expect("Failed to reopen server");
        Self {
            server,
            data_dir: self.data_dir,
        }
    }
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}

fn decode_reply_payload(reply: &CommandReply) -> String {
    let encoded = reply
        .get("payload")
        .and_then(Value::as_str)
        .expect("SASL reply has a payload");
    let bytes = BASE64.decode(encoded).expect("payload is base64");
    String::from_utf8(bytes).expect("payload is UTF-8")
}

/// Builder for creating test harness with specific configuration.
pub struct TestHarnessBuilder {
    config: ServerConfig,
}

impl TestHarnessBuilder {
    /// Create a new builder with default settings.
    #[must_use]
    pub fn new() -> Self {
        let mut config = ServerConfig::default();
        config.security.authorization = true;
        Self { config }
    }

    /// Enforce privileges or not.
    #[must_use]
    pub fn authorization(mut self, enabled: bool) -> Self {
        self.config.security.authorization = enabled;
        self
    }

    /// Set the enabled mechanisms.
    #[must_use]
    pub fn mechanisms(mut self, mechanisms: Vec<Mechanism>) -> Self {
        self.config.security.enabled_mechanisms = mechanisms;
        self
    }

    /// Set the update lock timeout.
    #[must_use]
    pub fn update_lock_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.config.security.update_lock_timeout_ms = timeout_ms;
        self
    }

    /// Build the test harness.
    #[must_use]
    pub fn build(mut self) -> TestHarness {
        let data_dir = TempDir::new().expect("Failed to create data dir");
        self.config.storage.data_dir = Some(data_dir.path().to_path_buf());
        let server = AuthServer::open(self.config).expect("Failed to open server");
        TestHarness { server, data_dir }
    }
}

impl Default for TestHarnessBuilder {
    fn default() -> Self {
        Self::new()
    }
}
