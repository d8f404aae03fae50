//! Handshake commands: `getnonce`, `authenticate`, `saslStart`,
//! `saslContinue` and `logout`.

use std::sync::Arc;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::auth::challenge::{generate_nonce, ChallengeRequest, ChallengeResponseAuthenticator};
use crate::auth::mechanism::Mechanism;
use crate::auth::principal::UserName;
use crate::auth::sasl::{plain_message, SaslAuthenticator, SaslServer, SaslSession, SaslStepResult};
use crate::authz::manager::AuthorizationManager;
use crate::config::SecurityConfig;
use crate::error::{AuthError, CommandError, CommandResult, ErrorKind};
use crate::metrics::AuthMetrics;
use crate::store::credentials::CredentialStore;

use super::{optional_string_arg, string_arg, CommandContext, CommandHandler, CommandName};

/// Handles the authentication handshake commands.
#[derive(Debug)]
pub struct AuthHandler {
    manager: Arc<AuthorizationManager>,
    sasl_server: SaslServer,
    challenge: ChallengeResponseAuthenticator,
    challenge_enabled: bool,
    metrics: Option<Arc<AuthMetrics>>,
}

impl AuthHandler {
    #[must_use]
    pub fn new(
        manager: Arc<AuthorizationManager>,
        config: &SecurityConfig,
        metrics: Option<Arc<AuthMetrics>>,
    ) -> Self {
        let store: Arc<dyn CredentialStore> = manager.users().clone();
        Self {
            sasl_server: SaslServer::new(Arc::clone(&store), config),
            challenge: ChallengeResponseAuthenticator::new(store),
            challenge_enabled: config.is_enabled(Mechanism::ChallengeResponse),
            manager,
            metrics,
        }
    }

    #[must_use]
    pub fn sasl_server(&self) -> &SaslServer {
        &self.sasl_server
    }

    fn record(&self, mechanism: Mechanism, success: bool) {
        if let Some(metrics) = &self.metrics {
            metrics.record_auth(mechanism.mechanism_name(), success);
        }
    }

    /// Bind a verified user to the connection.
    fn login(
        &self,
        ctx: &mut CommandContext<'_>,
        name: &UserName,
        mechanism: Mechanism,
    ) -> CommandResult<()> {
        // The user may have been dropped since its credentials were read.
        let Some(user) = self.manager.authenticated_user(name, mechanism) else {
            warn!(user = %name, "Authenticated user vanished before login");
            self.record(mechanism, false);
            return Err(CommandError::authentication_failed());
        };
        ctx.session.authz.login(user);
        self.record(mechanism, true);
        info!(session = ctx.session.id(), user = %name, mechanism = %mechanism, "Authenticated");
        Ok(())
    }

    fn get_nonce(&self, ctx: &mut CommandContext<'_>) -> Map<String, Value> {
        let nonce = generate_nonce();
        ctx.session.set_pending_nonce(nonce.clone());
        debug!(session = ctx.session.id(), "Issued nonce");

        let mut body = Map::new();
        body.insert("nonce".into(), Value::String(nonce));
        body
    }

    fn authenticate(
        &self,
        ctx: &mut CommandContext<'_>,
        doc: &Map<String, Value>,
    ) -> CommandResult<Map<String, Value>> {
        // Every attempt consumes the pending nonce, whatever its outcome.
        let pending = ctx.session.take_pending_nonce();

        let mechanism = match optional_string_arg(doc, "mechanism")? {
            Some(name) => name.parse::<Mechanism>()?,
            None => Mechanism::ChallengeResponse,
        };

        let name = match mechanism {
            Mechanism::ChallengeResponse => self.challenge_response(ctx, pending.as_deref(), doc)?,
            Mechanism::Plain => self.plain(ctx, doc)?,
            Mechanism::ScramSha256 | Mechanism::ScramSha512 => {
                return Err(CommandError::invalid_argument(format!(
                    "{mechanism} must be negotiated with saslStart"
                )));
            }
        };

        self.login(ctx, &name, mechanism)?;

        let mut body = Map::new();
        body.insert("user".into(), Value::String(name.user));
        body.insert("db".into(), Value::String(name.db));
        Ok(body)
    }

    fn challenge_response(
        &self,
        ctx: &CommandContext<'_>,
        pending: Option<&str>,
        doc: &Map<String, Value>,
    ) -> CommandResult<UserName> {
        if !self.challenge_enabled {
            warn!(session = ctx.session.id(), "Challenge-response attempted while disabled");
            self.record(Mechanism::ChallengeResponse, false);
            return Err(AuthError::ChallengeResponseDisabled.into());
        }

        let field = |name: &str| doc.get(name).and_then(Value::as_str).map(str::to_string);
        let request = ChallengeRequest {
            user: field("user"),
            nonce: field("nonce"),
            key: field("key"),
        };

        self.challenge
            .authenticate(pending, &request, ctx.db)
            .map_err(|err| {
                if err == AuthError::InvalidCredentials {
                    self.record(Mechanism::ChallengeResponse, false);
                }
                CommandError::from(err)
            })
    }

    fn plain(
        &self,
        ctx: &CommandContext<'_>,
        doc: &Map<String, Value>,
    ) -> CommandResult<UserName> {
        let authenticator = self
            .sasl_server
            .get_authenticator(Mechanism::Plain)
            .ok_or_else(|| AuthError::UnsupportedMechanism(Mechanism::Plain.to_string()))?;

        let user = doc.get("user").and_then(Value::as_str).unwrap_or_default();
        let pwd = doc.get("pwd").and_then(Value::as_str).unwrap_or_default();

        let mut session = SaslSession::new(Mechanism::Plain, ctx.db);
        match authenticator.authenticate_step(&plain_message(user, pwd), &mut session) {
            SaslStepResult::Complete(_) => session
                .authenticated_user
                .ok_or_else(CommandError::authentication_failed),
            SaslStepResult::Continue(_) => Err(CommandError::authentication_failed()),
            SaslStepResult::Failed(err) => {
                self.record(Mechanism::Plain, false);
                Err(err.into())
            }
        }
    }

    fn sasl_start(
        &self,
        ctx: &mut CommandContext<'_>,
        doc: &Map<String, Value>,
    ) -> CommandResult<Map<String, Value>> {
        let mechanism = string_arg(doc, "mechanism")?;
        let (mut session, authenticator) = self.sasl_server.start_session(mechanism, ctx.db)?;

        // A new conversation replaces any handshake in progress.
        ctx.session.reset_handshake();
        let conversation_id = ctx.session.allocate_conversation_id();
        debug!(
            session = ctx.session.id(),
            conversation_id,
            mechanism = %session.mechanism,
            "SASL conversation started"
        );

        let payload = decode_payload(doc).map_err(|err| {
            self.record(session.mechanism, false);
            err
        })?;
        let result = authenticator.authenticate_step(&payload, &mut session);
        self.finish_step(ctx, conversation_id, session, result)
    }

    fn sasl_continue(
        &self,
        ctx: &mut CommandContext<'_>,
        doc: &Map<String, Value>,
    ) -> CommandResult<Map<String, Value>> {
        let conversation_id = doc
            .get("conversationId")
            .and_then(Value::as_u64)
            .and_then(|id| u32::try_from(id).ok())
            .ok_or_else(|| CommandError::invalid_argument("conversationId must be an integer"))?;

        let Some(mut session) = ctx.session.take_sasl(conversation_id) else {
            return Err(AuthError::NoConversation.into());
        };

        let Some(authenticator) = self.sasl_server.get_authenticator(session.mechanism) else {
            return Err(CommandError::new(
                ErrorKind::Internal,
                format!("no authenticator for {}", session.mechanism),
            ));
        };

        let payload = decode_payload(doc).map_err(|err| {
            self.record(session.mechanism, false);
            err
        })?;
        let result = authenticator.authenticate_step(&payload, &mut session);
        self.finish_step(ctx, conversation_id, session, result)
    }

    fn finish_step(
        &self,
        ctx: &mut CommandContext<'_>,
        conversation_id: u32,
        session: SaslSession,
        result: SaslStepResult,
    ) -> CommandResult<Map<String, Value>> {
        let (done, payload) = match result {
            SaslStepResult::Complete(payload) => {
                let Some(name) = session.authenticated_user.clone() else {
                    return Err(CommandError::authentication_failed());
                };
                self.login(ctx, &name, session.mechanism)?;
                (true, payload)
            }
            SaslStepResult::Continue(payload) => {
                ctx.session.resume_sasl(conversation_id, session);
                (false, payload)
            }
            SaslStepResult::Failed(err) => {
                warn!(
                    session = ctx.session.id(),
                    conversation_id,
                    mechanism = %session.mechanism,
                    error = %err,
                    "SASL authentication failed"
                );
                self.record(session.mechanism, false);
                return Err(err.into());
            }
        };

        let mut body = Map::new();
        body.insert("conversationId".into(), Value::from(conversation_id));
        body.insert("done".into(), Value::Bool(done));
        body.insert("payload".into(), Value::String(BASE64.encode(payload)));
        Ok(body)
    }

    fn logout(&self, ctx: &mut CommandContext<'_>) -> Map<String, Value> {
        ctx.session.reset_handshake();
        if let Some(user) = ctx.session.authz.logout(ctx.db) {
            info!(session = ctx.session.id(), user = %user.name, "Logged out");
        }
        Map::new()
    }
}

/// Base64 `payload` of a SASL command. Absent means empty.
fn decode_payload(doc: &Map<String, Value>) -> CommandResult<Vec<u8>> {
    match doc.get("payload") {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(Value::String(encoded)) => BASE64
            .decode(encoded)
            .map_err(|_| AuthError::InvalidMessage("payload is not valid base64".into()).into()),
        Some(_) => Err(AuthError::InvalidMessage("payload must be a string".into()).into()),
    }
}

impl CommandHandler for AuthHandler {
    fn handle(
        &self,
        ctx: &mut CommandContext<'_>,
        doc: &Map<String, Value>,
    ) -> CommandResult<Map<String, Value>> {
        match ctx.name {
            CommandName::GetNonce => Ok(self.get_nonce(ctx)),
            CommandName::Authenticate => self.authenticate(ctx, doc),
            CommandName::SaslStart => self.sasl_start(ctx, doc),
            CommandName::SaslContinue => self.sasl_continue(ctx, doc),
            CommandName::Logout => Ok(self.logout(ctx)),
            other => Err(CommandError::invalid_argument(format!(
                "{other} is not an authentication command"
            ))),
        }
    }
}
