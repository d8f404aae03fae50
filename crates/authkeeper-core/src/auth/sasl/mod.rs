//! SASL authentication implementations.
//!
//! This module provides server-side SASL authentication for client connections.
//! Supported mechanisms:
//! - PLAIN - Simple username/password (should only be used over TLS)
//! - SCRAM-SHA-256 - Challenge-response authentication
//! - SCRAM-SHA-512 - Challenge-response authentication

pub mod plain;
pub mod scram;

pub use plain::{plain_message, PlainAuthenticator};
pub use scram::{
    generate_scram_credentials, generate_scram_credentials_with_salt, ScramClient,
    ScramCredentials, ScramHash, ScramSessionState, ScramSha256, ScramSha256Authenticator,
    ScramSha512, ScramSha512Authenticator,
};

use std::sync::Arc;

use crate::auth::mechanism::Mechanism;
use crate::auth::principal::UserName;
use crate::config::SecurityConfig;
use crate::error::{AuthError, AuthResult};
use crate::store::credentials::CredentialStore;

/// SASL session state.
#[derive(Debug)]
pub struct SaslSession {
    /// The mechanism being used.
    pub mechanism: Mechanism,
    /// Database the user is looked up in.
    pub db: String,
    /// The authenticated user (set when authentication completes).
    pub authenticated_user: Option<UserName>,
    /// Number of authentication steps completed.
    pub step_count: usize,
    /// SCRAM-specific session state for multi-step authentication.
    pub scram_state: Option<ScramSessionState>,
}

impl SaslSession {
    /// Create a new SASL session.
    #[must_use]
    pub fn new(mechanism: Mechanism, db: impl Into<String>) -> Self {
        Self {
            mechanism,
            db: db.into(),
            authenticated_user: None,
            step_count: 0,
            scram_state: None,
        }
    }

    /// Check if authentication is complete.
    #[must_use]
    pub fn is_authenticated(&self) -> bool {
        self.authenticated_user.is_some()
    }
}

/// Result of a SASL authentication step.
#[derive(Debug)]
pub enum SaslStepResult {
    /// Authentication completed successfully, with optional final response.
    Complete(Vec<u8>),
    /// More steps required, send this challenge to client.
    Continue(Vec<u8>),
    /// Authentication failed.
    Failed(AuthError),
}

/// Trait for SASL authenticators.
pub trait SaslAuthenticator: Send + Sync + std::fmt::Debug {
    /// The mechanism this authenticator implements.
    fn mechanism(&self) -> Mechanism;

    /// Process a client authentication message.
    fn authenticate_step(&self, client_message: &[u8], session: &mut SaslSession)
        -> SaslStepResult;

    /// Check if authentication is complete for this session.
    fn is_complete(&self, session: &SaslSession) -> bool;
}

/// The closed set of SASL validators.
#[derive(Debug)]
pub enum MechanismAuthenticator {
    Plain(PlainAuthenticator),
    ScramSha256(ScramSha256Authenticator),
    ScramSha512(ScramSha512Authenticator),
}

impl MechanismAuthenticator {
    fn inner(&self) -> &dyn SaslAuthenticator {
        match self {
            Self::Plain(a) => a,
            Self::ScramSha256(a) => a,
            Self::ScramSha512(a) => a,
        }
    }
}

impl SaslAuthenticator for MechanismAuthenticator {
    fn mechanism(&self) -> Mechanism {
        self.inner().mechanism()
    }

    fn authenticate_step(
        &self,
        client_message: &[u8],
        session: &mut SaslSession,
    ) -> SaslStepResult {
        self.inner().authenticate_step(client_message, session)
    }

    fn is_complete(&self, session: &SaslSession) -> bool {
        self.inner().is_complete(session)
    }
}

/// SASL server that manages the enabled authenticators.
#[derive(Debug)]
pub struct SaslServer {
    authenticators: Vec<MechanismAuthenticator>,
}

impl SaslServer {
    /// Create a SASL server with one authenticator per enabled SASL mechanism.
    ///
    /// `CHALLENGE-RESPONSE` is not a SASL mechanism and is skipped here.
    #[must_use]
    pub fn new(credential_store: Arc<dyn CredentialStore>, config: &SecurityConfig) -> Self {
        let mut authenticators = Vec::new();

        for mechanism in &config.enabled_mechanisms {
            let authenticator = match mechanism {
                Mechanism::ChallengeResponse => continue,
                Mechanism::Plain => MechanismAuthenticator::Plain(PlainAuthenticator::new(
                    Arc::clone(&credential_store),
                )),
                Mechanism::ScramSha256 => MechanismAuthenticator::ScramSha256(
                    ScramSha256Authenticator::new(
                        Arc::clone(&credential_store),
                        config.scram_iterations,
                    ),
                ),
                Mechanism::ScramSha512 => MechanismAuthenticator::ScramSha512(
                    ScramSha512Authenticator::new(
                        Arc::clone(&credential_store),
                        config.scram_iterations,
                    ),
                ),
            };
            if authenticators
                .iter()
                .all(|a: &MechanismAuthenticator| a.mechanism() != *mechanism)
            {
                authenticators.push(authenticator);
            }
        }

        Self { authenticators }
    }

    /// Get the list of enabled mechanism names.
    #[must_use]
    pub fn enabled_mechanisms(&self) -> Vec<&'static str> {
        self.authenticators
            .iter()
            .map(|a| a.mechanism().mechanism_name())
            .collect()
    }

    /// Get the authenticator for a mechanism.
    #[must_use]
    pub fn get_authenticator(&self, mechanism: Mechanism) -> Option<&MechanismAuthenticator> {
        self.authenticators
            .iter()
            .find(|a| a.mechanism() == mechanism)
    }

    /// Start a new authentication session for a mechanism name.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::UnsupportedMechanism`] if the name is unknown, not a
    /// SASL mechanism, or not enabled.
    pub fn start_session(
        &self,
        mechanism: &str,
        db: &str,
    ) -> AuthResult<(SaslSession, &MechanismAuthenticator)> {
        let parsed: Mechanism = mechanism.parse()?;
        let authenticator = self
            .get_authenticator(parsed)
            .ok_or_else(|| AuthError::UnsupportedMechanism(mechanism.to_string()))?;

        Ok((SaslSession::new(parsed, db), authenticator))
    }
}
