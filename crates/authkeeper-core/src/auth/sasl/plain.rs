//! SASL/PLAIN authentication implementation.
//!
//! SASL/PLAIN transmits credentials as cleartext (should only be used over TLS).
//! The authentication message format is: `[authzid]\0username\0password`

use std::sync::Arc;

use tracing::{debug, warn};

use crate::auth::mechanism::Mechanism;
use crate::auth::principal::UserName;
use crate::error::AuthError;
use crate::store::credentials::CredentialStore;

use super::{SaslAuthenticator, SaslSession, SaslStepResult};

/// Build a PLAIN client message.
#[must_use]
pub fn plain_message(user: &str, password: &str) -> Vec<u8> {
    format!("\0{user}\0{password}").into_bytes()
}

/// SASL/PLAIN authenticator.
#[derive(Debug)]
pub struct PlainAuthenticator {
    credential_store: Arc<dyn CredentialStore>,
}

impl PlainAuthenticator {
    /// Create a new PLAIN authenticator.
    #[must_use]
    pub fn new(credential_store: Arc<dyn CredentialStore>) -> Self {
        Self { credential_store }
    }
}

impl SaslAuthenticator for PlainAuthenticator {
    fn mechanism(&self) -> Mechanism {
        Mechanism::Plain
    }

    fn authenticate_step(
        &self,
        client_message: &[u8],
        session: &mut SaslSession,
    ) -> SaslStepResult {
        session.step_count += 1;

        // The authzid, if present, is ignored.
        let parts: Vec<&[u8]> = client_message.split(|&b| b == 0).collect();
        if parts.len() != 3 {
            warn!(
                "Invalid PLAIN message format: expected 3 parts, got {}",
                parts.len()
            );
            return SaslStepResult::Failed(AuthError::InvalidCredentials);
        }

        let username = String::from_utf8_lossy(parts[1]).to_string();
        let password = String::from_utf8_lossy(parts[2]).to_string();
        if username.is_empty() {
            warn!("PLAIN authentication failed: empty username");
            return SaslStepResult::Failed(AuthError::InvalidCredentials);
        }

        let name = UserName::new(username, session.db.clone());
        debug!(user = %name, "PLAIN authentication attempt");

        if self.credential_store.validate(&name, &password) {
            debug!(user = %name, "PLAIN authentication successful");
            session.authenticated_user = Some(name);
            SaslStepResult::Complete(Vec::new())
        } else {
            warn!(user = %name, "PLAIN authentication failed: invalid credentials");
            SaslStepResult::Failed(AuthError::InvalidCredentials)
        }
    }

    fn is_complete(&self, session: &SaslSession) -> bool {
        session.authenticated_user.is_some()
    }
}
