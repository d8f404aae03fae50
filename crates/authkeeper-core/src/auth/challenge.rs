//! Nonce challenge-response authentication.
//!
//! The default handshake is two commands on one connection:
//!
//! 1. `getnonce` returns a fresh nonce and remembers it on the connection.
//! 2. `authenticate {user, nonce, key}` where
//!    `key = hex(HMAC-SHA-256(passwordDigest, nonce || user))`.
//!
//! The nonce is consumed by the first `authenticate`, whatever its outcome.

use std::sync::Arc;

use hmac::{Hmac, Mac};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::Sha256;
use tracing::{debug, warn};

use crate::auth::principal::UserName;
use crate::error::{AuthError, AuthResult};
use crate::store::credentials::{constant_time_eq, password_digest, CredentialStore};

/// Generate a nonce: 64 random bits as 16 lowercase hex characters.
#[must_use]
pub fn generate_nonce() -> String {
    format!("{:016x}", OsRng.next_u64())
}

/// Compute the key for a stored password digest.
#[must_use]
pub fn compute_key(password_digest: &str, nonce: &str, user: &str) -> String {
    let mut mac = Hmac::<Sha256>::new_from_slice(password_digest.as_bytes())
        .expect("HMAC can take key of any size");
    mac.update(nonce.as_bytes());
    mac.update(user.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

/// Compute the key a client sends, starting from the cleartext password.
#[must_use]
pub fn client_key(user: &str, password: &str, nonce: &str) -> String {
    compute_key(&password_digest(user, password), nonce, user)
}

/// Fields of an `authenticate` request for the default mechanism.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChallengeRequest {
    pub user: Option<String>,
    pub nonce: Option<String>,
    pub key: Option<String>,
}

/// Verifies challenge-response proofs against the credential store.
#[derive(Debug)]
pub struct ChallengeResponseAuthenticator {
    credential_store: Arc<dyn CredentialStore>,
}

impl ChallengeResponseAuthenticator {
    #[must_use]
    pub fn new(credential_store: Arc<dyn CredentialStore>) -> Self {
        Self { credential_store }
    }

    /// Check a request against the nonce that was pending on the connection.
    ///
    /// `pending` must already have been taken off the connection.
    ///
    /// # Errors
    ///
    /// - [`AuthError::NoPendingNonce`] if no nonce was pending
    /// - [`AuthError::MissingNonce`] if the request has no `nonce`
    /// - [`AuthError::InvalidCredentials`] for anything else that does not verify
    pub fn authenticate(
        &self,
        pending: Option<&str>,
        request: &ChallengeRequest,
        db: &str,
    ) -> AuthResult<UserName> {
        let pending = pending.ok_or(AuthError::NoPendingNonce)?;
        let nonce = request.nonce.as_deref().ok_or(AuthError::MissingNonce)?;

        let (Some(user), Some(key)) = (request.user.as_deref(), request.key.as_deref()) else {
            debug!("authenticate: missing user or key");
            return Err(AuthError::InvalidCredentials);
        };
        if user.is_empty() || key.is_empty() {
            debug!("authenticate: empty user or key");
            return Err(AuthError::InvalidCredentials);
        }

        if !constant_time_eq(nonce.as_bytes(), pending.as_bytes()) {
            warn!(user = %user, db = %db, "authenticate: nonce mismatch");
            return Err(AuthError::InvalidCredentials);
        }

        let name = UserName::new(user, db);
        let Some(credentials) = self.credential_store.get_credentials(&name) else {
            warn!(user = %name, "authenticate: unknown user");
            return Err(AuthError::InvalidCredentials);
        };

        let expected = compute_key(&credentials.password_digest, nonce, user);
        if !constant_time_eq(expected.as_bytes(), key.to_ascii_lowercase().as_bytes()) {
            warn!(user = %name, "authenticate: key mismatch");
            return Err(AuthError::InvalidCredentials);
        }

        debug!(user = %name, "authenticate: success");
        Ok(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::sasl::scram::MIN_ITERATIONS;
    use crate::store::credentials::UserCredentials;
    use dashmap::DashMap;

    #[derive(Debug, Default)]
    struct MapStore(DashMap<UserName, UserCredentials>);

    impl CredentialStore for MapStore {
        fn get_credentials(&self, user: &UserName) -> Option<UserCredentials> {
            self.0.get(user).map(|c| c.clone())
        }
    }

    fn authenticator() -> ChallengeResponseAuthenticator {
        let store = MapStore::default();
        store.0.insert(
            UserName::new("spencer", "test"),
            UserCredentials::derive("spencer", "password", MIN_ITERATIONS),
        );
        ChallengeResponseAuthenticator::new(Arc::new(store))
    }

    fn request(user: &str, nonce: &str, key: &str) -> ChallengeRequest {
        ChallengeRequest {
            user: Some(user.into()),
            nonce: Some(nonce.into()),
            key: Some(key.into()),
        }
    }

    #[test]
    fn test_nonce_format() {
        let a = generate_nonce();
        let b = generate_nonce();
        assert_eq!(a.len(), 16);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a, b);
    }

    #[test]
    fn test_key_depends_on_every_input() {
        let base = client_key("spencer", "password", "abc");
        assert_eq!(base.len(), 64);
        assert_ne!(base, client_key("spencer", "password2", "abc"));
        assert_ne!(base, client_key("spencer", "password", "abd"));
        assert_ne!(base, client_key("spence", "password", "abc"));
    }

    #[test]
    fn test_success() {
        let auth = authenticator();
        let nonce = generate_nonce();
        let key = client_key("spencer", "password", &nonce);

        let name = auth
            .authenticate(Some(&nonce), &request("spencer", &nonce, &key), "test")
            .unwrap();
        assert_eq!(name, UserName::new("spencer", "test"));
    }

    #[test]
    fn test_sequencing_errors_come_first() {
        let auth = authenticator();
        let nonce = generate_nonce();
        let key = client_key("spencer", "password", &nonce);

        assert_eq!(
            auth.authenticate(None, &request("spencer", &nonce, &key), "test"),
            Err(AuthError::NoPendingNonce)
        );

        let no_nonce = ChallengeRequest {
            nonce: None,
            ..request("spencer", &nonce, &key)
        };
        assert_eq!(
            auth.authenticate(Some(&nonce), &no_nonce, "test"),
            Err(AuthError::MissingNonce)
        );
    }

    #[test]
    fn test_failures_are_indistinguishable() {
        let auth = authenticator();
        let nonce = generate_nonce();
        let good = client_key("spencer", "password", &nonce);
        let bad = client_key("spencer", "password2", &nonce);

        let cases = [
            request("spencer", &nonce, &bad),
            request("nobody", &nonce, &client_key("nobody", "password", &nonce)),
            request("spencer", "0000000000000000", &good),
            request("", &nonce, &good),
            request("spencer", &nonce, ""),
            ChallengeRequest {
                user: None,
                ..request("spencer", &nonce, &good)
            },
        ];
        for case in cases {
            assert_eq!(
                auth.authenticate(Some(&nonce), &case, "test"),
                Err(AuthError::InvalidCredentials)
            );
        }
    }

    #[test]
    fn test_wrong_database() {
        let auth = authenticator();
        let nonce = generate_nonce();
        let key = client_key("spencer", "password", &nonce);
        assert_eq!(
            auth.authenticate(Some(&nonce), &request("spencer", &nonce, &key), "admin"),
            Err(AuthError::InvalidCredentials)
        );
    }
}
