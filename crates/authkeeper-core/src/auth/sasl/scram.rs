//! SASL/SCRAM authentication implementation.
//!
//! SCRAM (Salted Challenge Response Authentication Mechanism) provides secure
//! password-based authentication without transmitting the password in cleartext.
//!
//! Supports:
//! - SCRAM-SHA-256 (RFC 7677)
//! - SCRAM-SHA-512 (RFC 7677 variant)
//!
//! The exchange is two client messages long:
//!
//! ```text
//! C: n,,n=user,r=<client-nonce>
//! S: r=<client-nonce><server-nonce>,s=<salt>,i=<iterations>
//! C: c=biws,r=<combined-nonce>,p=<proof>
//! S: v=<server-signature>
//! ```

use std::marker::PhantomData;
use std::sync::Arc;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use hmac::{Hmac, Mac};
use pbkdf2::pbkdf2_hmac;
use rand::Rng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256, Sha512};
use tracing::{debug, warn};

use crate::auth::mechanism::Mechanism;
use crate::auth::principal::UserName;
use crate::error::{AuthError, AuthResult};
use crate::store::credentials::{constant_time_eq, CredentialStore, UserCredentials};

use super::{SaslAuthenticator, SaslSession, SaslStepResult};

/// Minimum number of PBKDF2 iterations (per RFC 7677)
pub const MIN_ITERATIONS: u32 = 4096;

/// Salt length in bytes
pub const SALT_LENGTH: usize = 16;

/// Nonce length in characters
pub const NONCE_LENGTH: usize = 24;

/// SCRAM credentials stored for a user.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ScramCredentials {
    /// Random salt used for key derivation.
    #[serde(with = "crate::store::credentials::base64_bytes")]
    pub salt: Vec<u8>,
    /// Number of PBKDF2 iterations.
    pub iterations: u32,
    /// Stored key: H(ClientKey) where ClientKey = HMAC(SaltedPassword, "Client Key")
    #[serde(rename = "storedKey", with = "crate::store::credentials::base64_bytes")]
    pub stored_key: Vec<u8>,
    /// Server key: HMAC(SaltedPassword, "Server Key")
    #[serde(rename = "serverKey", with = "crate::store::credentials::base64_bytes")]
    pub server_key: Vec<u8>,
}

/// SCRAM session state for multi-step authentication.
#[derive(Debug, Default)]
pub struct ScramSessionState {
    /// GS2 header of the client's first message, echoed in the channel binding.
    pub gs2_header: String,
    /// Client's first message (without header).
    pub client_first_message_bare: String,
    /// Server's first message.
    pub server_first_message: String,
    /// Combined nonce (client + server).
    pub combined_nonce: String,
    /// Username being authenticated.
    pub username: String,
    /// Credentials the proof is checked against; `None` for an unknown user.
    pub credentials: Option<ScramCredentials>,
    /// Current step in the SCRAM exchange.
    pub step: u8,
}

/// Hash algorithm trait for SCRAM variants.
pub trait ScramHash: Send + Sync + std::fmt::Debug {
    /// The mechanism this hash implements.
    fn mechanism() -> Mechanism;
    /// Output length in bytes.
    fn output_len() -> usize;
    /// Compute HMAC.
    fn hmac(key: &[u8], data: &[u8]) -> Vec<u8>;
    /// Compute hash.
    fn hash(data: &[u8]) -> Vec<u8>;
    /// Derive key using PBKDF2.
    fn pbkdf2(password: &[u8], salt: &[u8], iterations: u32) -> Vec<u8>;
    /// Pick this variant's credentials out of a user's stored material.
    fn select(credentials: &UserCredentials) -> &ScramCredentials;
}

/// SHA-256 implementation for SCRAM.
#[derive(Debug)]
pub struct ScramSha256;

impl ScramHash for ScramSha256 {
    fn mechanism() -> Mechanism {
        Mechanism::ScramSha256
    }

    fn output_len() -> usize {
        32
    }

    fn hmac(key: &[u8], data: &[u8]) -> Vec<u8> {
        let mut mac = Hmac::<Sha256>::new_from_slice(key).expect("HMAC can take key of any size");
        mac.update(data);
        mac.finalize().into_bytes().to_vec()
    }

    fn hash(data: &[u8]) -> Vec<u8> {
        Sha256::digest(data).to_vec()
    }

    fn pbkdf2(password: &[u8], salt: &[u8], iterations: u32) -> Vec<u8> {
        let mut output = vec![0u8; 32];
        pbkdf2_hmac::<Sha256>(password, salt, iterations, &mut output);
        output
    }

    fn select(credentials: &UserCredentials) -> &ScramCredentials {
        &credentials.scram_sha256
    }
}

/// SHA-512 implementation for SCRAM.
#[derive(Debug)]
pub struct ScramSha512;

impl ScramHash for ScramSha512 {
    fn mechanism() -> Mechanism {
        Mechanism::ScramSha512
    }

    fn output_len() -> usize {
        64
    }

    fn hmac(key: &[u8], data: &[u8]) -> Vec<u8> {
        let mut mac = Hmac::<Sha512>::new_from_slice(key).expect("HMAC can take key of any size");
        mac.update(data);
        mac.finalize().into_bytes().to_vec()
    }

    fn hash(data: &[u8]) -> Vec<u8> {
        Sha512::digest(data).to_vec()
    }

    fn pbkdf2(password: &[u8], salt: &[u8], iterations: u32) -> Vec<u8> {
        let mut output = vec![0u8; 64];
        pbkdf2_hmac::<Sha512>(password, salt, iterations, &mut output);
        output
    }

    fn select(credentials: &UserCredentials) -> &ScramCredentials {
        &credentials.scram_sha512
    }
}

/// Generate SCRAM credentials from a plaintext password with a random salt.
pub fn generate_scram_credentials<H: ScramHash>(
    password: &str,
    iterations: u32,
) -> ScramCredentials {
    let mut rng = rand::thread_rng();
    let salt: Vec<u8> = (0..SALT_LENGTH).map(|_| rng.gen()).collect();

    generate_scram_credentials_with_salt::<H>(password, &salt, iterations)
}

/// Generate SCRAM credentials with specific salt and iterations.
pub fn generate_scram_credentials_with_salt<H: ScramHash>(
    password: &str,
    salt: &[u8],
    iterations: u32,
) -> ScramCredentials {
    let salted_password = H::pbkdf2(password.as_bytes(), salt, iterations);
    let client_key = H::hmac(&salted_password, b"Client Key");
    let stored_key = H::hash(&client_key);
    let server_key = H::hmac(&salted_password, b"Server Key");

    ScramCredentials {
        salt: salt.to_vec(),
        iterations,
        stored_key,
        server_key,
    }
}

fn generate_nonce() -> String {
    let mut rng = rand::thread_rng();
    (0..NONCE_LENGTH)
        .map(|_| {
            let idx = rng.gen_range(0..62u8);
            match idx {
                0..=9 => (b'0' + idx) as char,
                10..=35 => (b'a' + idx - 10) as char,
                _ => (b'A' + idx - 36) as char,
            }
        })
        .collect()
}

fn xor(a: &[u8], b: &[u8]) -> Vec<u8> {
    a.iter().zip(b).map(|(x, y)| x ^ y).collect()
}

/// Decode a `saslname` (RFC 5802 section 5.1): `=2C` is `,` and `=3D` is `=`.
fn decode_sasl_name(name: &str) -> AuthResult<String> {
    let mut out = String::with_capacity(name.len());
    let mut rest = name;
    while let Some(pos) = rest.find('=') {
        out.push_str(&rest[..pos]);
        let escape = rest.get(pos..pos + 3);
        match escape {
            Some("=2C") => out.push(','),
            Some("=3D") => out.push('='),
            _ => {
                return Err(AuthError::InvalidMessage(
                    "invalid escape in username".to_string(),
                ))
            }
        }
        rest = &rest[pos + 3..];
    }
    out.push_str(rest);
    Ok(out)
}

/// Encode a username as a `saslname`.
fn encode_sasl_name(name: &str) -> String {
    name.replace('=', "=3D").replace(',', "=2C")
}

// ============================================================================
// Message Parsing
// ============================================================================

/// Parsed client-first-message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientFirstMessage {
    /// `n,,`, `y,,` or the same with an authzid.
    pub gs2_header: String,
    /// Everything after the GS2 header.
    pub bare: String,
    /// Decoded username.
    pub username: String,
    pub client_nonce: String,
}

/// Parse client-first-message.
///
/// Format: `gs2-cbind-flag,[a=authzid],n=username,r=client-nonce`
pub fn parse_client_first_message(message: &str) -> AuthResult<ClientFirstMessage> {
    let mut parts = message.splitn(3, ',');
    let (Some(flag), Some(authzid), Some(bare)) = (parts.next(), parts.next(), parts.next()) else {
        return Err(AuthError::InvalidMessage(
            "Invalid GS2 header format".to_string(),
        ));
    };

    match flag {
        "n" | "y" => {}
        f if f.starts_with("p=") => {
            return Err(AuthError::InvalidMessage(
                "Channel binding not supported".to_string(),
            ))
        }
        _ => {
            return Err(AuthError::InvalidMessage(
                "Invalid GS2 header format".to_string(),
            ))
        }
    }
    if !authzid.is_empty() && !authzid.starts_with("a=") {
        return Err(AuthError::InvalidMessage(
            "Invalid authzid in GS2 header".to_string(),
        ));
    }

    let mut username = None;
    let mut client_nonce = None;

    for part in bare.split(',') {
        if let Some(value) = part.strip_prefix("n=") {
            username = Some(decode_sasl_name(value)?);
        } else if let Some(value) = part.strip_prefix("r=") {
            client_nonce = Some(value.to_string());
        }
    }

    let username = username
        .filter(|u| !u.is_empty())
        .ok_or_else(|| AuthError::InvalidMessage("Missing username".to_string()))?;
    let client_nonce = client_nonce
        .filter(|n| !n.is_empty())
        .ok_or_else(|| AuthError::InvalidMessage("Missing client nonce".to_string()))?;

    Ok(ClientFirstMessage {
        gs2_header: format!("{flag},{authzid},"),
        bare: bare.to_string(),
        username,
        client_nonce,
    })
}

/// Parsed client-final-message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientFinalMessage {
    /// `c=...,r=...` part, included in the auth message.
    pub without_proof: String,
    /// Decoded channel binding value.
    pub channel_binding: Vec<u8>,
    pub nonce: String,
    pub proof: Vec<u8>,
}

/// Parse client-final-message.
///
/// Format: `c=channel-binding,r=combined-nonce,p=client-proof`
pub fn parse_client_final_message(message: &str) -> AuthResult<ClientFinalMessage> {
    // The proof is always the last attribute
    let Some(idx) = message.rfind(",p=") else {
        return Err(AuthError::InvalidMessage(
            "Missing client proof".to_string(),
        ));
    };
    let proof = BASE64
        .decode(&message[idx + 3..])
        .map_err(|_| AuthError::InvalidMessage("Invalid proof encoding".to_string()))?;
    let without_proof = &message[..idx];

    let mut channel_binding = None;
    let mut nonce = None;
    for part in without_proof.split(',') {
        if let Some(value) = part.strip_prefix("c=") {
            channel_binding = Some(value);
        } else if let Some(value) = part.strip_prefix("r=") {
            nonce = Some(value.to_string());
        }
    }

    let channel_binding = channel_binding.ok_or_else(|| {
        AuthError::InvalidMessage("Missing channel binding in client-final".to_string())
    })?;
    let channel_binding = BASE64
        .decode(channel_binding)
        .map_err(|_| AuthError::InvalidMessage("Invalid channel binding encoding".to_string()))?;
    let nonce =
        nonce.ok_or_else(|| AuthError::InvalidMessage("Missing nonce in final".to_string()))?;

    Ok(ClientFinalMessage {
        without_proof: without_proof.to_string(),
        channel_binding,
        nonce,
        proof,
    })
}

/// Parse server-first-message into (combined nonce, salt, iterations).
fn parse_server_first_message(message: &str) -> AuthResult<(String, Vec<u8>, u32)> {
    let mut nonce = None;
    let mut salt = None;
    let mut iterations = None;

    for part in message.split(',') {
        if let Some(value) = part.strip_prefix("r=") {
            nonce = Some(value.to_string());
        } else if let Some(value) = part.strip_prefix("s=") {
            salt = BASE64.decode(value).ok();
        } else if let Some(value) = part.strip_prefix("i=") {
            iterations = value.parse().ok();
        }
    }

    match (nonce, salt, iterations) {
        (Some(n), Some(s), Some(i)) => Ok((n, s, i)),
        _ => Err(AuthError::InvalidMessage(
            "Malformed server-first-message".to_string(),
        )),
    }
}

// ============================================================================
// Server
// ============================================================================

/// SCRAM server authenticator.
///
/// Credentials come from the credential store, looked up in the database the
/// conversation was started on. An unknown user is answered with decoy
/// parameters so the exchange only fails at the proof.
pub struct ScramAuthenticator<H: ScramHash> {
    credential_store: Arc<dyn CredentialStore>,
    decoy_secret: [u8; 32],
    decoy_iterations: u32,
    _marker: PhantomData<H>,
}

impl<H: ScramHash> std::fmt::Debug for ScramAuthenticator<H> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScramAuthenticator")
            .field("mechanism", &H::mechanism())
            .field("credential_store", &self.credential_store)
            .finish_non_exhaustive()
    }
}

impl<H: ScramHash + 'static> ScramAuthenticator<H> {
    /// Create a new SCRAM authenticator.
    ///
    /// `iterations` is what decoy parameters for unknown users advertise; it
    /// should match the count used for real users.
    #[must_use]
    pub fn new(credential_store: Arc<dyn CredentialStore>, iterations: u32) -> Self {
        Self {
            credential_store,
            decoy_secret: rand::thread_rng().gen(),
            decoy_iterations: iterations,
            _marker: PhantomData,
        }
    }

    /// Stable fake salt for a username, so repeated lookups see the same value.
    fn decoy_salt(&self, username: &str) -> Vec<u8> {
        let mut salt = H::hmac(&self.decoy_secret, username.as_bytes());
        salt.truncate(SALT_LENGTH);
        salt
    }

    /// Generate server-first-message.
    ///
    /// Format: `r=combined-nonce,s=salt,i=iterations`
    fn generate_server_first_message(
        client_nonce: &str,
        salt: &[u8],
        iterations: u32,
    ) -> (String, String) {
        let combined_nonce = format!("{client_nonce}{}", generate_nonce());
        let message = format!("r={},s={},i={}", combined_nonce, BASE64.encode(salt), iterations);
        (message, combined_nonce)
    }

    /// Verify client proof and generate server signature.
    fn verify_and_sign(
        credentials: &ScramCredentials,
        auth_message: &str,
        client_proof: &[u8],
    ) -> AuthResult<Vec<u8>> {
        // ClientSignature = HMAC(StoredKey, AuthMessage)
        let client_signature = H::hmac(&credentials.stored_key, auth_message.as_bytes());

        // ClientKey = ClientProof XOR ClientSignature
        if client_proof.len() != client_signature.len() {
            return Err(AuthError::InvalidCredentials);
        }
        let client_key = xor(client_proof, &client_signature);

        // Verify: H(ClientKey) == StoredKey
        if !constant_time_eq(&H::hash(&client_key), &credentials.stored_key) {
            return Err(AuthError::InvalidCredentials);
        }

        // ServerSignature = HMAC(ServerKey, AuthMessage)
        Ok(H::hmac(&credentials.server_key, auth_message.as_bytes()))
    }

    fn client_first(&self, message: &str, session: &mut SaslSession) -> SaslStepResult {
        debug!(mechanism = %H::mechanism(), "SCRAM step 1: processing client-first-message");

        let first = match parse_client_first_message(message) {
            Ok(first) => first,
            Err(e) => return SaslStepResult::Failed(e),
        };

        let name = UserName::new(first.username.clone(), session.db.clone());
        let credentials = self
            .credential_store
            .get_credentials(&name)
            .map(|creds| H::select(&creds).clone());

        let (salt, iterations) = match &credentials {
            Some(creds) => (creds.salt.clone(), creds.iterations),
            None => {
                debug!(user = %name, "SCRAM: unknown user, answering with decoy parameters");
                (self.decoy_salt(&first.username), self.decoy_iterations)
            }
        };

        let (server_first, combined_nonce) =
            Self::generate_server_first_message(&first.client_nonce, &salt, iterations);

        session.scram_state = Some(ScramSessionState {
            gs2_header: first.gs2_header,
            client_first_message_bare: first.bare,
            server_first_message: server_first.clone(),
            combined_nonce,
            username: first.username,
            credentials,
            step: 1,
        });

        debug!("SCRAM step 1: sending server-first-message");
        SaslStepResult::Continue(server_first.into_bytes())
    }

    fn client_final(&self, message: &str, session: &mut SaslSession) -> SaslStepResult {
        debug!(mechanism = %H::mechanism(), "SCRAM step 2: processing client-final-message");

        let Some(state) = session.scram_state.as_mut() else {
            return SaslStepResult::Failed(AuthError::NoConversation);
        };
        state.step = 2;

        let last = match parse_client_final_message(message) {
            Ok(last) => last,
            Err(e) => return SaslStepResult::Failed(e),
        };

        if last.channel_binding != state.gs2_header.as_bytes() {
            warn!("SCRAM: channel binding mismatch");
            return SaslStepResult::Failed(AuthError::InvalidCredentials);
        }

        if last.nonce != state.combined_nonce {
            warn!("SCRAM: nonce mismatch");
            return SaslStepResult::Failed(AuthError::InvalidCredentials);
        }

        let Some(credentials) = state.credentials.as_ref() else {
            warn!(username = %state.username, db = %session.db, "SCRAM: authentication failed");
            return SaslStepResult::Failed(AuthError::InvalidCredentials);
        };

        let auth_message = format!(
            "{},{},{}",
            state.client_first_message_bare, state.server_first_message, last.without_proof
        );

        let server_signature = match Self::verify_and_sign(credentials, &auth_message, &last.proof)
        {
            Ok(sig) => sig,
            Err(e) => {
                warn!(username = %state.username, db = %session.db, "SCRAM: authentication failed");
                return SaslStepResult::Failed(e);
            }
        };

        let server_final = format!("v={}", BASE64.encode(&server_signature));
        let name = UserName::new(state.username.clone(), session.db.clone());
        debug!(user = %name, "SCRAM: authentication successful");
        session.authenticated_user = Some(name);

        SaslStepResult::Complete(server_final.into_bytes())
    }
}

impl<H: ScramHash + 'static> SaslAuthenticator for ScramAuthenticator<H> {
    fn mechanism(&self) -> Mechanism {
        H::mechanism()
    }

    fn authenticate_step(
        &self,
        client_message: &[u8],
        session: &mut SaslSession,
    ) -> SaslStepResult {
        let Ok(message) = std::str::from_utf8(client_message) else {
            return SaslStepResult::Failed(AuthError::InvalidMessage(
                "Invalid UTF-8 in SCRAM message".to_string(),
            ));
        };

        let step = session.scram_state.as_ref().map_or(0, |s| s.step);
        session.step_count += 1;

        match step {
            0 => self.client_first(message, session),
            1 => self.client_final(message, session),
            _ => SaslStepResult::Failed(AuthError::InvalidMessage(
                "Invalid SCRAM step".to_string(),
            )),
        }
    }

    fn is_complete(&self, session: &SaslSession) -> bool {
        session.authenticated_user.is_some()
    }
}

/// Type aliases for convenience
pub type ScramSha256Authenticator = ScramAuthenticator<ScramSha256>;
pub type ScramSha512Authenticator = ScramAuthenticator<ScramSha512>;

// ============================================================================
// Client
// ============================================================================

/// Client side of a SCRAM exchange.
///
/// Used by the CLI, tests and benchmarks to drive `saslStart`/`saslContinue`.
///
/// ```
/// use authkeeper_core::auth::sasl::scram::{ScramClient, ScramSha256};
///
/// let client = ScramClient::<ScramSha256>::new("alice", "secret");
/// assert!(client.client_first().starts_with("n,,n=alice,r="));
/// ```
#[derive(Debug)]
pub struct ScramClient<H: ScramHash> {
    username: String,
    password: String,
    client_nonce: String,
    expected_server_signature: Option<Vec<u8>>,
    _marker: PhantomData<H>,
}

impl<H: ScramHash> ScramClient<H> {
    #[must_use]
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self::with_nonce(username, password, generate_nonce())
    }

    /// Create a client with a fixed nonce.
    #[must_use]
    pub fn with_nonce(
        username: impl Into<String>,
        password: impl Into<String>,
        client_nonce: impl Into<String>,
    ) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
            client_nonce: client_nonce.into(),
            expected_server_signature: None,
            _marker: PhantomData,
        }
    }

    fn client_first_bare(&self) -> String {
        format!("n={},r={}", encode_sasl_name(&self.username), self.client_nonce)
    }

    /// The client-first-message.
    #[must_use]
    pub fn client_first(&self) -> String {
        format!("n,,{}", self.client_first_bare())
    }

    /// Compute the client-final-message for a server-first-message.
    ///
    /// # Errors
    ///
    /// Returns an error if the server message is malformed or its nonce does
    /// not extend ours.
    pub fn client_final(&mut self, server_first: &str) -> AuthResult<String> {
        let (combined_nonce, salt, iterations) = parse_server_first_message(server_first)?;
        if !combined_nonce.starts_with(&self.client_nonce) {
            return Err(AuthError::InvalidMessage(
                "server nonce does not extend client nonce".to_string(),
            ));
        }

        let salted_password = H::pbkdf2(self.password.as_bytes(), &salt, iterations);
        let client_key = H::hmac(&salted_password, b"Client Key");
        let stored_key = H::hash(&client_key);
        let server_key = H::hmac(&salted_password, b"Server Key");

        let without_proof = format!("c={},r={}", BASE64.encode("n,,"), combined_nonce);
        let auth_message = format!(
            "{},{},{}",
            self.client_first_bare(),
            server_first,
            without_proof
        );

        let client_signature = H::hmac(&stored_key, auth_message.as_bytes());
        let proof = xor(&client_key, &client_signature);
        self.expected_server_signature = Some(H::hmac(&server_key, auth_message.as_bytes()));

        Ok(format!("{},p={}", without_proof, BASE64.encode(proof)))
    }

    /// Check the server-final-message signature.
    ///
    /// # Errors
    ///
    /// Returns an error if the signature does not match.
    pub fn verify_server_final(&self, server_final: &str) -> AuthResult<()> {
        let signature = server_final
            .strip_prefix("v=")
            .and_then(|v| BASE64.decode(v).ok())
            .ok_or_else(|| AuthError::InvalidMessage("Malformed server-final".to_string()))?;

        match &self.expected_server_signature {
            Some(expected) if constant_time_eq(expected, &signature) => Ok(()),
            _ => Err(AuthError::InvalidCredentials),
        }
    }
}
