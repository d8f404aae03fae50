//! Client authentication.
//!
//! Two ways in:
//! - the default nonce challenge-response handshake (`getnonce`, then
//!   `authenticate`), see [`challenge`]
//! - SASL mechanisms negotiated by name (`PLAIN`, `SCRAM-SHA-256`,
//!   `SCRAM-SHA-512`) over `saslStart`/`saslContinue`, see [`sasl`]
//!
//! # Error codes
//!
//! Clients see exactly two authentication codes: 17 when a command arrives
//! out of sequence (no pending nonce, no active conversation), and 18 for
//! every credential failure. The cause of an 18 is only logged.
//!
//! # Example Configuration
//!
//! ```yaml
//! security:
//!   authorization: true
//!   enabled_mechanisms: [CHALLENGE-RESPONSE, SCRAM-SHA-256]
//!   credentials:
//!     users:
//!       - user: "admin"
//!         db: "admin"
//!         password: "${ADMIN_PASSWORD}"
//!         roles: [root]
//! ```

pub mod challenge;
pub mod mechanism;
pub mod principal;
pub mod sasl;
pub mod session;

pub use challenge::{
    client_key, compute_key, generate_nonce, ChallengeRequest, ChallengeResponseAuthenticator,
};
pub use mechanism::Mechanism;
pub use principal::{validate_database_name, AuthenticatedUser, RoleName, UserName};
pub use sasl::{
    MechanismAuthenticator, PlainAuthenticator, SaslAuthenticator, SaslServer, SaslSession,
    SaslStepResult, ScramClient, ScramHash, ScramSha256, ScramSha512,
};
pub use session::{ClientSession, HandshakeState};
