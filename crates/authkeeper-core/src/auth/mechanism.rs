//! The closed set of authentication mechanisms.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::AuthError;

/// Authentication mechanism selected by a client.
///
/// `ChallengeResponse` is the default `getnonce`/`authenticate` handshake; the
/// others are SASL mechanisms negotiated by name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub enum Mechanism {
    /// Nonce + keyed digest of the stored password digest.
    #[serde(rename = "CHALLENGE-RESPONSE")]
    ChallengeResponse,
    /// SASL/PLAIN - password delivered in the clear (use over TLS only).
    #[serde(rename = "PLAIN")]
    Plain,
    /// SASL/SCRAM-SHA-256 - salted challenge-response.
    #[serde(rename = "SCRAM-SHA-256")]
    ScramSha256,
    /// SASL/SCRAM-SHA-512 - salted challenge-response.
    #[serde(rename = "SCRAM-SHA-512")]
    ScramSha512,
}

impl Mechanism {
    /// Every mechanism, in preference order.
    pub const ALL: [Mechanism; 4] = [
        Self::ChallengeResponse,
        Self::Plain,
        Self::ScramSha256,
        Self::ScramSha512,
    ];

    /// Get the mechanism name as used in commands.
    #[must_use]
    pub fn mechanism_name(&self) -> &'static str {
        match self {
            Self::ChallengeResponse => "CHALLENGE-RESPONSE",
            Self::Plain => "PLAIN",
            Self::ScramSha256 => "SCRAM-SHA-256",
            Self::ScramSha512 => "SCRAM-SHA-512",
        }
    }

    /// Whether this mechanism runs over `saslStart`/`saslContinue`.
    #[must_use]
    pub fn is_sasl(&self) -> bool {
        !matches!(self, Self::ChallengeResponse)
    }
}

impl fmt::Display for Mechanism {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.mechanism_name())
    }
}

impl FromStr for Mechanism {
    type Err = AuthError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|m| m.mechanism_name().eq_ignore_ascii_case(s))
            .ok_or_else(|| AuthError::UnsupportedMechanism(s.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_case_insensitive() {
        assert_eq!("plain".parse::<Mechanism>().unwrap(), Mechanism::Plain);
        assert_eq!(
            "SCRAM-SHA-256".parse::<Mechanism>().unwrap(),
            Mechanism::ScramSha256
        );
        assert!(matches!(
            "GSSAPI".parse::<Mechanism>(),
            Err(AuthError::UnsupportedMechanism(_))
        ));
    }

    #[test]
    fn test_sasl_flag() {
        assert!(!Mechanism::ChallengeResponse.is_sasl());
        assert!(Mechanism::Plain.is_sasl());
        assert!(Mechanism::ScramSha512.is_sasl());
    }
}
