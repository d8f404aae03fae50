//! Derived credential material and bootstrap credential loading.
//!
//! A user's password is never kept. At creation time it is turned into:
//! - a password digest, `hex(SHA-256("{user}:authkeeper:{password}"))`, used by
//!   the challenge-response and PLAIN mechanisms
//! - SCRAM-SHA-256 and SCRAM-SHA-512 credentials (salt, iteration count,
//!   stored key, server key)

use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::auth::principal::UserName;
use crate::auth::sasl::scram::{
    generate_scram_credentials, ScramCredentials, ScramSha256, ScramSha512,
};
use crate::config::{BootstrapUser, CredentialConfig};
use crate::error::{ConfigError, ConfigResult};

/// Realm string mixed into every password digest.
pub const DIGEST_REALM: &str = "authkeeper";

/// Compute the one-way password digest for a user.
#[must_use]
pub fn password_digest(user: &str, password: &str) -> String {
    let material = format!("{user}:{DIGEST_REALM}:{password}");
    hex::encode(Sha256::digest(material.as_bytes()))
}

/// Byte comparison whose running time does not depend on where inputs differ.
pub(crate) fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// Secret material persisted for a user.
#[derive(Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct UserCredentials {
    /// Password digest, see [`password_digest`].
    #[serde(rename = "passwordDigest")]
    pub password_digest: String,
    #[serde(rename = "SCRAM-SHA-256")]
    pub scram_sha256: ScramCredentials,
    #[serde(rename = "SCRAM-SHA-512")]
    pub scram_sha512: ScramCredentials,
}

impl UserCredentials {
    /// Derive all credential material from a cleartext password.
    #[must_use]
    pub fn derive(user: &str, password: &str, iterations: u32) -> Self {
        Self {
            password_digest: password_digest(user, password),
            scram_sha256: generate_scram_credentials::<ScramSha256>(password, iterations),
            scram_sha512: generate_scram_credentials::<ScramSha512>(password, iterations),
        }
    }

    /// Check a cleartext password against the stored digest.
    #[must_use]
    pub fn verify_password(&self, user: &str, password: &str) -> bool {
        let candidate = password_digest(user, password);
        constant_time_eq(candidate.as_bytes(), self.password_digest.as_bytes())
    }
}

impl fmt::Debug for UserCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UserCredentials")
            .field("password_digest", &"<redacted>")
            .field("scram_iterations", &self.scram_sha256.iterations)
            .finish()
    }
}

/// Trait for credential lookup used by the authenticators.
pub trait CredentialStore: Send + Sync + fmt::Debug {
    /// Get credentials for a user.
    fn get_credentials(&self, user: &UserName) -> Option<UserCredentials>;

    /// Check if a cleartext password is valid for a user.
    fn validate(&self, user: &UserName, password: &str) -> bool {
        self.get_credentials(user)
            .map(|creds| creds.verify_password(&user.user, password))
            .unwrap_or(false)
    }
}

/// Serde adapter storing byte strings as standard base64.
pub(crate) mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&BASE64.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        BASE64.decode(encoded).map_err(serde::de::Error::custom)
    }
}

/// Load the users to create at startup.
///
/// # Errors
///
/// Returns an error if the credentials file cannot be read or parsed.
pub fn load_bootstrap_users(config: &CredentialConfig) -> ConfigResult<Vec<BootstrapUser>> {
    match config {
        CredentialConfig::Inline { users } => Ok(users.clone()),
        CredentialConfig::File { file } => load_credentials_file(file),
    }
}

/// Parse a bootstrap credentials file.
///
/// One user per line, in the format:
/// ```text
/// user@db:role1,role2:password
/// ```
/// The password is everything after the second colon and may itself contain
/// colons. Blank lines and lines starting with `#` are skipped.
fn load_credentials_file(path: &Path) -> ConfigResult<Vec<BootstrapUser>> {
    let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::CredentialsFile {
        path: path.display().to_string(),
        source: e,
    })?;

    let mut users = Vec::new();
    for (line_num, line) in contents.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let invalid = |reason: &str| ConfigError::InvalidCredentialLine {
            line: line_num + 1,
            reason: reason.to_string(),
        };

        let parts: Vec<&str> = line.splitn(3, ':').collect();
        if parts.len() != 3 {
            return Err(invalid("expected 'user@db:roles:password'"));
        }

        let (user, db) = parts[0]
            .split_once('@')
            .ok_or_else(|| invalid("user must be written as 'user@db'"))?;
        if user.is_empty() || db.is_empty() {
            return Err(invalid("empty user or database"));
        }

        let roles = parts[1]
            .split(',')
            .map(str::trim)
            .filter(|r| !r.is_empty())
            .map(str::to_string)
            .collect();

        users.push(BootstrapUser {
            user: user.to_string(),
            db: db.to_string(),
            password: parts[2].to_string(),
            roles,
        });
    }

    Ok(users)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    use crate::auth::sasl::scram::MIN_ITERATIONS;

    #[test]
    fn test_digest_differs_per_password() {
        let a = password_digest("spencer", "password");
        let b = password_digest("spencer", "password2");
        assert_ne!(a, b);
        assert_eq!(a.len(), 64);
        assert_eq!(a, password_digest("spencer", "password"));
    }

    #[test]
    fn test_digest_is_salted_by_user() {
        assert_ne!(
            password_digest("alice", "secret"),
            password_digest("bob", "secret")
        );
    }

    #[test]
    fn test_verify_password() {
        let creds = UserCredentials::derive("alice", "secret", MIN_ITERATIONS);
        assert!(creds.verify_password("alice", "secret"));
        assert!(!creds.verify_password("alice", "wrong"));
        assert!(!creds.verify_password("bob", "secret"));
    }

    #[test]
    fn test_debug_redacts_digest() {
        let creds = UserCredentials::derive("alice", "secret", MIN_ITERATIONS);
        let rendered = format!("{creds:?}");
        assert!(!rendered.contains(&creds.password_digest));
        assert!(rendered.contains("redacted"));
    }

    #[test]
    fn test_serialized_form_has_no_cleartext() {
        let creds = UserCredentials::derive("alice", "hunter2-cleartext", MIN_ITERATIONS);
        let json = serde_json::to_string(&creds).unwrap();
        assert!(!json.contains("hunter2-cleartext"));

        let back: UserCredentials = serde_json::from_str(&json).unwrap();
        assert_eq!(back, creds);
    }

    #[test]
    fn test_constant_time_eq() {
        assert!(constant_time_eq(b"abc", b"abc"));
        assert!(!constant_time_eq(b"abc", b"abd"));
        assert!(!constant_time_eq(b"abc", b"abcd"));
    }

    #[test]
    fn test_credentials_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "# Comment line").unwrap();
        writeln!(file, "admin@admin:root:password").unwrap();
        writeln!(file).unwrap();
        writeln!(file, "app@shop:readWrite, dbAdmin:pass:with:colons").unwrap();
        file.flush().unwrap();

        let users = load_bootstrap_users(&CredentialConfig::File {
            file: file.path().to_path_buf(),
        })
        .unwrap();

        assert_eq!(users.len(), 2);
        assert_eq!(users[0].user, "admin");
        assert_eq!(users[0].roles, vec!["root".to_string()]);
        assert_eq!(users[1].db, "shop");
        assert_eq!(users[1].roles, vec!["readWrite".to_string(), "dbAdmin".to_string()]);
        assert_eq!(users[1].password, "pass:with:colons");
    }

    #[test]
    fn test_credentials_file_invalid_format() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "missing_db:read:pw").unwrap();
        file.flush().unwrap();

        let result = load_bootstrap_users(&CredentialConfig::File {
            file: file.path().to_path_buf(),
        });
        assert!(matches!(
            result,
            Err(ConfigError::InvalidCredentialLine { line: 1, .. })
        ));
    }
}
