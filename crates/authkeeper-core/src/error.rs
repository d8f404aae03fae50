//! Domain error types for authkeeper.
//!
//! Uses `thiserror` for ergonomic error definitions with proper context.
//! Each subsystem has its own error enum; the command dispatcher folds them
//! into a [`CommandError`], which carries an [`ErrorKind`] and, for the two
//! wire-visible failures, a stable numeric code.

use thiserror::Error;

use crate::auth::principal::{RoleName, UserName};

/// Wire code for a command issued out of its required sequence.
pub const BAD_COMMAND_CODE: i32 = 17;

/// Wire code for a credential mismatch (bad secret or unknown user).
pub const AUTHENTICATION_FAILED_CODE: i32 = 18;

/// Errors related to configuration parsing and validation.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Failed to read configuration file.
    #[error("failed to read config file '{path}': {source}")]
    IoError {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// Failed to parse YAML configuration.
    #[error("failed to parse config: {0}")]
    ParseError(#[from] serde_yaml::Error),

    /// SCRAM iteration count below the RFC 7677 minimum.
    #[error("scram_iterations must be at least 4096, got {0}")]
    IterationsTooLow(u32),

    /// Neither challenge-response nor any SASL mechanism is enabled.
    #[error("no authentication mechanism enabled")]
    NoMechanisms,

    /// A bootstrap credential entry could not be parsed.
    #[error("invalid credentials entry at line {line}: {reason}")]
    InvalidCredentialLine { line: usize, reason: String },

    /// Failed to read the bootstrap credentials file.
    #[error("failed to read credentials file '{path}': {source}")]
    CredentialsFile {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Mechanism-level authentication failures.
///
/// These never reach a client verbatim: the dispatcher reports every
/// credential failure with the same message so callers cannot tell an
/// unknown user from a wrong secret.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    /// Credentials did not verify (wrong secret, unknown user, bad nonce).
    #[error("invalid credentials")]
    InvalidCredentials,

    /// The client message could not be parsed.
    #[error("invalid authentication message: {0}")]
    InvalidMessage(String),

    /// The requested mechanism is not enabled.
    #[error("unsupported mechanism: {0}")]
    UnsupportedMechanism(String),

    /// `authenticate` arrived without a `getnonce` in this connection.
    #[error("no pending nonce; getnonce must precede authenticate")]
    NoPendingNonce,

    /// `authenticate` arrived without the `nonce` field.
    #[error("authenticate requires a nonce field")]
    MissingNonce,

    /// `saslContinue` arrived without an active conversation, or for another one.
    #[error("no matching SASL conversation")]
    NoConversation,

    /// Nonce challenge-response has been switched off in configuration.
    #[error("challenge-response authentication is disabled")]
    ChallengeResponseDisabled,
}

/// Errors raised by the credential store and role registry.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum UserManagementError {
    /// A user with the same name already exists in the database.
    #[error("user {0} already exists")]
    DuplicateUser(UserName),

    /// The user does not exist.
    #[error("user {0} not found")]
    UserNotFound(UserName),

    /// A referenced role does not exist.
    #[error("role {0} does not exist")]
    UnknownRole(RoleName),

    /// A user-defined role with the same name already exists.
    #[error("role {0} already exists")]
    DuplicateRole(RoleName),

    /// Built-in roles cannot be created or dropped.
    #[error("role {0} is a built-in role")]
    BuiltinRole(RoleName),

    /// A request argument failed validation.
    #[error("{0}")]
    InvalidArgument(String),

    /// The administrative update lock could not be taken in time.
    #[error("could not lock auth data for {0}")]
    LockBusy(String),

    /// The request is not allowed in the current state.
    #[error("{0}")]
    Unauthorized(String),
}

/// A database name that cannot be stored or used as a snapshot directory.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("invalid database name '{name}': {reason}")]
pub struct InvalidDatabaseName {
    pub name: String,
    pub reason: &'static str,
}

/// Errors raised by the index collaborator.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IndexError {
    /// The index definition is not usable.
    #[error("invalid index definition: {0}")]
    InvalidDefinition(String),
}

/// Errors raised by dump and restore.
#[derive(Error, Debug)]
pub enum DumpError {
    /// Reading or writing a snapshot file failed.
    #[error("snapshot I/O error on '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// A snapshot file could not be encoded.
    #[error("failed to encode '{file}': {source}")]
    Encode {
        file: String,
        #[source]
        source: serde_json::Error,
    },

    /// A snapshot file could not be decoded.
    #[error("failed to decode '{file}': {source}")]
    Decode {
        file: String,
        #[source]
        source: serde_json::Error,
    },

    /// A data file does not match the checksum recorded in the manifest.
    #[error("snapshot checksum mismatch: {file}")]
    ChecksumMismatch { file: String },

    /// The manifest disagrees with the data it describes.
    #[error("invalid snapshot manifest: {0}")]
    InvalidManifest(String),

    /// The administrative update lock could not be taken in time.
    #[error("could not lock auth data for {0}")]
    LockBusy(String),

    #[error(transparent)]
    InvalidDatabase(#[from] InvalidDatabaseName),

    /// Restore was cancelled between entries.
    #[error("restore interrupted after {applied} entries")]
    Interrupted { applied: usize },

    /// Restore failed part way through.
    #[error("restore failed after {applied} entries: {reason}")]
    Partial { applied: usize, reason: String },
}

/// Errors raised while opening or persisting an [`AuthServer`](crate::server::AuthServer).
#[derive(Error, Debug)]
pub enum ServerError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Dump(#[from] DumpError),

    /// A bootstrap user could not be created.
    #[error("failed to bootstrap user {user}: {source}")]
    Bootstrap {
        user: UserName,
        #[source]
        source: UserManagementError,
    },

    /// The data directory could not be scanned.
    #[error("failed to read data directory '{path}': {source}")]
    DataDir {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Kind of a command failure as seen by clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    AuthenticationFailed,
    BadCommand,
    DuplicateUser,
    NotFound,
    UnknownRole,
    DuplicateRole,
    InvalidArgument,
    Unauthorized,
    LockBusy,
    Internal,
}

impl ErrorKind {
    /// Stable wire code, for the kinds that have one.
    #[must_use]
    pub const fn code(self) -> Option<i32> {
        match self {
            Self::AuthenticationFailed => Some(AUTHENTICATION_FAILED_CODE),
            Self::BadCommand => Some(BAD_COMMAND_CODE),
            _ => None,
        }
    }

    /// Name reported in the `codeName` reply field.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::AuthenticationFailed => "AuthenticationFailed",
            Self::BadCommand => "BadCommand",
            Self::DuplicateUser => "DuplicateUser",
            Self::NotFound => "NotFound",
            Self::UnknownRole => "UnknownRole",
            Self::DuplicateRole => "DuplicateRole",
            Self::InvalidArgument => "InvalidArgument",
            Self::Unauthorized => "Unauthorized",
            Self::LockBusy => "LockBusy",
            Self::Internal => "Internal",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Structured failure of a dispatched command.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{kind}: {message}")]
pub struct CommandError {
    pub kind: ErrorKind,
    pub message: String,
}

impl CommandError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// The single, cause-free authentication failure.
    #[must_use]
    pub fn authentication_failed() -> Self {
        Self::new(ErrorKind::AuthenticationFailed, "auth failed")
    }

    pub fn bad_command(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::BadCommand, message)
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidArgument, message)
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unauthorized, message)
    }

    /// Stable wire code, if this kind has one.
    #[must_use]
    pub fn code(&self) -> Option<i32> {
        self.kind.code()
    }
}

impl From<AuthError> for CommandError {
    fn from(err: AuthError) -> Self {
        match err {
            AuthError::InvalidCredentials
            | AuthError::InvalidMessage(_)
            | AuthError::ChallengeResponseDisabled => Self::authentication_failed(),
            AuthError::NoPendingNonce | AuthError::MissingNonce | AuthError::NoConversation => {
                Self::bad_command(err.to_string())
            }
            AuthError::UnsupportedMechanism(_) => Self::invalid_argument(err.to_string()),
        }
    }
}

impl From<UserManagementError> for CommandError {
    fn from(err: UserManagementError) -> Self {
        let kind = match &err {
            UserManagementError::DuplicateUser(_) => ErrorKind::DuplicateUser,
            UserManagementError::UserNotFound(_) => ErrorKind::NotFound,
            UserManagementError::UnknownRole(_) => ErrorKind::UnknownRole,
            UserManagementError::DuplicateRole(_) => ErrorKind::DuplicateRole,
            UserManagementError::BuiltinRole(_) | UserManagementError::InvalidArgument(_) => {
                ErrorKind::InvalidArgument
            }
            UserManagementError::LockBusy(_) => ErrorKind::LockBusy,
            UserManagementError::Unauthorized(_) => ErrorKind::Unauthorized,
        };
        Self::new(kind, err.to_string())
    }
}

impl From<InvalidDatabaseName> for CommandError {
    fn from(err: InvalidDatabaseName) -> Self {
        Self::invalid_argument(err.to_string())
    }
}

impl From<IndexError> for CommandError {
    fn from(err: IndexError) -> Self {
        Self::invalid_argument(err.to_string())
    }
}

/// Result type alias for configuration operations.
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

/// Result type alias for mechanism-level authentication.
pub type AuthResult<T> = std::result::Result<T, AuthError>;

/// Result type alias for user and role management.
pub type UserManagementResult<T> = std::result::Result<T, UserManagementError>;

/// Result type alias for dump and restore.
pub type DumpResult<T> = std::result::Result<T, DumpError>;

/// Result type alias for server lifecycle operations.
pub type ServerResult<T> = std::result::Result<T, ServerError>;

/// Result type alias for dispatched commands.
pub type CommandResult<T> = std::result::Result<T, CommandError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_codes() {
        assert_eq!(ErrorKind::BadCommand.code(), Some(17));
        assert_eq!(ErrorKind::AuthenticationFailed.code(), Some(18));
        assert_eq!(ErrorKind::NotFound.code(), None);
        assert_eq!(ErrorKind::UnknownRole.code(), None);
    }

    #[test]
    fn test_credential_failures_are_indistinguishable() {
        let bad_secret: CommandError = AuthError::InvalidCredentials.into();
        let bad_message: CommandError = AuthError::InvalidMessage("x".into()).into();
        assert_eq!(bad_secret, bad_message);
        assert_eq!(bad_secret.code(), Some(AUTHENTICATION_FAILED_CODE));
    }

    #[test]
    fn test_sequence_errors_map_to_bad_command() {
        let err: CommandError = AuthError::NoPendingNonce.into();
        assert_eq!(err.kind, ErrorKind::BadCommand);
        assert_eq!(err.code(), Some(BAD_COMMAND_CODE));

        let err: CommandError = AuthError::NoConversation.into();
        assert_eq!(err.code(), Some(BAD_COMMAND_CODE));
    }

    #[test]
    fn test_user_management_error_display() {
        let err = UserManagementError::UnknownRole(RoleName::new("fakeRole", "test"));
        assert!(err.to_string().contains("fakeRole@test"));

        let cmd: CommandError = err.into();
        assert_eq!(cmd.kind, ErrorKind::UnknownRole);
        assert_eq!(cmd.code(), None);
    }

    #[test]
    fn test_dump_error_display() {
        let err = DumpError::Partial {
            applied: 3,
            reason: "boom".into(),
        };
        assert!(err.to_string().contains('3'));
        assert!(err.to_string().contains("boom"));
    }
}
