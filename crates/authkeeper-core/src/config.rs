//! Configuration types for authkeeper.
//!
//! Configuration is loaded from YAML files and validated before use.
//!
//! ```yaml
//! security:
//!   authorization: true
//!   enabled_mechanisms: [CHALLENGE-RESPONSE, PLAIN, SCRAM-SHA-256]
//!   scram_iterations: 10000
//!   credentials:
//!     users:
//!       - user: admin
//!         db: admin
//!         password: "${AUTHKEEPER_ADMIN_PASSWORD}"
//!         roles: [root]
//! storage:
//!   data_dir: /var/lib/authkeeper
//! logging:
//!   level: info
//!   json: true
//! ```

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::auth::mechanism::Mechanism;
use crate::auth::sasl::scram::MIN_ITERATIONS;
use crate::error::{ConfigError, ConfigResult};

/// Root configuration.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ServerConfig {
    /// Authentication and authorization settings.
    #[serde(default)]
    pub security: SecurityConfig,

    /// Where state is persisted between runs.
    #[serde(default)]
    pub storage: StorageConfig,

    /// Prometheus metrics configuration.
    #[serde(default)]
    pub metrics: MetricsConfig,

    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Authentication and authorization settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SecurityConfig {
    /// Enforce privileges on administrative commands.
    ///
    /// When false every command is allowed, as if run by `root`.
    #[serde(default)]
    pub authorization: bool,

    /// Mechanisms clients may authenticate with.
    #[serde(default = "default_enabled_mechanisms")]
    pub enabled_mechanisms: Vec<Mechanism>,

    /// PBKDF2 iterations used when deriving SCRAM credentials.
    #[serde(default = "default_scram_iterations")]
    pub scram_iterations: u32,

    /// How long an administrative write waits for the update lock.
    #[serde(default = "default_update_lock_timeout_ms")]
    pub update_lock_timeout_ms: u64,

    /// Users created at startup if they do not exist yet.
    #[serde(default)]
    pub credentials: Option<CredentialConfig>,
}

/// Source of bootstrap users.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(untagged)]
pub enum CredentialConfig {
    /// Users listed inline.
    Inline { users: Vec<BootstrapUser> },
    /// Users read from a `user@db:roles:password` file.
    File { file: PathBuf },
}

/// A user created at startup.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct BootstrapUser {
    pub user: String,

    #[serde(default = "default_bootstrap_db")]
    pub db: String,

    /// Password, supports environment variable expansion: "${ADMIN_PASSWORD}"
    pub password: String,

    /// Role names in `db`.
    #[serde(default)]
    pub roles: Vec<String>,
}

impl BootstrapUser {
    /// Get the password with environment variables expanded.
    #[must_use]
    pub fn password(&self) -> String {
        expand_env_vars(&self.password)
    }
}

/// Expand environment variables in a string.
///
/// Replaces `${VAR_NAME}` with the value of the environment variable `VAR_NAME`.
/// If the variable is not set, replaces with an empty string.
fn expand_env_vars(s: &str) -> String {
    let re = Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("valid regex");
    re.replace_all(s, |caps: &regex::Captures| {
        std::env::var(&caps[1]).unwrap_or_default()
    })
    .to_string()
}

/// Persistence configuration.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct StorageConfig {
    /// Directory holding one snapshot per database. `None` keeps state in memory only.
    #[serde(default)]
    pub data_dir: Option<PathBuf>,
}

/// Prometheus metrics configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MetricsConfig {
    /// Whether to collect metrics.
    #[serde(default = "default_metrics_enabled")]
    pub enabled: bool,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error.
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output logs in JSON format (for production).
    #[serde(default)]
    pub json: bool,
}

// Default value functions

fn default_enabled_mechanisms() -> Vec<Mechanism> {
    Mechanism::ALL.to_vec()
}

fn default_scram_iterations() -> u32 {
    MIN_ITERATIONS
}

fn default_update_lock_timeout_ms() -> u64 {
    1_000
}

fn default_bootstrap_db() -> String {
    "admin".to_string()
}

fn default_metrics_enabled() -> bool {
    true
}

fn default_log_level() -> String {
    "info".to_string()
}

// Default implementations

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            authorization: false,
            enabled_mechanisms: default_enabled_mechanisms(),
            scram_iterations: default_scram_iterations(),
            update_lock_timeout_ms: default_update_lock_timeout_ms(),
            credentials: None,
        }
    }
}

impl SecurityConfig {
    /// Update lock timeout as a `Duration`.
    #[must_use]
    pub fn update_lock_timeout(&self) -> Duration {
        Duration::from_millis(self.update_lock_timeout_ms)
    }

    /// Check whether a mechanism is enabled.
    #[must_use]
    pub fn is_enabled(&self, mechanism: Mechanism) -> bool {
        self.enabled_mechanisms.contains(&mechanism)
    }

    /// Validate the security configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - `scram_iterations` is below 4096
    /// - no mechanism is enabled
    pub fn validate(&self) -> ConfigResult<()> {
        if self.scram_iterations < MIN_ITERATIONS {
            return Err(ConfigError::IterationsTooLow(self.scram_iterations));
        }

        if self.enabled_mechanisms.is_empty() {
            return Err(ConfigError::NoMechanisms);
        }

        Ok(())
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: default_metrics_enabled(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

// Configuration loading and validation

impl ServerConfig {
    /// Load configuration from a YAML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed, or if
    /// validation fails.
    pub fn from_file<P: AsRef<Path>>(path: P) -> ConfigResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::IoError {
            path: path.display().to_string(),
            source: e,
        })?;

        let config: Self = serde_yaml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a YAML string.
    ///
    /// # Errors
    ///
    /// Returns an error if parsing or validation fails.
    pub fn from_str(content: &str) -> ConfigResult<Self> {
        let config: Self = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if any validation check fails.
    pub fn validate(&self) -> ConfigResult<()> {
        self.security.validate()
    }
}
