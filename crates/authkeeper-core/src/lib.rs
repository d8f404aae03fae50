//! Authkeeper Core Library
//!
//! Client authentication, user and role management, and dump/restore of
//! principal metadata for a document database server.
//!
//! # Architecture
//!
//! The library is organized into several modules:
//!
//! - [`config`] - Configuration loading and validation
//! - [`error`] - Domain-specific error types and wire codes
//! - [`auth`] - Nonce challenge-response and SASL (`PLAIN`, `SCRAM-SHA-*`)
//! - [`authz`] - Privileges, built-in and user-defined roles, per-connection sessions
//! - [`store`] - User records, derived credentials and index definitions
//! - [`commands`] - Administrative command dispatch
//! - [`dump`] - Per-database snapshots with checksummed manifests
//! - [`server`] - Everything above wired together
//! - [`metrics`] - Prometheus metrics collection
//!
//! # Example
//!
//! ```rust,ignore
//! use authkeeper_core::config::ServerConfig;
//! use authkeeper_core::server::AuthServer;
//!
//! let server = AuthServer::open(ServerConfig::from_file("authkeeper.yaml")?)?;
//! let mut session = server.new_session();
//! let reply = server.run(&mut session, "admin", &serde_json::json!({"getnonce": 1}));
//! ```

#![forbid(unsafe_code)]

pub mod auth;
pub mod authz;
pub mod commands;
pub mod config;
pub mod dump;
pub mod error;
pub mod metrics;
pub mod server;
pub mod store;

/// Test utilities for integration testing.
pub mod testing;

// Re-export commonly used types
pub use auth::{Mechanism, RoleName, UserName};
pub use commands::{CommandDispatcher, CommandName, CommandReply};
pub use config::{SecurityConfig, ServerConfig};
pub use dump::{RestoreOptions, RestoreReport};
pub use error::{
    AuthError, CommandError, ConfigError, DumpError, ErrorKind, ServerError, UserManagementError,
};
pub use server::AuthServer;
