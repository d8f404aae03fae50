//! Test utilities for authkeeper.
//!
//! - [`TestHarness`] - An auth server on a temporary data directory, with login helpers
//! - [`TestHarnessBuilder`] - Builder pattern for custom test configurations
//!
//! # Example
//!
//! ```rust
//! use authkeeper_core::testing::TestHarness;
//! use serde_json::json;
//!
//! let harness = TestHarness::new();
//! harness.create_user("admin", "root", "secret", &["root"]);
//!
//! let mut session = harness.session();
//! assert!(harness.login_challenge(&mut session, "admin", "root", "secret").is_ok());
//! harness.run_ok(&mut session, "test", json!({"usersInfo": 1}));
//! ```

pub mod harness;

pub use harness::{TestHarness, TestHarnessBuilder};
