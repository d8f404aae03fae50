//! Metrics collection for authkeeper.
//!
//! Provides Prometheus-compatible metrics for command rates, authentication
//! outcomes and restore progress.

pub mod prometheus;

pub use prometheus::AuthMetrics;
