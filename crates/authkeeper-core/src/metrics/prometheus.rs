//! Prometheus metrics for authkeeper.
//!
//! Provides counters and histograms for monitoring command traffic and
//! authentication health.

use prometheus::{
    Counter, CounterVec, HistogramOpts, HistogramVec, IntGauge, Opts, Registry, TextEncoder,
};

/// Metrics collection.
///
/// Contains all metrics exposed by the server for monitoring.
pub struct AuthMetrics {
    /// The Prometheus registry.
    pub registry: Registry,

    /// Total commands by name.
    pub commands_total: CounterVec,

    /// Command errors by name and error kind.
    pub command_errors: CounterVec,

    /// Command latency histogram by name.
    pub command_duration_seconds: HistogramVec,

    /// Authentication attempts by mechanism and outcome.
    pub auth_attempts: CounterVec,

    /// Number of stored users.
    pub users: IntGauge,

    /// Total entries applied by restores.
    pub restored_entries: Counter,
}

impl std::fmt::Debug for AuthMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthMetrics").finish_non_exhaustive()
    }
}

impl AuthMetrics {
    /// Create a new metrics collection.
    ///
    /// # Panics
    ///
    /// Panics if metric registration fails (should not happen with unique names).
    #[must_use]
    pub fn new() -> Self {
        let registry = Registry::new();

        let commands_total = CounterVec::new(
            Opts::new(
                "authkeeper_commands_total",
                "Total number of commands processed by name",
            ),
            &["command"],
        )
        .expect("metric creation should succeed");

        let command_errors = CounterVec::new(
            Opts::new(
                "authkeeper_command_errors_total",
                "Total number of command errors by name and error kind",
            ),
            &["command", "kind"],
        )
        .expect("metric creation should succeed");

        let command_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "authkeeper_command_duration_seconds",
                "Command latency in seconds",
            )
            .buckets(vec![
                0.0001, 0.0005, 0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0,
            ]),
            &["command"],
        )
        .expect("metric creation should succeed");

        let auth_attempts = CounterVec::new(
            Opts::new(
                "authkeeper_auth_attempts_total",
                "Authentication attempts by mechanism and outcome",
            ),
            &["mechanism", "outcome"],
        )
        .expect("metric creation should succeed");

        let users = IntGauge::new("authkeeper_users", "Current number of stored users")
            .expect("metric creation should succeed");

        let restored_entries = Counter::new(
            "authkeeper_restored_entries_total",
            "Total number of snapshot entries applied by restores",
        )
        .expect("metric creation should succeed");

        // Register all metrics
        registry
            .register(Box::new(commands_total.clone()))
            .expect("metric registration should succeed");
        registry
            .register(Box::new(command_errors.clone()))
            .expect("metric registration should succeed");
        registry
            .register(Box::new(command_duration_seconds.clone()))
            .expect("metric registration should succeed");
        registry
            .register(Box::new(auth_attempts.clone()))
            .expect("metric registration should succeed");
        registry
            .register(Box::new(users.clone()))
            .expect("metric registration should succeed");
        registry
            .register(Box::new(restored_entries.clone()))
            .expect("metric registration should succeed");

        Self {
            registry,
            commands_total,
            command_errors,
            command_duration_seconds,
            auth_attempts,
            users,
            restored_entries,
        }
    }

    /// Record a command being processed.
    pub fn record_command(&self, command: &str) {
        self.commands_total.with_label_values(&[command]).inc();
    }

    /// Record a command error.
    pub fn record_error(&self, command: &str, kind: &str) {
        self.command_errors
            .with_label_values(&[command, kind])
            .inc();
    }

    /// Record command duration.
    pub fn record_duration(&self, command: &str, duration_seconds: f64) {
        self.command_duration_seconds
            .with_label_values(&[command])
            .observe(duration_seconds);
    }

    /// Record the outcome of an authentication attempt.
    pub fn record_auth(&self, mechanism: &str, success: bool) {
        let outcome = if success { "success" } else { "failure" };
        self.auth_attempts
            .with_label_values(&[mechanism, outcome])
            .inc();
    }

    /// Set the number of stored users.
    pub fn set_users(&self, count: usize) {
        self.users.set(i64::try_from(count).unwrap_or(i64::MAX));
    }

    /// Record entries applied by a restore.
    pub fn record_restored(&self, entries: usize) {
        self.restored_entries.inc_by(entries as f64);
    }

    /// Encode metrics in Prometheus text format.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding fails.
    pub fn encode(&self) -> Result<String, prometheus::Error> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = String::new();
        encoder.encode_utf8(&metric_families, &mut buffer)?;
        Ok(buffer)
    }
}

impl Default for AuthMetrics {
    fn default() -> Self {
        Self::new()
    }
}
