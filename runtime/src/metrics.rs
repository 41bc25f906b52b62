//! Reservation metrics.
//!
//! Components record through the `metrics` facade, so nothing is collected until
//! a recorder is installed. [`PrometheusMetrics`] installs the Prometheus recorder
//! and renders a text snapshot; serving it over HTTP is left to the host
//! application.
//!
//! # Example
//!
//! ```rust,no_run
//! use seatguard_runtime::metrics::PrometheusMetrics;
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let metrics = PrometheusMetrics::install()?;
//! // ... run reservations ...
//! println!("{}", metrics.render());
//! # Ok(())
//! # }
//! ```

use metrics::{describe_counter, describe_histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::time::Duration;
use thiserror::Error;

/// Reservation outcomes, labelled `outcome`.
pub const RESERVATIONS_TOTAL: &str = "seatguard.reservations.total";
/// End-to-end latency of one orchestrator call.
pub const RESERVATION_DURATION: &str = "seatguard.reservations.duration_seconds";
/// Conflict-class ledger errors seen by the executor.
pub const EXECUTOR_CONFLICTS: &str = "seatguard.executor.conflicts_total";
/// Backoff retries taken by the executor.
pub const EXECUTOR_RETRIES: &str = "seatguard.executor.retries_total";
/// Leases found expired at renew or release, labelled `kind`.
pub const LEASES_LOST: &str = "seatguard.leases.lost_total";
/// Mutations the ledger refused for breaking `0 <= available <= capacity`.
pub const INVARIANT_VIOLATIONS: &str = "seatguard.invariant_violations_total";

/// Errors from metrics setup.
#[derive(Error, Debug)]
pub enum MetricsError {
    /// Failed to build the exporter
    #[error("Failed to build metrics exporter: {0}")]
    Build(String),
    /// A different recorder is already installed
    #[error("Failed to install metrics recorder: {0}")]
    Install(String),
}

/// Register descriptions for every reservation metric.
///
/// Called by [`PrometheusMetrics::install`]; call it yourself when installing a
/// different recorder.
pub fn describe_metrics() {
    describe_counter!(RESERVATIONS_TOTAL, "Reservation attempts by outcome");
    describe_histogram!(
        RESERVATION_DURATION,
        "Time from submission to settled outcome"
    );
    describe_counter!(
        EXECUTOR_CONFLICTS,
        "Version conflicts, serialization failures and deadlocks seen by the executor"
    );
    describe_counter!(EXECUTOR_RETRIES, "Conflict retries after backoff");
    describe_counter!(
        LEASES_LOST,
        "Leases that expired before their holder renewed or released them"
    );
    describe_counter!(
        INVARIANT_VIOLATIONS,
        "Mutations refused for breaking the capacity invariant"
    );
}

/// Installed Prometheus recorder.
#[derive(Clone)]
pub struct PrometheusMetrics {
    handle: PrometheusHandle,
}

impl std::fmt::Debug for PrometheusMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrometheusMetrics").finish_non_exhaustive()
    }
}

impl PrometheusMetrics {
    /// Install the Prometheus recorder process-wide.
    ///
    /// # Errors
    ///
    /// Fails if the exporter cannot be built or a recorder is already installed.
    pub fn install() -> Result<Self, MetricsError> {
        describe_metrics();

        let handle = PrometheusBuilder::new()
            .set_buckets_for_metric(
                Matcher::Suffix("duration_seconds".to_string()),
                &[
                    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0,
                ],
            )
            .map_err(|e| MetricsError::Build(e.to_string()))?
            .install_recorder()
            .map_err(|e| MetricsError::Install(e.to_string()))?;

        tracing::info!("Prometheus metrics recorder installed");
        Ok(Self { handle })
    }

    /// Render every metric in the Prometheus text format.
    #[must_use]
    pub fn render(&self) -> String {
        self.handle.render()
    }
}

/// Record one settled reservation.
pub fn record_outcome(label: &'static str, elapsed: Duration) {
    metrics::counter!(RESERVATIONS_TOTAL, "outcome" => label).increment(1);
    metrics::histogram!(RESERVATION_DURATION).record(elapsed.as_secs_f64());
}
