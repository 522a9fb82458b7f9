//! Prometheus scrape endpoint.
//!
//! Installs the global `metrics` recorder backed by
//! `metrics-exporter-prometheus` and serves it over HTTP. Crates record
//! through the `metrics` macros and never see the exporter.
//!
//! # Example
//!
//! ```rust,no_run
//! use quicket_runtime::metrics::MetricsServer;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut server = MetricsServer::new("0.0.0.0:9090".parse()?);
//! server.start()?;
//! // curl http://localhost:9090/metrics
//! # Ok(())
//! # }
//! ```

use metrics::{describe_counter, describe_gauge};
use metrics_exporter_prometheus::{BuildError, Matcher, PrometheusBuilder};
use std::net::SocketAddr;
use thiserror::Error;

/// Histogram buckets, in seconds, for every `*_duration_seconds` metric.
///
/// Lock waits and snapshot writes land in the low milliseconds; simulated
/// settlements take seconds.
pub const DURATION_BUCKETS: &[f64] = &[
    0.001, 0.0025, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
];

/// Errors starting the exporter.
#[derive(Error, Debug)]
pub enum MetricsError {
    /// The bucket configuration was refused.
    #[error("Invalid histogram buckets: {0}")]
    Buckets(String),

    /// The listener or the global recorder could not be installed.
    #[error("Failed to install Prometheus exporter on {addr}: {reason}")]
    Install {
        /// Listener address.
        addr: SocketAddr,
        /// Exporter error.
        reason: String,
    },
}

/// Prometheus exporter bound to one address.
pub struct MetricsServer {
    addr: SocketAddr,
    started: bool,
}

impl MetricsServer {
    /// Exporter listening on `addr` once started.
    #[must_use]
    pub const fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            started: false,
        }
    }

    /// Describe the runtime metrics, install the recorder and start listening.
    ///
    /// Must be called within a Tokio runtime. Calling it again is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`MetricsError`] if the exporter cannot be configured or
    /// installed. A recorder installed by someone else is logged and
    /// tolerated.
    pub fn start(&mut self) -> Result<(), MetricsError> {
        if self.started {
            return Ok(());
        }

        let builder = PrometheusBuilder::new()
            .with_http_listener(self.addr)
            .set_buckets_for_metric(
                Matcher::Suffix("duration_seconds".to_string()),
                DURATION_BUCKETS,
            )
            .map_err(|e| MetricsError::Buckets(e.to_string()))?;

        match builder.install() {
            Ok(()) => {
                tracing::info!(addr = %self.addr, "Prometheus exporter listening");
            }
            Err(BuildError::FailedToSetGlobalRecorder(e)) => {
                tracing::warn!(error = %e, "Global metrics recorder already set, keeping it");
            }
            Err(e) => {
                return Err(MetricsError::Install {
                    addr: self.addr,
                    reason: e.to_string(),
                });
            }
        }

        describe_runtime_metrics();
        self.started = true;
        Ok(())
    }

    /// Listener address.
    #[must_use]
    pub const fn addr(&self) -> SocketAddr {
        self.addr
    }
}

fn describe_runtime_metrics() {
    describe_counter!(
        "quicket_worker_pool_jobs_total",
        "Worker pool jobs by pool and outcome (accepted, busy, completed, panicked, timed_out)"
    );
    describe_gauge!(
        "quicket_worker_pool_queue_depth",
        "Jobs waiting in a worker pool queue"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buckets_are_sorted() {
        assert!(DURATION_BUCKETS.windows(2).all(|w| w[0] < w[1]));
    }
}
