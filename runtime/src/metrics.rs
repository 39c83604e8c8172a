//! Prometheus metrics for the engine.
//!
//! Metrics are recorded through the `metrics` facade, so they are no-ops until
//! a recorder is installed. [`MetricsServer`] installs the Prometheus recorder
//! and serves it over HTTP.
//!
//! # Example
//!
//! ```rust,no_run
//! use failsafe_runtime::metrics::MetricsServer;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut server = MetricsServer::new("0.0.0.0:9090".parse()?);
//! server.start()?;
//! // Metrics available at http://localhost:9090/metrics
//! # Ok(())
//! # }
//! ```

use metrics::{describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;

// Re-export metrics macros for use in other modules
pub use metrics::{counter, gauge, histogram};

/// Errors from metrics operations.
#[derive(Error, Debug)]
pub enum MetricsError {
    /// Failed to build metrics exporter
    #[error("Failed to build metrics exporter: {0}")]
    Build(String),
    /// Failed to install metrics exporter
    #[error("Failed to install metrics exporter: {0}")]
    Install(String),
}

/// Prometheus metrics server.
pub struct MetricsServer {
    addr: SocketAddr,
    handle: Option<PrometheusHandle>,
}

impl MetricsServer {
    /// Create a new metrics server bound to `addr` once started.
    #[must_use]
    pub const fn new(addr: SocketAddr) -> Self {
        Self { addr, handle: None }
    }

    /// Install the recorder and spawn the HTTP exporter.
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns an error if the exporter cannot be built or a different
    /// recorder is already installed.
    pub fn start(&mut self) -> Result<(), MetricsError> {
        register_metrics();

        let (recorder, exporter) = PrometheusBuilder::new()
            .with_http_listener(self.addr)
            .set_buckets_for_metric(
                Matcher::Suffix("duration_seconds".to_string()),
                &[0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 30.0],
            )
            .map_err(|e| MetricsError::Build(e.to_string()))?
            .build()
            .map_err(|e| MetricsError::Build(e.to_string()))?;

        let handle = recorder.handle();
        metrics::set_global_recorder(recorder)
            .map_err(|e| MetricsError::Install(e.to_string()))?;

        let addr = self.addr;
        tokio::spawn(async move {
            // `ExporterError` implements neither `Debug` nor `Display`.
            if exporter.await.is_err() {
                tracing::error!(addr = %addr, "Metrics exporter stopped");
            }
        });

        self.handle = Some(handle);
        tracing::info!(addr = %self.addr, "Metrics server started - available at http://{}/metrics", self.addr);
        Ok(())
    }

    /// Get the metrics handle for rendering.
    #[must_use]
    pub const fn handle(&self) -> Option<&PrometheusHandle> {
        self.handle.as_ref()
    }

    /// Render current metrics in Prometheus format, `None` before `start`.
    #[must_use]
    pub fn render(&self) -> Option<String> {
        self.handle.as_ref().map(PrometheusHandle::render)
    }
}

/// Register all metric descriptions.
fn register_metrics() {
    describe_counter!(
        "failsafe_requests_created_total",
        "Requests registered by create_request or an unseen creation delivery"
    );
    describe_counter!(
        "failsafe_requests_correlated_total",
        "Requests whose gate opened"
    );
    describe_counter!(
        "failsafe_status_changes_applied_total",
        "Status changes applied directly"
    );
    describe_counter!(
        "failsafe_status_changes_deferred_total",
        "Status changes parked in the pending store"
    );
    describe_counter!(
        "failsafe_pending_events_replayed_total",
        "Pending events republished and removed"
    );
    describe_counter!(
        "failsafe_replay_publish_failures_total",
        "Replay publishes rejected by the transport"
    );
    describe_counter!(
        "failsafe_pending_events_undecodable_total",
        "Pending events that could not be decoded at replay time"
    );
    describe_counter!(
        "failsafe_pending_events_discarded_total",
        "Pending events removed by an operator"
    );
    describe_histogram!(
        "failsafe_replay_duration_seconds",
        "Time taken to drain one request's queue"
    );
    describe_gauge!(
        "failsafe_pending_events",
        "Pending events across all requests, sampled by the sweeper"
    );
    describe_counter!(
        "failsafe_inbound_messages_total",
        "Messages received by a consumer"
    );
    describe_counter!(
        "failsafe_inbound_retries_total",
        "Handler retries after a retryable failure"
    );
    describe_counter!(
        "failsafe_inbound_retries_exhausted_total",
        "Messages abandoned after the last retry"
    );
}

/// Gate metrics recorder.
pub struct GateMetrics;

impl GateMetrics {
    /// Record a newly registered request.
    pub fn record_created() {
        counter!("failsafe_requests_created_total").increment(1);
    }

    /// Record a request transitioning to correlated.
    pub fn record_correlated() {
        counter!("failsafe_requests_correlated_total").increment(1);
    }

    /// Record a status change applied directly.
    pub fn record_applied() {
        counter!("failsafe_status_changes_applied_total").increment(1);
    }

    /// Record a status change parked for later.
    pub fn record_deferred() {
        counter!("failsafe_status_changes_deferred_total").increment(1);
    }
}

/// Replay metrics recorder.
pub struct ReplayMetrics;

impl ReplayMetrics {
    /// Record one drain.
    pub fn record_replay(replayed: usize, duration: Duration) {
        counter!("failsafe_pending_events_replayed_total").increment(replayed as u64);
        histogram!("failsafe_replay_duration_seconds").record(duration.as_secs_f64());
    }

    /// Record a rejected republish.
    pub fn record_publish_failure() {
        counter!("failsafe_replay_publish_failures_total").increment(1);
    }

    /// Record an event that cannot be decoded.
    pub fn record_undecodable() {
        counter!("failsafe_pending_events_undecodable_total").increment(1);
    }

    /// Record an operator discard.
    pub fn record_discarded() {
        counter!("failsafe_pending_events_discarded_total").increment(1);
    }

    /// Record the backlog size seen by the sweeper.
    #[allow(clippy::cast_precision_loss)]
    pub fn record_backlog(size: usize) {
        gauge!("failsafe_pending_events").set(size as f64);
    }
}

/// Inbound consumer metrics recorder.
pub struct ConsumerMetrics;

impl ConsumerMetrics {
    /// Record a received message.
    pub fn record_message(consumer: &str) {
        counter!("failsafe_inbound_messages_total", "consumer" => consumer.to_string())
            .increment(1);
    }

    /// Record a handler retry.
    pub fn record_retry(consumer: &str) {
        counter!("failsafe_inbound_retries_total", "consumer" => consumer.to_string())
            .increment(1);
    }

    /// Record a message abandoned after its last retry.
    pub fn record_exhausted(consumer: &str) {
        counter!("failsafe_inbound_retries_exhausted_total", "consumer" => consumer.to_string())
            .increment(1);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn server_has_no_handle_before_start() {
        let server = MetricsServer::new("127.0.0.1:0".parse().unwrap());
        assert!(server.handle().is_none());
        assert!(server.render().is_none());
    }

    #[test]
    fn recorders_are_noops_without_an_installed_recorder() {
        GateMetrics::record_deferred();
        ReplayMetrics::record_replay(3, Duration::from_millis(5));
        ConsumerMetrics::record_exhausted("status-changes");
    }
}
