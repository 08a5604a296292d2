//! Prometheus metrics for the pipeline.
//!
//! Metrics are emitted through the `metrics` facade from every component:
//! - Event bus publishes and per-subscription enqueues
//! - Queue deliveries, acknowledgments, redeliveries and dead letters
//! - Consumer outcomes and processing latency
//! - Change-stream progress
//! - Order processing and payment latency
//!
//! Without an installed recorder the calls are no-ops. [`MetricsServer`]
//! installs the Prometheus recorder and renders the exposition text.
//!
//! # Example
//!
//! ```rust,no_run
//! use orderflow_runtime::metrics::MetricsServer;
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut server = MetricsServer::new("0.0.0.0:9090".parse()?);
//! server.start()?;
//!
//! if let Some(text) = server.render() {
//!     println!("{text}");
//! }
//! # Ok(())
//! # }
//! ```

use metrics::{describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;

// Re-export metrics macros for use in other crates
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

/// Prometheus metrics endpoint.
///
/// Holds the scrape address an outer HTTP adapter should serve
/// [`MetricsServer::render`] on.
pub struct MetricsServer {
    addr: SocketAddr,
    handle: Option<PrometheusHandle>,
}

impl MetricsServer {
    /// Create a new metrics server for `addr` (e.g., `0.0.0.0:9090`).
    #[must_use]
    pub const fn new(addr: SocketAddr) -> Self {
        Self { addr, handle: None }
    }

    /// Scrape address.
    #[must_use]
    pub const fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Register metric descriptions and install the Prometheus recorder.
    ///
    /// # Errors
    ///
    /// Returns error if the exporter cannot be built or installed. A recorder
    /// installed earlier in the same process (tests) is tolerated: the call
    /// succeeds and [`MetricsServer::render`] returns `None`.
    pub fn start(&mut self) -> Result<(), MetricsError> {
        register_metrics();

        let builder = PrometheusBuilder::new()
            .set_buckets_for_metric(
                Matcher::Suffix("duration_seconds".to_string()),
                &[
                    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
                ],
            )
            .map_err(|e| MetricsError::Build(e.to_string()))?;

        match builder.install_recorder() {
            Ok(handle) => {
                self.handle = Some(handle);
                tracing::info!(addr = %self.addr, "Metrics recorder installed");
                Ok(())
            }
            Err(e) => {
                let err_msg = e.to_string();
                if err_msg.contains("already initialized") {
                    tracing::warn!(
                        "Metrics recorder already initialized, skipping re-initialization"
                    );
                    Ok(())
                } else {
                    Err(MetricsError::Install(err_msg))
                }
            }
        }
    }

    /// Render current metrics in Prometheus format.
    ///
    /// Returns `None` if this instance did not install the recorder.
    #[must_use]
    pub fn render(&self) -> Option<String> {
        self.handle.as_ref().map(PrometheusHandle::render)
    }
}

fn register_metrics() {
    // Event bus
    describe_counter!("event_bus_events_published_total", "Events published, by type");
    describe_counter!(
        "event_bus_publish_errors_total",
        "Publishes that failed for at least one subscription"
    );
    describe_counter!("event_bus_enqueues_total", "Event copies enqueued, by consumer");
    describe_counter!(
        "event_bus_filtered_total",
        "Events dropped by a subscription filter, by consumer"
    );
    describe_histogram!("event_bus_publish_duration_seconds", "Time from publish to last enqueue");

    // Queues
    describe_counter!("queue_deliveries_total", "Messages handed to a consumer, by queue");
    describe_counter!(
        "queue_redeliveries_total",
        "Messages made visible again after a visibility timeout"
    );
    describe_counter!("queue_acks_total", "Messages acknowledged, by queue");
    describe_counter!(
        "queue_dead_lettered_total",
        "Messages moved to the dead-letter store, by queue"
    );
    describe_gauge!("queue_depth", "Visible plus in-flight messages, by queue");

    // Dead letters
    describe_counter!("dead_letter_redriven_total", "Dead letters sent back to their source queue");
    describe_counter!("dead_letter_resolved_total", "Dead letters marked resolved");
    describe_counter!("dead_letter_discarded_total", "Dead letters marked discarded");

    // Consumers
    describe_counter!(
        "consumer_messages_processed_total",
        "Messages processed, by consumer and outcome"
    );
    describe_histogram!("consumer_processing_duration_seconds", "Handler latency, by consumer");

    // Change stream
    describe_counter!(
        "change_stream_records_processed_total",
        "Change records handled, by processor"
    );
    describe_counter!("change_stream_errors_total", "Change records that failed, by processor");
    describe_gauge!("change_stream_checkpoint", "Last checkpointed sequence, by processor");

    // Orders
    describe_counter!("orders_total", "Order submissions, by resulting status");
    describe_histogram!("payment_duration_seconds", "Payment gateway latency");
    describe_counter!("fraud_assessments_total", "Fraud assessments, by resulting status");
    describe_counter!("order_revenue_cents_total", "Revenue of created orders seen by analytics");

    // Retry
    describe_counter!("retry_attempts_total", "Retries performed");
    describe_counter!("retry_successes_total", "Operations that succeeded after a retry");
    describe_counter!("retry_exhausted_total", "Operations that failed after max retries");
}

/// Event bus metrics recorder.
pub struct BusMetrics;

impl BusMetrics {
    /// Record a publish and its fan-out duration.
    pub fn record_publish(event_type: &'static str, duration: Duration) {
        counter!("event_bus_events_published_total", "event_type" => event_type).increment(1);
        histogram!("event_bus_publish_duration_seconds").record(duration.as_secs_f64());
    }

    /// Record a publish with at least one failed enqueue.
    pub fn record_publish_error(event_type: &'static str) {
        counter!("event_bus_publish_errors_total", "event_type" => event_type).increment(1);
    }

    /// Record one copy enqueued for `consumer`.
    pub fn record_enqueue(consumer: &str) {
        counter!("event_bus_enqueues_total", "consumer" => consumer.to_string()).increment(1);
    }

    /// Record an event filtered out for `consumer`.
    pub fn record_filtered(consumer: &str) {
        counter!("event_bus_filtered_total", "consumer" => consumer.to_string()).increment(1);
    }
}

/// Queue metrics recorder.
pub struct QueueMetrics;

impl QueueMetrics {
    /// Record `count` deliveries.
    pub fn record_deliveries(queue: &str, count: usize) {
        counter!("queue_deliveries_total", "queue" => queue.to_string()).increment(count as u64);
    }

    /// Record a message becoming visible again.
    pub fn record_redelivery(queue: &str) {
        counter!("queue_redeliveries_total", "queue" => queue.to_string()).increment(1);
    }

    /// Record an acknowledgment.
    pub fn record_ack(queue: &str) {
        counter!("queue_acks_total", "queue" => queue.to_string()).increment(1);
    }

    /// Record a message moved to the dead-letter store.
    pub fn record_dead_letter(queue: &str) {
        counter!("queue_dead_lettered_total", "queue" => queue.to_string()).increment(1);
    }

    /// Record current depth.
    #[allow(clippy::cast_precision_loss)]
    pub fn record_depth(queue: &str, depth: usize) {
        gauge!("queue_depth", "queue" => queue.to_string()).set(depth as f64);
    }
}

/// Consumer metrics recorder.
pub struct ConsumerMetrics;

impl ConsumerMetrics {
    /// Record a processed message. `outcome` is `ok`, `error` or `timeout`.
    pub fn record_outcome(consumer: &str, outcome: &'static str, duration: Duration) {
        counter!(
            "consumer_messages_processed_total",
            "consumer" => consumer.to_string(),
            "outcome" => outcome
        )
        .increment(1);
        histogram!("consumer_processing_duration_seconds", "consumer" => consumer.to_string())
            .record(duration.as_secs_f64());
    }
}

/// Change-stream metrics recorder.
pub struct ChangeStreamMetrics;

impl ChangeStreamMetrics {
    /// Record a handled record and the new checkpoint.
    #[allow(clippy::cast_precision_loss)]
    pub fn record_processed(processor: &str, sequence: u64) {
        counter!("change_stream_records_processed_total", "processor" => processor.to_string())
            .increment(1);
        gauge!("change_stream_checkpoint", "processor" => processor.to_string())
            .set(sequence as f64);
    }

    /// Record a failed record.
    pub fn record_error(processor: &str) {
        counter!("change_stream_errors_total", "processor" => processor.to_string()).increment(1);
    }
}

/// Order metrics recorder.
pub struct OrderMetrics;

impl OrderMetrics {
    /// Record an order submission outcome (`confirmed`, `declined`, `timeout`, `rejected`).
    pub fn record_order(outcome: &'static str) {
        counter!("orders_total", "outcome" => outcome).increment(1);
    }

    /// Record a payment call duration.
    pub fn record_payment(duration: Duration) {
        histogram!("payment_duration_seconds").record(duration.as_secs_f64());
    }

    /// Record a fraud assessment (`approved`, `high_risk_pending_review`).
    pub fn record_fraud_assessment(status: &'static str) {
        counter!("fraud_assessments_total", "status" => status).increment(1);
    }

    /// Record revenue aggregated by analytics.
    pub fn record_revenue(cents: u64) {
        counter!("order_revenue_cents_total").increment(cents);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_server_creation() {
        let server = MetricsServer::new("127.0.0.1:0".parse().unwrap());
        assert!(server.render().is_none());
    }

    #[test]
    fn test_metrics_server_render() {
        let mut server = MetricsServer::new("127.0.0.1:0".parse().unwrap());
        server.start().unwrap();

        BusMetrics::record_publish("order_created", Duration::from_millis(5));
        QueueMetrics::record_ack("analytics");

        // Another test may have installed the recorder first.
        if let Some(rendered) = server.render() {
            assert!(rendered.contains("event_bus_events_published_total"));
            assert!(rendered.contains("queue_acks_total"));
        }
    }
}
