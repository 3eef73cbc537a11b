//! Metrics collection and export for Parley.
//!
//! Uses the `metrics` crate for instrumentation and exports
//! to Prometheus format.

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tracing::info;

/// Metric names.
pub mod names {
    pub const CONNECTIONS_TOTAL: &str = "parley_connections_total";
    pub const CONNECTIONS_ACTIVE: &str = "parley_connections_active";
    pub const EVENTS_TOTAL: &str = "parley_events_total";
    pub const EVENT_BYTES: &str = "parley_event_bytes";
    pub const ERRORS_TOTAL: &str = "parley_errors_total";
    pub const AUTH_FAILURES_TOTAL: &str = "parley_auth_failures_total";
    pub const OPERATION_SECONDS: &str = "parley_operation_seconds";
    pub const CHANNELS_ACTIVE: &str = "parley_channels_active";
}

/// Initialize the metrics system.
pub fn init_metrics() {
    metrics::describe_counter!(
        names::CONNECTIONS_TOTAL,
        "Total number of chat connections since server start"
    );
    metrics::describe_gauge!(
        names::CONNECTIONS_ACTIVE,
        "Current number of open chat connections"
    );
    metrics::describe_counter!(names::EVENTS_TOTAL, "Chat events by name and direction");
    metrics::describe_counter!(names::EVENT_BYTES, "Bytes of chat frames by direction");
    metrics::describe_counter!(names::ERRORS_TOTAL, "Failures reported to clients, by kind");
    metrics::describe_counter!(
        names::AUTH_FAILURES_TOTAL,
        "Connections rejected at the handshake"
    );
    metrics::describe_histogram!(
        names::OPERATION_SECONDS,
        "Time to run one client operation in seconds"
    );
    metrics::describe_gauge!(names::CHANNELS_ACTIVE, "Current number of fan-out channels");

    info!("Metrics initialized");
}

/// Start the Prometheus metrics server.
///
/// # Errors
///
/// Returns an error if the server cannot be started.
pub fn start_metrics_server(port: u16) -> Result<(), Box<dyn std::error::Error>> {
    let addr: SocketAddr = format!("0.0.0.0:{port}").parse()?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;

    info!("Metrics server listening on {}", addr);
    Ok(())
}

fn record_connection() {
    counter!(names::CONNECTIONS_TOTAL).increment(1);
    gauge!(names::CONNECTIONS_ACTIVE).increment(1.0);
}

fn record_disconnection() {
    gauge!(names::CONNECTIONS_ACTIVE).decrement(1.0);
}

/// Record one event crossing the socket.
pub fn record_event(event: &'static str, direction: &'static str) {
    counter!(names::EVENTS_TOTAL, "event" => event, "direction" => direction).increment(1);
}

/// Record frame bytes crossing the socket.
pub fn record_bytes(bytes: usize, direction: &'static str) {
    counter!(names::EVENT_BYTES, "direction" => direction).increment(bytes as u64);
}

/// Record how long an operation took.
pub fn record_operation(op: &'static str, seconds: f64) {
    histogram!(names::OPERATION_SECONDS, "op" => op).record(seconds);
}

/// Update active channel count.
pub fn set_active_channels(count: usize) {
    gauge!(names::CHANNELS_ACTIVE).set(count as f64);
}

/// Record an error.
pub fn record_error(kind: &str) {
    counter!(names::ERRORS_TOTAL, "kind" => kind.to_string()).increment(1);
}

/// Record a rejected handshake.
pub fn record_auth_failure() {
    counter!(names::AUTH_FAILURES_TOTAL).increment(1);
}

/// Metrics guard that records disconnection on drop.
pub struct ConnectionMetricsGuard;

impl ConnectionMetricsGuard {
    /// Create a new metrics guard, recording a connection.
    #[must_use]
    pub fn new() -> Self {
        record_connection();
        Self
    }
}

impl Default for ConnectionMetricsGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ConnectionMetricsGuard {
    fn drop(&mut self) {
        record_disconnection();
    }
}
