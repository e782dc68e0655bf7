//! Metrics collection and exposition.
//!
//! # Metrics
//! - `rampart_requests_total` (counter): requests by method, status, backend
//! - `rampart_request_duration_seconds` (histogram): end-to-end latency
//! - `rampart_admission_rejections_total` (counter): refused requests by reason
//! - `rampart_selection_fallbacks_total` (counter): strategy errors degraded to round-robin
//! - `rampart_backend_health` (gauge): 1=up, 0=down
//! - `rampart_backend_connections` (gauge): in-flight requests per backend
//! - `rampart_queue_depth` (gauge): requests waiting in the backpressure queue
//!
//! Without an installed recorder every call is a no-op.

use std::net::SocketAddr;
use std::time::Instant;

use metrics_exporter_prometheus::PrometheusBuilder;

/// Install the Prometheus recorder and its scrape listener.
pub fn init_metrics(addr: SocketAddr) {
    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => tracing::info!(address = %addr, "Metrics endpoint listening"),
        Err(e) => tracing::error!(error = %e, "Failed to install metrics exporter"),
    }
}

pub fn record_request(method: &str, status: u16, backend: &str, start: Instant) {
    let labels = [
        ("method", method.to_string()),
        ("status", status.to_string()),
        ("backend", backend.to_string()),
    ];
    metrics::counter!("rampart_requests_total", &labels).increment(1);
    metrics::histogram!("rampart_request_duration_seconds", &labels)
        .record(start.elapsed().as_secs_f64());
}

pub fn record_admission_rejection(reason: &'static str) {
    metrics::counter!("rampart_admission_rejections_total", "reason" => reason).increment(1);
}

pub fn record_selection_fallback(algorithm: &'static str) {
    metrics::counter!("rampart_selection_fallbacks_total", "algorithm" => algorithm).increment(1);
}

pub fn record_backend_health(backend: &str, up: bool) {
    metrics::gauge!("rampart_backend_health", "backend" => backend.to_string())
        .set(if up { 1.0 } else { 0.0 });
}

pub fn record_backend_connections(backend: &str, connections: usize) {
    metrics::gauge!("rampart_backend_connections", "backend" => backend.to_string())
        .set(connections as f64);
}

pub fn record_queue_depth(depth: usize) {
    metrics::gauge!("rampart_queue_depth").set(depth as f64);
}
