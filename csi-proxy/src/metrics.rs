//! Prometheus metrics for the proxy
//!
//! Covers routed CSI operations, backend construction and the connection
//! cache.

use std::net::SocketAddr;
use std::time::Instant;

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use tracing::info;

use crate::error::ProxyError;

/// Metric names
pub mod names {
    /// Counter: Total number of routed CSI operations by type and status
    pub const OPERATIONS_TOTAL: &str = "csi_proxy_operations_total";
    /// Histogram: Duration of routed CSI operations in seconds
    pub const OPERATION_DURATION_SECONDS: &str = "csi_proxy_operation_duration_seconds";
    /// Counter: Backend instances constructed, by kind
    pub const BACKEND_BUILDS_TOTAL: &str = "csi_proxy_backend_builds_total";
    /// Counter: Connection entries evicted after idling
    pub const CACHE_EVICTIONS_TOTAL: &str = "csi_proxy_cache_evictions_total";
    /// Gauge: Connection entries currently cached
    pub const CACHED_CONNECTIONS: &str = "csi_proxy_cached_connections";
}

/// Initialize the Prometheus metrics exporter
///
/// Starts an HTTP server on the specified address that serves metrics
/// at the `/metrics` endpoint.
pub fn init_metrics(addr: SocketAddr) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;

    info!("Metrics server listening on http://{}/metrics", addr);
    Ok(())
}

/// Record a routed operation with its result
pub fn record_operation(operation: &str, status: &str, duration_secs: f64) {
    counter!(names::OPERATIONS_TOTAL, "operation" => operation.to_string(), "status" => status.to_string())
        .increment(1);
    histogram!(names::OPERATION_DURATION_SECONDS, "operation" => operation.to_string())
        .record(duration_secs);
}

pub fn record_backend_build(kind: &str) {
    counter!(names::BACKEND_BUILDS_TOTAL, "kind" => kind.to_string()).increment(1);
}

pub fn record_eviction() {
    counter!(names::CACHE_EVICTIONS_TOTAL).increment(1);
}

pub fn set_cached_connections(count: usize) {
    gauge!(names::CACHED_CONNECTIONS).set(count as f64);
}

/// Helper for timing operations
pub struct OperationTimer {
    operation: &'static str,
    start: Instant,
}

impl OperationTimer {
    /// Start timing an operation
    pub fn new(operation: &'static str) -> Self {
        Self {
            operation,
            start: Instant::now(),
        }
    }

    pub fn operation(&self) -> &'static str {
        self.operation
    }

    /// Record the outcome of `result` and hand it back.
    pub fn observe<T>(self, result: Result<T, ProxyError>) -> Result<T, ProxyError> {
        let duration = self.start.elapsed().as_secs_f64();
        let status = match &result {
            Ok(_) => "success".to_string(),
            Err(e) => format!("{:?}", e.code()),
        };
        record_operation(self.operation, &status, duration);
        result
    }
}
