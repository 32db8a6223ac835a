//! Control-plane metrics.
//!
//! Thin wrapper over the `metrics` facade so call sites stay terse and the
//! metric names live in one place.

use metrics::{counter, gauge, histogram};

/// Metrics for proxy connections and the discovery protocol.
#[derive(Debug, Clone, Default)]
pub struct ProxyMetrics;

impl ProxyMetrics {
    /// Create a metrics handle.
    pub fn new() -> Self {
        Self
    }

    /// A proxy stream was accepted.
    pub fn proxy_connected(&self) {
        counter!("mesh_proxy_connect_total").increment(1);
        gauge!("mesh_connected_proxies").increment(1.0);
    }

    /// A proxy stream ended, on any exit path.
    pub fn proxy_disconnected(&self) {
        counter!("mesh_proxy_disconnect_total").increment(1);
        gauge!("mesh_connected_proxies").decrement(1.0);
    }

    /// A proxy adopted state from a previous control-plane connection.
    pub fn proxy_reconnected(&self) {
        counter!("mesh_proxy_reconnect_total").increment(1);
    }

    /// The data plane rejected a configuration version.
    pub fn nack(&self, type_uri: &str) {
        counter!("mesh_nack_total", "type_uri" => type_uri.to_string()).increment(1);
    }

    /// A request arrived with the reserved empty type URL.
    pub fn empty_type_url(&self) {
        counter!("mesh_empty_type_uri_total").increment(1);
    }

    /// A response job failed before its response reached the stream.
    pub fn job_failed(&self, type_uri: &str) {
        counter!("mesh_jobs_failed_total", "type_uri" => type_uri.to_string()).increment(1);
    }

    /// A response was written to a proxy stream.
    pub fn response_sent(&self, type_uri: &str, latency_ms: u64) {
        counter!("mesh_responses_total", "type_uri" => type_uri.to_string()).increment(1);
        histogram!("mesh_response_latency_ms", "type_uri" => type_uri.to_string())
            .record(latency_ms as f64);
    }
}
