//! Server configuration.

/// Configuration for the discovery server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Maximum concurrently connected data-plane proxies. `0` disables the
    /// cap.
    pub max_data_plane_connections: usize,
    /// Number of response workers draining the job queue. Must be at least
    /// one.
    pub worker_pool_size: usize,
    /// Bound on queued-but-unclaimed response jobs. Enqueueing past this
    /// bound blocks, which is what backpressures a busy control plane.
    pub job_queue_capacity: usize,
    /// Per-stream buffer for outbound discovery responses.
    pub response_buffer_size: usize,
    /// Per-stream buffer between the receive task and the stream loop.
    pub request_buffer_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            max_data_plane_connections: 0,
            worker_pool_size: 4,
            job_queue_capacity: 128,
            response_buffer_size: 16,
            request_buffer_size: 16,
        }
    }
}

impl ServerConfig {
    /// Cap the number of connected proxies (`0` = uncapped).
    #[must_use]
    pub fn with_max_data_plane_connections(mut self, max: usize) -> Self {
        self.max_data_plane_connections = max;
        self
    }

    /// Set the response worker pool size.
    #[must_use]
    pub fn with_worker_pool_size(mut self, workers: usize) -> Self {
        self.worker_pool_size = workers;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = ServerConfig::default();
        assert_eq!(config.max_data_plane_connections, 0);
        assert!(config.worker_pool_size >= 1);
        assert!(config.job_queue_capacity >= 1);
    }
}
