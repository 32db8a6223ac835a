//! Server builder: validates configuration and wires the components.

use std::sync::Arc;

use mesh_core::MeshError;
use mesh_messaging::{Broker, DispatchConfig, ShutdownController};

use crate::ads::WorkloadCatalog;
use crate::cert_release::CertificateManager;
use crate::config::ServerConfig;
use crate::metrics::ProxyMetrics;
use crate::registry::{ExplicitProxyServiceMapper, ProxyRegistry, ProxyServiceMapper};
use crate::response::ResponseBuilder;
use crate::workqueue::WorkQueue;
use crate::XdsServer;

/// Builder for an [`XdsServer`].
///
/// # Example
///
/// ```rust,ignore
/// use mesh_xds::XdsServerBuilder;
///
/// let server = XdsServerBuilder::new()
///     .response_builder(builder)
///     .workload_catalog(catalog)
///     .certificate_manager(cert_manager)
///     .max_data_plane_connections(2000)
///     .build()?;
///
/// server.start_singletons();
/// server.serve("[::]:15128".parse()?).await?;
/// ```
#[derive(Default)]
pub struct XdsServerBuilder {
    broker: Option<Broker>,
    response_builder: Option<Arc<dyn ResponseBuilder>>,
    catalog: Option<Arc<dyn WorkloadCatalog>>,
    mapper: Option<Arc<dyn ProxyServiceMapper>>,
    certificate_manager: Option<Arc<dyn CertificateManager>>,
    config: Option<ServerConfig>,
    dispatch_config: Option<DispatchConfig>,
}

impl XdsServerBuilder {
    /// Create a new builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Use an existing event bus instead of creating one.
    #[must_use]
    pub fn broker(mut self, broker: Broker) -> Self {
        self.broker = Some(broker);
        self
    }

    /// Set the response builder. Required.
    #[must_use]
    pub fn response_builder(mut self, builder: Arc<dyn ResponseBuilder>) -> Self {
        self.response_builder = Some(builder);
        self
    }

    /// Set the workload catalog used for pod lookups. Required.
    #[must_use]
    pub fn workload_catalog(mut self, catalog: Arc<dyn WorkloadCatalog>) -> Self {
        self.catalog = Some(catalog);
        self
    }

    /// Set the proxy-to-services mapper.
    ///
    /// Defaults to an empty explicit mapper.
    #[must_use]
    pub fn service_mapper(mut self, mapper: Arc<dyn ProxyServiceMapper>) -> Self {
        self.mapper = Some(mapper);
        self
    }

    /// Set the certificate manager backing the release handler.
    ///
    /// Without one, the release handler is not started.
    #[must_use]
    pub fn certificate_manager(mut self, manager: Arc<dyn CertificateManager>) -> Self {
        self.certificate_manager = Some(manager);
        self
    }

    /// Replace the whole server configuration.
    #[must_use]
    pub fn config(mut self, config: ServerConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Cap the number of connected proxies (`0` = uncapped).
    #[must_use]
    pub fn max_data_plane_connections(mut self, max: usize) -> Self {
        let config = self.config.take().unwrap_or_default();
        self.config = Some(config.with_max_data_plane_connections(max));
        self
    }

    /// Set the response worker pool size.
    #[must_use]
    pub fn worker_pool_size(mut self, workers: usize) -> Self {
        let config = self.config.take().unwrap_or_default();
        self.config = Some(config.with_worker_pool_size(workers));
        self
    }

    /// Override the broadcast-coalescing deadlines.
    #[must_use]
    pub fn dispatch_config(mut self, config: DispatchConfig) -> Self {
        self.dispatch_config = Some(config);
        self
    }

    /// Validate the configuration and assemble the server.
    ///
    /// Spawns the response workers, so it must run within a Tokio runtime.
    pub fn build(self) -> Result<XdsServer, MeshError> {
        let config = self.config.unwrap_or_default();
        if config.worker_pool_size == 0 {
            return Err(MeshError::Configuration(
                "worker_pool_size must be at least 1".to_string(),
            ));
        }
        if config.job_queue_capacity == 0 {
            return Err(MeshError::Configuration(
                "job_queue_capacity must be at least 1".to_string(),
            ));
        }
        if config.response_buffer_size == 0 || config.request_buffer_size == 0 {
            return Err(MeshError::Configuration(
                "stream buffer sizes must be at least 1".to_string(),
            ));
        }

        let response_builder = self.response_builder.ok_or_else(|| {
            MeshError::Configuration("a response builder is required".to_string())
        })?;
        let catalog = self.catalog.ok_or_else(|| {
            MeshError::Configuration("a workload catalog is required".to_string())
        })?;

        let broker = self.broker.unwrap_or_default();
        let mapper = self
            .mapper
            .unwrap_or_else(|| Arc::new(ExplicitProxyServiceMapper::new()));
        let metrics = ProxyMetrics::new();
        let registry = Arc::new(ProxyRegistry::new(mapper));
        let workqueue = Arc::new(WorkQueue::new(
            config.worker_pool_size,
            config.job_queue_capacity,
            response_builder,
            metrics.clone(),
        ));

        Ok(XdsServer {
            registry,
            broker,
            workqueue,
            catalog,
            certificate_manager: self.certificate_manager,
            config,
            dispatch_config: self.dispatch_config.unwrap_or_default(),
            metrics,
            shutdown: ShutdownController::new(),
        })
    }
}
