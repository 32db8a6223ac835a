//! # mesh-xds
//!
//! The aggregated discovery server for the meshwire control plane:
//!
//! - [`AdsService`] - The bidirectional ADS stream endpoint and its
//!   per-connection protocol state machine
//! - [`ProxyRegistry`] - The process-wide index of connected proxies
//! - [`WorkQueue`] - Bounded worker pool materializing discovery responses
//! - [`ResponseBuilder`] - The seam to the policy catalog: pure per-type
//!   resource construction
//! - [`CertificateReleaseHandler`] - Pod deletion to certificate disposal
//!   bridge
//! - [`XdsServer`] / [`XdsServerBuilder`] - Assembly and serving
//!
//! ## Example
//!
//! ```rust,ignore
//! use mesh_xds::XdsServerBuilder;
//!
//! let server = XdsServerBuilder::new()
//!     .response_builder(builder)
//!     .workload_catalog(catalog)
//!     .certificate_manager(cert_manager)
//!     .build()?;
//!
//! server.start_singletons();
//! server.serve("[::]:15128".parse()?).await?;
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod ads;
mod builder;
mod cert_release;
mod config;
pub mod metrics;
mod registry;
mod response;
mod stream;
mod utils;
mod workqueue;

#[cfg(test)]
mod protocol_tests;

pub use ads::{attach_peer_identity, AdsResponseStream, AdsService, PeerIdentity, WorkloadCatalog};
pub use builder::XdsServerBuilder;
pub use cert_release::{CertificateManager, CertificateReleaseHandler};
pub use config::ServerConfig;
pub use self::metrics::ProxyMetrics;
pub use registry::{ExplicitProxyServiceMapper, ProxyRegistry, ProxyServiceMapper};
pub use response::{NamedResource, ResponseBuilder, ResponseSender};
pub use stream::{assess_request, RequestDecision};
pub use utils::generate_nonce;
pub use workqueue::{Job, WorkQueue};

use std::net::SocketAddr;
use std::sync::Arc;

use tracing::info;

use mesh_messaging::{Broker, DispatchConfig, Dispatcher, ShutdownController};

/// The assembled discovery server.
///
/// Holds the registry, event bus and work queue, and owns the lifecycle of
/// the process-wide singletons (dispatcher and certificate-release
/// handler). Build one with [`XdsServerBuilder`].
pub struct XdsServer {
    pub(crate) registry: Arc<ProxyRegistry>,
    pub(crate) broker: Broker,
    pub(crate) workqueue: Arc<WorkQueue>,
    pub(crate) catalog: Arc<dyn WorkloadCatalog>,
    pub(crate) certificate_manager: Option<Arc<dyn CertificateManager>>,
    pub(crate) config: ServerConfig,
    pub(crate) dispatch_config: DispatchConfig,
    pub(crate) metrics: ProxyMetrics,
    pub(crate) shutdown: ShutdownController,
}

impl std::fmt::Debug for XdsServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("XdsServer")
            .field("registry", &self.registry)
            .field("broker", &self.broker)
            .field("workqueue", &self.workqueue)
            .field("config", &self.config)
            .field("dispatch_config", &self.dispatch_config)
            .field("metrics", &self.metrics)
            .field("shutdown", &self.shutdown)
            .finish_non_exhaustive()
    }
}

impl XdsServer {
    /// Create a new builder.
    pub fn builder() -> XdsServerBuilder {
        XdsServerBuilder::new()
    }

    /// The proxy registry.
    #[inline]
    pub fn registry(&self) -> &Arc<ProxyRegistry> {
        &self.registry
    }

    /// The event bus.
    #[inline]
    pub fn broker(&self) -> &Broker {
        &self.broker
    }

    /// The shutdown controller governing the singletons and `serve`.
    #[inline]
    pub fn shutdown_controller(&self) -> &ShutdownController {
        &self.shutdown
    }

    /// The server configuration.
    #[inline]
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Spawn the process-wide singletons: the broadcast dispatcher, and the
    /// certificate-release handler when a certificate manager was supplied.
    ///
    /// Must run before the first stream is accepted so no change events are
    /// lost between serving and dispatching.
    pub fn start_singletons(&self) {
        Dispatcher::new(self.broker.clone(), self.dispatch_config.clone())
            .spawn(self.shutdown.signal());

        if let Some(manager) = &self.certificate_manager {
            CertificateReleaseHandler::new(
                Arc::clone(&self.registry),
                self.broker.clone(),
                Arc::clone(manager),
            )
            .spawn(self.shutdown.signal());
        }
    }

    /// The ADS service backed by this server's components.
    pub fn ads_service(&self) -> AdsService {
        AdsService::new(
            Arc::clone(&self.registry),
            self.broker.clone(),
            Arc::clone(&self.workqueue),
            Arc::clone(&self.catalog),
            self.config.clone(),
            self.metrics.clone(),
        )
    }

    /// Serve the ADS endpoint until the shutdown controller triggers.
    ///
    /// On shutdown the event bus is drained, which ends every proxy stream.
    pub async fn serve(self, addr: SocketAddr) -> Result<(), tonic::transport::Error> {
        let mut signal = self.shutdown.signal();
        let broker = self.broker.clone();
        let ads = self.ads_service();

        info!(addr = %addr, "starting discovery server");

        tonic::transport::Server::builder()
            .add_service(ads.into_service())
            .serve_with_shutdown(addr, async move {
                signal.wait().await;
                broker.shutdown();
                info!("discovery server draining");
            })
            .await
    }
}
