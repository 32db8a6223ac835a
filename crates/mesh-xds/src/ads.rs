//! The aggregated discovery gRPC service.
//!
//! One bidirectional stream per connected proxy. The transport layer owns
//! TLS: an interceptor validates the client certificate and stashes a
//! [`PeerIdentity`] in the request extensions; this service consumes it and
//! refuses streams that arrive without one.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::{Request, Response, Status, Streaming};
use tracing::{debug, trace, warn};

use mesh_core::{
    CommonName, MeshError, PodMetadata, Proxy, ProxyKind, SerialNumber,
};
use mesh_messaging::{Broker, Topic};
use mesh_types::aggregated_discovery_service_server::{
    AggregatedDiscoveryService, AggregatedDiscoveryServiceServer,
};
use mesh_types::{DiscoveryRequest, DiscoveryResponse};

use crate::config::ServerConfig;
use crate::metrics::ProxyMetrics;
use crate::registry::ProxyRegistry;
use crate::stream::{run_stream_loop, spawn_receiver, StreamContext};
use crate::workqueue::WorkQueue;

/// The authenticated identity of a connecting proxy.
///
/// Produced by the transport boundary (a tonic interceptor over the mTLS
/// peer certificates) and read from the request extensions here.
#[derive(Debug, Clone)]
pub struct PeerIdentity {
    /// Certificate common name.
    pub common_name: CommonName,
    /// Certificate serial number.
    pub serial_number: SerialNumber,
    /// Whether the peer is a sidecar or a gateway.
    pub kind: ProxyKind,
}

/// Looks up the pod behind a proxy's certificate.
///
/// Implemented outside the core over the cluster's informer caches.
pub trait WorkloadCatalog: Send + Sync + 'static {
    /// Find the pod whose sidecar holds a certificate with `common_name`.
    fn pod_for_common_name(&self, common_name: &CommonName) -> Result<PodMetadata, MeshError>;
}

/// The ADS gRPC service.
#[derive(Clone)]
pub struct AdsService {
    registry: Arc<ProxyRegistry>,
    broker: Broker,
    workqueue: Arc<WorkQueue>,
    catalog: Arc<dyn WorkloadCatalog>,
    config: ServerConfig,
    metrics: ProxyMetrics,
}

impl AdsService {
    /// Assemble the service from its collaborators.
    pub fn new(
        registry: Arc<ProxyRegistry>,
        broker: Broker,
        workqueue: Arc<WorkQueue>,
        catalog: Arc<dyn WorkloadCatalog>,
        config: ServerConfig,
        metrics: ProxyMetrics,
    ) -> Self {
        Self {
            registry,
            broker,
            workqueue,
            catalog,
            config,
            metrics,
        }
    }

    /// Wrap this service for `Server::add_service`.
    pub fn into_service(self) -> AggregatedDiscoveryServiceServer<Self> {
        AggregatedDiscoveryServiceServer::new(self)
    }

    /// Look the proxy's pod up and verify the certificate identity.
    ///
    /// A missing pod is tolerated (the proxy serves without pod metadata);
    /// a service-account mismatch is not.
    fn record_pod_metadata(&self, proxy: &Proxy) -> Result<(), MeshError> {
        if proxy.kind() == ProxyKind::Gateway {
            debug!(proxy = %proxy, "gateway proxy, skipping pod lookup");
            return Ok(());
        }

        let pod = match self.catalog.pod_for_common_name(proxy.common_name()) {
            Ok(pod) => pod,
            Err(err) => {
                warn!(
                    proxy = %proxy,
                    error = %err,
                    "no pod found for connecting proxy, continuing without metadata"
                );
                return Ok(());
            }
        };

        let certificate_identity = proxy.identity()?;
        if certificate_identity != pod.service_account {
            return Err(MeshError::ServiceAccountMismatch {
                certificate: certificate_identity.to_string(),
                pod: pod.service_account.to_string(),
            });
        }

        self.registry
            .record_pod_to_cn(pod.uid.clone(), proxy.common_name().clone());
        proxy.set_pod_metadata(pod);
        Ok(())
    }
}

impl std::fmt::Debug for AdsService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdsService")
            .field("registry", &self.registry)
            .field("config", &self.config)
            .finish()
    }
}

/// Unregisters the proxy and records the disconnect on every stream exit
/// path, including panics and cancellation.
struct RegistrationGuard {
    registry: Arc<ProxyRegistry>,
    proxy: Arc<Proxy>,
    metrics: ProxyMetrics,
}

impl Drop for RegistrationGuard {
    fn drop(&mut self) {
        self.registry.unregister(&self.proxy);
        self.metrics.proxy_disconnected();
    }
}

/// Response stream type for the ADS service.
pub type AdsResponseStream = ReceiverStream<Result<DiscoveryResponse, Status>>;

#[tonic::async_trait]
impl AggregatedDiscoveryService for AdsService {
    type StreamAggregatedResourcesStream = AdsResponseStream;

    async fn stream_aggregated_resources(
        &self,
        request: Request<Streaming<DiscoveryRequest>>,
    ) -> Result<Response<Self::StreamAggregatedResourcesStream>, Status> {
        let peer = request
            .extensions()
            .get::<PeerIdentity>()
            .cloned()
            .ok_or_else(|| {
                Status::from(MeshError::Unauthenticated {
                    reason: "no authenticated peer identity on stream".to_string(),
                })
            })?;

        let limit = self.config.max_data_plane_connections;
        if limit != 0 && self.registry.connected_count() >= limit {
            return Err(MeshError::TooManyConnections {
                connected: self.registry.connected_count(),
                limit,
            }
            .into());
        }

        trace!(serial = %peer.serial_number, "proxy connected");

        let proxy = Arc::new(Proxy::new(
            peer.common_name,
            peer.serial_number,
            request.remote_addr(),
            peer.kind,
        ));

        self.record_pod_metadata(&proxy).map_err(Status::from)?;

        self.registry.register(Arc::clone(&proxy));
        self.metrics.proxy_connected();
        let guard = RegistrationGuard {
            registry: Arc::clone(&self.registry),
            proxy: Arc::clone(&proxy),
            metrics: self.metrics.clone(),
        };

        // Subscribed before the loop starts so no broadcast can slip
        // between registration and the first select.
        let broadcasts = self.broker.subscribe([Topic::ProxyBroadcast]);
        let cert_rotations = self.broker.subscribe([Topic::CertificateRotated]);

        let (response_tx, response_rx) = mpsc::channel(self.config.response_buffer_size);
        let (request_tx, request_rx) = mpsc::channel(self.config.request_buffer_size);

        spawn_receiver(request.into_inner(), request_tx, Arc::clone(&proxy));

        let ctx = StreamContext {
            proxy,
            workqueue: Arc::clone(&self.workqueue),
            metrics: self.metrics.clone(),
            broadcasts,
            cert_rotations,
        };

        tokio::spawn(async move {
            let _guard = guard;
            run_stream_loop(ctx, request_rx, response_tx).await;
        });

        Ok(Response::new(ReceiverStream::new(response_rx)))
    }
}

/// Interceptor helper: attach a validated peer identity to a request.
///
/// The mTLS boundary calls this after certificate validation; tests use it
/// directly.
pub fn attach_peer_identity<T>(request: &mut Request<T>, peer: PeerIdentity) {
    request.extensions_mut().insert(peer);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::ExplicitProxyServiceMapper;
    use crate::response::{NamedResource, ResponseBuilder};
    use async_trait::async_trait;
    use mesh_core::{ServiceIdentity, TypeUri};

    struct EmptyBuilder;

    #[async_trait]
    impl ResponseBuilder for EmptyBuilder {
        async fn build(
            &self,
            _type_uri: TypeUri,
            _proxy: &Proxy,
            _request: Option<&DiscoveryRequest>,
        ) -> Result<Vec<NamedResource>, MeshError> {
            Ok(vec![])
        }
    }

    struct StaticCatalog {
        pod: Option<PodMetadata>,
    }

    impl WorkloadCatalog for StaticCatalog {
        fn pod_for_common_name(
            &self,
            common_name: &CommonName,
        ) -> Result<PodMetadata, MeshError> {
            self.pod.clone().ok_or(MeshError::PodNotFound {
                common_name: common_name.to_string(),
            })
        }
    }

    fn service(pod: Option<PodMetadata>) -> AdsService {
        let registry = Arc::new(ProxyRegistry::new(Arc::new(
            ExplicitProxyServiceMapper::new(),
        )));
        let metrics = ProxyMetrics::new();
        let workqueue = Arc::new(WorkQueue::new(
            1,
            8,
            Arc::new(EmptyBuilder),
            metrics.clone(),
        ));
        AdsService::new(
            registry,
            Broker::new(),
            workqueue,
            Arc::new(StaticCatalog { pod }),
            ServerConfig::default(),
            metrics,
        )
    }

    fn pod(service_account: &str, namespace: &str) -> PodMetadata {
        PodMetadata {
            uid: "uid-1".to_string(),
            name: "bookstore-7d4f".to_string(),
            namespace: namespace.to_string(),
            service_account: ServiceIdentity::new(service_account, namespace),
            workload_kind: "Deployment".to_string(),
            workload_name: "bookstore".to_string(),
        }
    }

    fn sidecar(cn: &str) -> Proxy {
        Proxy::new(
            CommonName::from(cn),
            SerialNumber::from("serial"),
            None,
            ProxyKind::Sidecar,
        )
    }

    #[tokio::test]
    async fn matching_pod_metadata_is_recorded() {
        let svc = service(Some(pod("bookstore-sa", "bookstore")));
        let proxy = sidecar("bookstore-sa.bookstore.cluster.local");

        svc.record_pod_metadata(&proxy).unwrap();

        assert_eq!(proxy.pod_metadata().unwrap().uid, "uid-1");
    }

    #[tokio::test]
    async fn mismatched_service_account_is_rejected() {
        let svc = service(Some(pod("other-sa", "bookstore")));
        let proxy = sidecar("bookstore-sa.bookstore.cluster.local");

        let err = svc.record_pod_metadata(&proxy).unwrap_err();
        assert!(matches!(err, MeshError::ServiceAccountMismatch { .. }));
        assert!(proxy.pod_metadata().is_none());
    }

    #[tokio::test]
    async fn missing_pod_is_tolerated() {
        let svc = service(None);
        let proxy = sidecar("bookstore-sa.bookstore.cluster.local");

        svc.record_pod_metadata(&proxy).unwrap();
        assert!(proxy.pod_metadata().is_none());
    }

    #[tokio::test]
    async fn gateway_skips_pod_lookup() {
        // The catalog would report a mismatched pod, but gateways are never
        // looked up.
        let svc = service(Some(pod("other-sa", "edge")));
        let proxy = Proxy::new(
            CommonName::from("gateway-sa.edge.cluster.local"),
            SerialNumber::from("serial"),
            None,
            ProxyKind::Gateway,
        );

        svc.record_pod_metadata(&proxy).unwrap();
        assert!(proxy.pod_metadata().is_none());
    }
}
