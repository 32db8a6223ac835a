//! The process-wide index of connected proxies.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tracing::{debug, warn};

use mesh_core::{CommonName, ConnectionId, MeshError, MeshService, Proxy};

/// Resolves the mesh services a proxy's pod backs.
///
/// Implemented outside the core, typically over informer caches. The
/// registry only routes the call.
pub trait ProxyServiceMapper: Send + Sync + 'static {
    /// List the mesh services fronted by the given proxy.
    fn list_proxy_services(&self, proxy: &Proxy) -> Result<Vec<MeshService>, MeshError>;
}

/// A [`ProxyServiceMapper`] over an explicit common-name mapping.
///
/// Useful for tests and single-tenant deployments where the service set per
/// identity is known up front.
#[derive(Debug, Default)]
pub struct ExplicitProxyServiceMapper {
    services: HashMap<CommonName, Vec<MeshService>>,
}

impl ExplicitProxyServiceMapper {
    /// Create an empty mapper.
    pub fn new() -> Self {
        Self::default()
    }

    /// Associate a certificate common name with the services it backs.
    #[must_use]
    pub fn with_services(mut self, cn: CommonName, services: Vec<MeshService>) -> Self {
        self.services.insert(cn, services);
        self
    }
}

impl ProxyServiceMapper for ExplicitProxyServiceMapper {
    fn list_proxy_services(&self, proxy: &Proxy) -> Result<Vec<MeshService>, MeshError> {
        Ok(self
            .services
            .get(proxy.common_name())
            .cloned()
            .unwrap_or_default())
    }
}

/// The authoritative set of connected proxies.
///
/// All operations are non-blocking; the maps are concurrent and the
/// connected count is atomic. The registry does not enforce the data-plane
/// connection cap: callers check the count before registering.
pub struct ProxyRegistry {
    connected: DashMap<ConnectionId, Arc<Proxy>>,
    pod_uid_to_cn: DashMap<String, CommonName>,
    count: AtomicUsize,
    mapper: Arc<dyn ProxyServiceMapper>,
}

impl ProxyRegistry {
    /// Create a registry backed by the given service mapper.
    pub fn new(mapper: Arc<dyn ProxyServiceMapper>) -> Self {
        Self {
            connected: DashMap::new(),
            pod_uid_to_cn: DashMap::new(),
            count: AtomicUsize::new(0),
            mapper,
        }
    }

    /// Register a connected proxy. Idempotent on connection ID.
    pub fn register(&self, proxy: Arc<Proxy>) {
        let id = proxy.connection_id();
        if self.connected.insert(id, proxy).is_none() {
            self.count.fetch_add(1, Ordering::Relaxed);
            debug!(connection = %id, connected = self.connected_count(), "proxy registered");
        }
    }

    /// Remove a proxy. Called from the stream's deferred cleanup; safe if
    /// the proxy was never registered.
    pub fn unregister(&self, proxy: &Proxy) {
        let id = proxy.connection_id();
        if self.connected.remove(&id).is_some() {
            self.count.fetch_sub(1, Ordering::Relaxed);
            debug!(connection = %id, connected = self.connected_count(), "proxy unregistered");
        }
    }

    /// Number of currently connected proxies.
    pub fn connected_count(&self) -> usize {
        self.count.load(Ordering::Relaxed)
    }

    /// Look up a connected proxy by connection ID.
    pub fn get(&self, id: ConnectionId) -> Option<Arc<Proxy>> {
        self.connected.get(&id).map(|entry| Arc::clone(&entry))
    }

    /// Snapshot of all connected proxies.
    pub fn list(&self) -> Vec<Arc<Proxy>> {
        self.connected
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    /// The mesh services fronted by this proxy.
    ///
    /// Fails with `pod-not-found` when the proxy has no discoverable pod.
    pub fn list_services(&self, proxy: &Proxy) -> Result<Vec<MeshService>, MeshError> {
        if proxy.pod_metadata().is_none() {
            return Err(MeshError::PodNotFound {
                common_name: proxy.common_name().to_string(),
            });
        }
        self.mapper.list_proxy_services(proxy)
    }

    /// Record which certificate common name a pod's sidecar holds.
    pub fn record_pod_to_cn(&self, pod_uid: impl Into<String>, cn: CommonName) {
        self.pod_uid_to_cn.insert(pod_uid.into(), cn);
    }

    /// Release the certificate mapping for a deleted pod, returning the
    /// common name if one was recorded.
    pub fn release_cn(&self, pod_uid: &str) -> Option<CommonName> {
        match self.pod_uid_to_cn.remove(pod_uid) {
            Some((_, cn)) => Some(cn),
            None => {
                warn!(pod_uid, "no certificate recorded for deleted pod");
                None
            }
        }
    }
}

impl std::fmt::Debug for ProxyRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyRegistry")
            .field("connected", &self.connected_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mesh_core::{ProxyKind, SerialNumber};

    fn proxy(cn: &str) -> Arc<Proxy> {
        Arc::new(Proxy::new(
            CommonName::from(cn),
            SerialNumber::from("serial"),
            None,
            ProxyKind::Sidecar,
        ))
    }

    fn registry() -> ProxyRegistry {
        ProxyRegistry::new(Arc::new(ExplicitProxyServiceMapper::new()))
    }

    #[test]
    fn register_is_idempotent() {
        let registry = registry();
        let p = proxy("a.ns.cluster.local");

        registry.register(Arc::clone(&p));
        registry.register(Arc::clone(&p));

        assert_eq!(registry.connected_count(), 1);
    }

    #[test]
    fn unregister_decrements_exactly_once() {
        let registry = registry();
        let p = proxy("a.ns.cluster.local");

        registry.register(Arc::clone(&p));
        registry.unregister(&p);
        registry.unregister(&p);

        assert_eq!(registry.connected_count(), 0);
    }

    #[test]
    fn lookup_by_connection_id() {
        let registry = registry();
        let p = proxy("a.ns.cluster.local");
        registry.register(Arc::clone(&p));

        let found = registry.get(p.connection_id()).unwrap();
        assert_eq!(found.connection_id(), p.connection_id());
    }

    #[test]
    fn list_services_without_pod_is_not_found() {
        let registry = registry();
        let p = proxy("a.ns.cluster.local");

        assert!(matches!(
            registry.list_services(&p),
            Err(MeshError::PodNotFound { .. })
        ));
    }

    #[test]
    fn list_services_with_pod_uses_mapper() {
        let cn = CommonName::from("a.ns.cluster.local");
        let mapper = ExplicitProxyServiceMapper::new()
            .with_services(cn.clone(), vec![MeshService::new("ns", "svc-a")]);
        let registry = ProxyRegistry::new(Arc::new(mapper));

        let p = proxy("a.ns.cluster.local");
        p.set_pod_metadata(mesh_core::PodMetadata {
            uid: "uid-1".to_string(),
            name: "pod-1".to_string(),
            namespace: "ns".to_string(),
            service_account: mesh_core::ServiceIdentity::new("a", "ns"),
            workload_kind: "Deployment".to_string(),
            workload_name: "svc-a".to_string(),
        });

        let services = registry.list_services(&p).unwrap();
        assert_eq!(services, vec![MeshService::new("ns", "svc-a")]);
    }

    #[test]
    fn pod_to_cn_round_trip() {
        let registry = registry();
        let cn = CommonName::from("a.ns.cluster.local");

        registry.record_pod_to_cn("uid-1", cn.clone());
        assert_eq!(registry.release_cn("uid-1"), Some(cn));
        // Second release finds nothing.
        assert_eq!(registry.release_cn("uid-1"), None);
    }
}
