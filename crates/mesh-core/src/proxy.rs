//! The connected-proxy model and its per-type-URI protocol state.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, RwLock};
use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::identity::{CommonName, SerialNumber, ServiceIdentity};
use crate::type_uri::TypeUri;
use crate::MeshError;

/// Unique identifier for a proxy connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Generate a new unique connection ID.
    pub fn next() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the numeric value.
    #[inline]
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// The flavor of data-plane peer behind a connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProxyKind {
    /// A sidecar fronting a workload pod.
    Sidecar,
    /// A mesh gateway; has no backing pod.
    Gateway,
}

impl fmt::Display for ProxyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProxyKind::Sidecar => write!(f, "sidecar"),
            ProxyKind::Gateway => write!(f, "gateway"),
        }
    }
}

/// Metadata about the pod a sidecar proxy fronts.
///
/// Populated after registration from the catalog lookup; absent for
/// gateways and for proxies whose pod could not be found.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PodMetadata {
    /// Pod UID.
    pub uid: String,
    /// Pod name.
    pub name: String,
    /// Pod namespace.
    pub namespace: String,
    /// Service account the pod runs as.
    pub service_account: ServiceIdentity,
    /// Kind of the controlling workload (Deployment, StatefulSet, ...).
    pub workload_kind: String,
    /// Name of the controlling workload.
    pub workload_name: String,
}

/// Per-type-URI discovery state for one proxy.
#[derive(Clone, Debug, Default)]
pub struct TypeUriState {
    /// Version carried by the most recent response on this type URI.
    pub last_sent_version: u64,
    /// Version the proxy most recently ACKed.
    pub last_applied_version: u64,
    /// Nonce carried by the most recent response; empty until the first
    /// response is written.
    pub last_sent_nonce: String,
    /// Resource names the proxy is subscribed to. Meaningless for wildcard
    /// type URIs.
    pub subscribed_resources: BTreeSet<String>,
    /// Resource names actually emitted in the most recent response.
    pub last_sent_resources: BTreeSet<String>,
}

/// A connected data-plane proxy.
///
/// Identity fields are fixed at stream acceptance. Pod metadata is written
/// once, right after registration. The per-type-URI state is mutated only
/// by the proxy's own stream task and by the single in-flight response job
/// that task awaits, so a plain mutex is sufficient.
#[derive(Debug)]
pub struct Proxy {
    connection_id: ConnectionId,
    common_name: CommonName,
    serial_number: SerialNumber,
    remote_addr: Option<SocketAddr>,
    kind: ProxyKind,
    connected_at: Instant,
    pod_metadata: RwLock<Option<PodMetadata>>,
    states: Mutex<HashMap<TypeUri, TypeUriState>>,
}

impl Proxy {
    /// Create a proxy for a newly accepted stream.
    pub fn new(
        common_name: CommonName,
        serial_number: SerialNumber,
        remote_addr: Option<SocketAddr>,
        kind: ProxyKind,
    ) -> Self {
        Self {
            connection_id: ConnectionId::next(),
            common_name,
            serial_number,
            remote_addr,
            kind,
            connected_at: Instant::now(),
            pod_metadata: RwLock::new(None),
            states: Mutex::new(HashMap::new()),
        }
    }

    /// The unique connection ID for this stream.
    #[inline]
    pub fn connection_id(&self) -> ConnectionId {
        self.connection_id
    }

    /// The certificate common name bound at stream acceptance.
    #[inline]
    pub fn common_name(&self) -> &CommonName {
        &self.common_name
    }

    /// The certificate serial number bound at stream acceptance.
    #[inline]
    pub fn serial_number(&self) -> &SerialNumber {
        &self.serial_number
    }

    /// The peer's remote address, when the transport knows it.
    #[inline]
    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    /// Whether this proxy is a sidecar or a gateway.
    #[inline]
    pub fn kind(&self) -> ProxyKind {
        self.kind
    }

    /// When the stream was accepted.
    #[inline]
    pub fn connected_at(&self) -> Instant {
        self.connected_at
    }

    /// The workload identity encoded in the certificate common name.
    pub fn identity(&self) -> Result<ServiceIdentity, MeshError> {
        self.common_name.identity()
    }

    /// Pod metadata, if a pod was found for this proxy.
    pub fn pod_metadata(&self) -> Option<PodMetadata> {
        self.pod_metadata
            .read()
            .expect("pod metadata lock poisoned")
            .clone()
    }

    /// Record pod metadata after a successful catalog lookup.
    pub fn set_pod_metadata(&self, metadata: PodMetadata) {
        *self
            .pod_metadata
            .write()
            .expect("pod metadata lock poisoned") = Some(metadata);
    }

    /// Version carried by the most recent response for `type_uri`.
    pub fn last_sent_version(&self, type_uri: TypeUri) -> u64 {
        self.with_state(type_uri, |s| s.last_sent_version)
    }

    /// Version the proxy most recently ACKed for `type_uri`.
    pub fn last_applied_version(&self, type_uri: TypeUri) -> u64 {
        self.with_state(type_uri, |s| s.last_applied_version)
    }

    /// Nonce of the most recent response for `type_uri`; empty until the
    /// first response is written.
    pub fn last_sent_nonce(&self, type_uri: TypeUri) -> String {
        self.with_state(type_uri, |s| s.last_sent_nonce.clone())
    }

    /// Resource names the proxy is subscribed to on `type_uri`.
    pub fn subscribed_resources(&self, type_uri: TypeUri) -> BTreeSet<String> {
        self.with_state(type_uri, |s| s.subscribed_resources.clone())
    }

    /// Resource names emitted in the most recent response for `type_uri`.
    pub fn last_sent_resources(&self, type_uri: TypeUri) -> BTreeSet<String> {
        self.with_state(type_uri, |s| s.last_sent_resources.clone())
    }

    /// Replace the subscription set for `type_uri`.
    pub fn set_subscribed_resources(&self, type_uri: TypeUri, resources: BTreeSet<String>) {
        self.with_state_mut(type_uri, |s| s.subscribed_resources = resources);
    }

    /// Record the version the proxy reports as applied.
    pub fn set_last_applied_version(&self, type_uri: TypeUri, version: u64) {
        self.with_state_mut(type_uri, |s| s.last_applied_version = version);
    }

    /// Adopt protocol state from a proxy that was previously connected to a
    /// different control plane: seed both version counters from the
    /// proxy-reported version so the next response continues the sequence.
    pub fn adopt_peer_version(&self, type_uri: TypeUri, version: u64) {
        self.with_state_mut(type_uri, |s| {
            s.last_sent_version = version;
            s.last_applied_version = version;
        });
    }

    /// The version the next response on `type_uri` will carry.
    pub fn next_version(&self, type_uri: TypeUri) -> u64 {
        self.with_state(type_uri, |s| s.last_sent_version + 1)
    }

    /// Commit per-type state after a response has been written to the
    /// stream. Not called on build or write failure, so state always
    /// reflects what the proxy could actually have received.
    pub fn commit_response(
        &self,
        type_uri: TypeUri,
        version: u64,
        nonce: String,
        resources: BTreeSet<String>,
    ) {
        self.with_state_mut(type_uri, |s| {
            s.last_sent_version = version;
            s.last_sent_nonce = nonce;
            s.last_sent_resources = resources;
        });
    }

    /// Whether this proxy has received at least one CDS or LDS response.
    ///
    /// A proxy that has not is still in its init phase and must not be sent
    /// control-plane-initiated updates: any version issued now would be
    /// superseded by the version its first empty-nonce request produces.
    pub fn ready_for_broadcast(&self) -> bool {
        !self.last_sent_nonce(TypeUri::Listener).is_empty()
            || !self.last_sent_nonce(TypeUri::Cluster).is_empty()
    }

    fn with_state<R>(&self, type_uri: TypeUri, f: impl FnOnce(&TypeUriState) -> R) -> R {
        let mut states = self.states.lock().expect("proxy state lock poisoned");
        f(states.entry(type_uri).or_default())
    }

    fn with_state_mut<R>(&self, type_uri: TypeUri, f: impl FnOnce(&mut TypeUriState) -> R) -> R {
        let mut states = self.states.lock().expect("proxy state lock poisoned");
        f(states.entry(type_uri).or_default())
    }
}

impl fmt::Display for Proxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{} kind={} cn={} serial={}]",
            self.connection_id, self.kind, self.common_name, self.serial_number
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sidecar() -> Proxy {
        Proxy::new(
            CommonName::from("bookstore-sa.bookstore.cluster.local"),
            SerialNumber::from("abc123"),
            None,
            ProxyKind::Sidecar,
        )
    }

    #[test]
    fn connection_ids_unique() {
        let a = ConnectionId::next();
        let b = ConnectionId::next();
        assert_ne!(a, b);
    }

    #[test]
    fn fresh_proxy_state_is_zeroed() {
        let proxy = sidecar();
        assert_eq!(proxy.last_sent_version(TypeUri::Cluster), 0);
        assert_eq!(proxy.last_applied_version(TypeUri::Cluster), 0);
        assert!(proxy.last_sent_nonce(TypeUri::Cluster).is_empty());
        assert!(proxy.subscribed_resources(TypeUri::RouteConfiguration).is_empty());
    }

    #[test]
    fn commit_response_advances_state() {
        let proxy = sidecar();
        let names: BTreeSet<String> = ["a", "b"].iter().map(|s| s.to_string()).collect();

        proxy.commit_response(TypeUri::RouteConfiguration, 1, "n1".to_string(), names.clone());

        assert_eq!(proxy.last_sent_version(TypeUri::RouteConfiguration), 1);
        assert_eq!(proxy.last_sent_nonce(TypeUri::RouteConfiguration), "n1");
        assert_eq!(proxy.last_sent_resources(TypeUri::RouteConfiguration), names);
        assert_eq!(proxy.next_version(TypeUri::RouteConfiguration), 2);
        // Other type URIs are untouched.
        assert_eq!(proxy.last_sent_version(TypeUri::Cluster), 0);
    }

    #[test]
    fn adopt_peer_version_seeds_both_counters() {
        let proxy = sidecar();
        proxy.adopt_peer_version(TypeUri::Listener, 42);

        assert_eq!(proxy.last_sent_version(TypeUri::Listener), 42);
        assert_eq!(proxy.last_applied_version(TypeUri::Listener), 42);
        assert_eq!(proxy.next_version(TypeUri::Listener), 43);
    }

    #[test]
    fn broadcast_readiness_requires_cds_or_lds_nonce() {
        let proxy = sidecar();
        assert!(!proxy.ready_for_broadcast());

        proxy.commit_response(TypeUri::Cluster, 1, "n1".to_string(), BTreeSet::new());
        assert!(proxy.ready_for_broadcast());
    }

    #[test]
    fn pod_metadata_set_once() {
        let proxy = sidecar();
        assert!(proxy.pod_metadata().is_none());

        proxy.set_pod_metadata(PodMetadata {
            uid: "uid-1".to_string(),
            name: "bookstore-7d4f".to_string(),
            namespace: "bookstore".to_string(),
            service_account: ServiceIdentity::new("bookstore-sa", "bookstore"),
            workload_kind: "Deployment".to_string(),
            workload_name: "bookstore".to_string(),
        });

        assert_eq!(proxy.pod_metadata().unwrap().uid, "uid-1");
    }
}
