//! # meshwire
//!
//! The xDS control-plane core of a service mesh: a long-lived aggregated
//! discovery endpoint that configures Envoy-compatible sidecars from a
//! catalog of mesh policy.
//!
//! ## Quick start
//!
//! ```rust,ignore
//! use meshwire::prelude::*;
//!
//! let server = XdsServer::builder()
//!     .response_builder(builder)          // policy -> wire resources
//!     .workload_catalog(catalog)          // certificate CN -> pod
//!     .certificate_manager(cert_manager)  // certificate disposal
//!     .max_data_plane_connections(2000)
//!     .build()?;
//!
//! server.start_singletons();
//! server.serve("[::]:15128".parse()?).await?;
//! ```
//!
//! ## Architecture
//!
//! The workspace is organized into several crates:
//!
//! - `mesh-core` - Proxy model, identities, type URIs, errors
//! - `mesh-types` - Vendored Envoy discovery protobuf types
//! - `mesh-messaging` - Event bus and the broadcast-coalescing dispatcher
//! - `mesh-xds` - Registry, work queue and the ADS stream state machine
//!
//! This crate re-exports all public APIs for convenience.
//!
//! ## Design principles
//!
//! 1. **No panics in library code** - All errors are returned as `Result`
//! 2. **Channels over shared flags** - Stream tasks coordinate through
//!    bounded channels and channel closure
//! 3. **State advances only on success** - Per-proxy protocol state is
//!    committed after a response reaches the stream, never before

#![deny(unsafe_code)]

pub use mesh_core::{
    CommonName, ConnectionId, MeshError, MeshService, PodMetadata, Proxy, ProxyKind,
    SerialNumber, ServiceIdentity, TypeUri,
};
pub use mesh_messaging::{
    Broker, CertificateSummary, DispatchConfig, Dispatcher, Event, ObjectHandle,
    ShutdownController, ShutdownSignal, Subscription, Topic,
};
pub use mesh_types::{DiscoveryRequest, DiscoveryResponse};
pub use mesh_xds::{
    AdsService, CertificateManager, CertificateReleaseHandler, ExplicitProxyServiceMapper,
    NamedResource, PeerIdentity, ProxyRegistry, ProxyServiceMapper, ResponseBuilder,
    ServerConfig, WorkloadCatalog, XdsServer, XdsServerBuilder,
};

/// Commonly used types, importable in one line.
pub mod prelude {
    pub use mesh_core::{CommonName, MeshError, Proxy, ProxyKind, ServiceIdentity, TypeUri};
    pub use mesh_messaging::{Broker, DispatchConfig, Event, ShutdownController, Topic};
    pub use mesh_xds::{
        CertificateManager, NamedResource, PeerIdentity, ResponseBuilder, ServerConfig,
        WorkloadCatalog, XdsServer, XdsServerBuilder,
    };
}
