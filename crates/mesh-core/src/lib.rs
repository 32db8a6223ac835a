//! # mesh-core
//!
//! Core types for the meshwire control plane:
//!
//! - [`MeshError`] - Error type shared across the control-plane crates,
//!   with gRPC status mapping for stream-terminating failures
//! - [`TypeUri`] - The served discovery resource kinds and their wildcard
//!   classification
//! - [`CommonName`] / [`ServiceIdentity`] - Workload identity derived from
//!   certificate common names
//! - [`Proxy`] - A connected data-plane peer and its per-type-URI protocol
//!   state
//!
//! ## Example
//!
//! ```rust
//! use mesh_core::{CommonName, ServiceIdentity, TypeUri};
//!
//! let cn = CommonName::from("bookstore-sa.bookstore.cluster.local");
//! assert_eq!(
//!     cn.identity().unwrap(),
//!     ServiceIdentity::new("bookstore-sa", "bookstore"),
//! );
//! assert!(TypeUri::Cluster.is_wildcard());
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod error;
mod identity;
mod proxy;
mod service;
mod type_uri;

pub use error::MeshError;
pub use identity::{CommonName, SerialNumber, ServiceIdentity};
pub use proxy::{ConnectionId, PodMetadata, Proxy, ProxyKind, TypeUriState};
pub use service::MeshService;
pub use type_uri::{
    TypeUri, CLUSTER_TYPE_URL, ENDPOINT_TYPE_URL, LISTENER_TYPE_URL, ROUTE_TYPE_URL,
    SECRET_TYPE_URL,
};

/// Result type alias using [`MeshError`].
pub type Result<T> = std::result::Result<T, MeshError>;
