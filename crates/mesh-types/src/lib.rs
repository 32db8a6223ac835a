//! # mesh-types
//!
//! Vendored protobuf types for the Envoy discovery protocol.
//!
//! The `proto/` directory carries a trimmed copy of the upstream
//! data-plane-api definitions (only the fields the control plane consumes;
//! field numbers are unchanged, so the wire format stays compatible with
//! unmodified Envoy sidecars). The Rust sources under `src/generated/` are
//! the committed `tonic-build` output for those files, so building this
//! crate does not require a protobuf toolchain.

#![deny(unsafe_code)]

/// Types generated from the `envoy.*` proto packages.
pub mod envoy {
    /// `envoy.service.*`.
    pub mod service {
        /// `envoy.service.discovery.*`.
        pub mod discovery {
            /// `envoy.service.discovery.v3`.
            pub mod v3 {
                include!("generated/envoy.service.discovery.v3.rs");
            }
        }
    }
}

/// Types generated from the `google.rpc` proto package.
pub mod google {
    /// `google.rpc`.
    pub mod rpc {
        include!("generated/google.rpc.rs");
    }
}

pub use envoy::service::discovery::v3::{
    aggregated_discovery_service_client, aggregated_discovery_service_server, DiscoveryRequest,
    DiscoveryResponse, Node,
};
