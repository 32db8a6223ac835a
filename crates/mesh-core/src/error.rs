//! Error types for control-plane operations.
//!
//! This module provides [`MeshError`], the error type shared across the
//! control-plane crates, with a mapping to [`tonic::Status`] for the
//! stream-terminating variants.

/// Error type for control-plane operations.
///
/// Stream-terminating variants (`Unauthenticated`, `TooManyConnections`,
/// `ServiceAccountMismatch`, `StreamClosed`) convert to the gRPC status the
/// proxy sees; the remaining variants stay internal and are logged at the
/// point they occur.
#[derive(Debug, thiserror::Error)]
pub enum MeshError {
    /// The transport did not present a usable client identity.
    #[error("unauthenticated peer: {reason}")]
    Unauthenticated {
        /// Why the peer identity could not be established.
        reason: String,
    },

    /// The configured data-plane connection cap would be exceeded.
    #[error("too many data plane connections: {connected} connected, limit {limit}")]
    TooManyConnections {
        /// Currently connected proxies.
        connected: usize,
        /// Configured connection limit.
        limit: usize,
    },

    /// The certificate's service account does not match the pod's.
    #[error("service account mismatch: certificate says {certificate}, pod says {pod}")]
    ServiceAccountMismatch {
        /// Identity derived from the certificate common name.
        certificate: String,
        /// Service account recorded on the pod.
        pod: String,
    },

    /// No pod could be found for the proxy's certificate.
    #[error("no pod found for common name {common_name}")]
    PodNotFound {
        /// The certificate common name that was looked up.
        common_name: String,
    },

    /// A certificate common name did not follow the
    /// `<service-account>.<namespace>.<trust-domain>` grammar.
    #[error("invalid certificate common name: {common_name}")]
    InvalidCertificateCommonName {
        /// The offending common name.
        common_name: String,
    },

    /// A discovery request carried an unrecognized type URL.
    #[error("unknown type URL: {type_url}")]
    UnknownTypeUrl {
        /// The type URL as received.
        type_url: String,
    },

    /// `version_info` on a discovery request was not an unsigned decimal.
    #[error("unparseable version_info {version_info:?}")]
    VersionParse {
        /// The version string as received.
        version_info: String,
        /// Parse failure.
        #[source]
        source: std::num::ParseIntError,
    },

    /// The response builder failed for a type URI.
    #[error("building {type_uri} resources failed: {message}")]
    BuildFailed {
        /// Type URI being built.
        type_uri: String,
        /// Builder-reported failure.
        message: String,
    },

    /// The stream to the proxy closed while a response was in flight.
    #[error("stream closed: {reason}")]
    StreamClosed {
        /// Reason for the closure.
        reason: String,
    },

    /// Invalid configuration supplied to a builder.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Unexpected internal failure.
    #[error("internal error: {message}")]
    Internal {
        /// Error message.
        message: String,
    },
}

impl From<MeshError> for tonic::Status {
    fn from(err: MeshError) -> Self {
        match &err {
            MeshError::Unauthenticated { .. } => tonic::Status::unauthenticated(err.to_string()),
            MeshError::TooManyConnections { .. } => {
                tonic::Status::resource_exhausted(err.to_string())
            }
            MeshError::ServiceAccountMismatch { .. } => {
                tonic::Status::permission_denied(err.to_string())
            }
            MeshError::PodNotFound { .. } => tonic::Status::not_found(err.to_string()),
            MeshError::InvalidCertificateCommonName { .. }
            | MeshError::UnknownTypeUrl { .. }
            | MeshError::VersionParse { .. }
            | MeshError::Configuration(_) => tonic::Status::invalid_argument(err.to_string()),
            MeshError::StreamClosed { .. } => tonic::Status::unavailable(err.to_string()),
            MeshError::BuildFailed { .. } | MeshError::Internal { .. } => {
                tonic::Status::internal(err.to_string())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unauthenticated_maps_to_unauthenticated() {
        let err = MeshError::Unauthenticated {
            reason: "no client certificate".to_string(),
        };
        let status: tonic::Status = err.into();
        assert_eq!(status.code(), tonic::Code::Unauthenticated);
    }

    #[test]
    fn connection_cap_maps_to_resource_exhausted() {
        let err = MeshError::TooManyConnections {
            connected: 500,
            limit: 500,
        };
        let status: tonic::Status = err.into();
        assert_eq!(status.code(), tonic::Code::ResourceExhausted);
        assert!(status.message().contains("500"));
    }

    #[test]
    fn mismatch_maps_to_permission_denied() {
        let err = MeshError::ServiceAccountMismatch {
            certificate: "bookstore/default".to_string(),
            pod: "bookstore/bookstore-sa".to_string(),
        };
        let status: tonic::Status = err.into();
        assert_eq!(status.code(), tonic::Code::PermissionDenied);
    }
}
