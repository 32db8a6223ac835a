//! Type URIs for the served discovery resource kinds.

use std::fmt;

use crate::MeshError;

/// Type URL for Cluster (CDS).
pub const CLUSTER_TYPE_URL: &str = "type.googleapis.com/envoy.config.cluster.v3.Cluster";

/// Type URL for ClusterLoadAssignment (EDS).
pub const ENDPOINT_TYPE_URL: &str =
    "type.googleapis.com/envoy.config.endpoint.v3.ClusterLoadAssignment";

/// Type URL for Listener (LDS).
pub const LISTENER_TYPE_URL: &str = "type.googleapis.com/envoy.config.listener.v3.Listener";

/// Type URL for RouteConfiguration (RDS).
pub const ROUTE_TYPE_URL: &str = "type.googleapis.com/envoy.config.route.v3.RouteConfiguration";

/// Type URL for Secret (SDS).
pub const SECRET_TYPE_URL: &str =
    "type.googleapis.com/envoy.extensions.transport_sockets.tls.v3.Secret";

/// The configuration resource kinds served over the aggregated stream.
///
/// CDS and LDS are wildcard types: Envoy always subscribes to all resources
/// of those kinds, so resource names in their requests carry no meaning.
/// The remaining kinds are client-subscribed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TypeUri {
    /// Cluster discovery (CDS), wildcard.
    Cluster,
    /// Endpoint discovery (EDS).
    ClusterLoadAssignment,
    /// Listener discovery (LDS), wildcard.
    Listener,
    /// Route discovery (RDS).
    RouteConfiguration,
    /// Secret discovery (SDS).
    Secret,
}

impl TypeUri {
    /// All served type URIs.
    pub const ALL: [TypeUri; 5] = [
        TypeUri::Cluster,
        TypeUri::ClusterLoadAssignment,
        TypeUri::Listener,
        TypeUri::RouteConfiguration,
        TypeUri::Secret,
    ];

    /// The type URIs regenerated on a control-plane broadcast.
    ///
    /// SDS is excluded: secret updates are driven by certificate-rotation
    /// events, and Envoy requests the secrets it needs on its own.
    pub const BROADCAST: [TypeUri; 4] = [
        TypeUri::Cluster,
        TypeUri::ClusterLoadAssignment,
        TypeUri::Listener,
        TypeUri::RouteConfiguration,
    ];

    /// Resolve a wire type URL to a served type URI.
    pub fn from_type_url(type_url: &str) -> Result<Self, MeshError> {
        match type_url {
            CLUSTER_TYPE_URL => Ok(TypeUri::Cluster),
            ENDPOINT_TYPE_URL => Ok(TypeUri::ClusterLoadAssignment),
            LISTENER_TYPE_URL => Ok(TypeUri::Listener),
            ROUTE_TYPE_URL => Ok(TypeUri::RouteConfiguration),
            SECRET_TYPE_URL => Ok(TypeUri::Secret),
            other => Err(MeshError::UnknownTypeUrl {
                type_url: other.to_string(),
            }),
        }
    }

    /// The full wire type URL.
    #[must_use]
    pub fn type_url(&self) -> &'static str {
        match self {
            TypeUri::Cluster => CLUSTER_TYPE_URL,
            TypeUri::ClusterLoadAssignment => ENDPOINT_TYPE_URL,
            TypeUri::Listener => LISTENER_TYPE_URL,
            TypeUri::RouteConfiguration => ROUTE_TYPE_URL,
            TypeUri::Secret => SECRET_TYPE_URL,
        }
    }

    /// The conventional short name (CDS, EDS, LDS, RDS, SDS).
    #[must_use]
    pub fn short_name(&self) -> &'static str {
        match self {
            TypeUri::Cluster => "CDS",
            TypeUri::ClusterLoadAssignment => "EDS",
            TypeUri::Listener => "LDS",
            TypeUri::RouteConfiguration => "RDS",
            TypeUri::Secret => "SDS",
        }
    }

    /// Whether subscription semantics are "all resources of this kind".
    ///
    /// Resource-name sets in requests for wildcard types must not be used
    /// for delta detection.
    #[must_use]
    pub fn is_wildcard(&self) -> bool {
        matches!(self, TypeUri::Cluster | TypeUri::Listener)
    }
}

impl fmt::Display for TypeUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.short_name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_all_type_urls() {
        for t in TypeUri::ALL {
            assert_eq!(TypeUri::from_type_url(t.type_url()).unwrap(), t);
        }
    }

    #[test]
    fn unknown_type_url_is_rejected() {
        let err = TypeUri::from_type_url("type.googleapis.com/envoy.api.v2.Cluster");
        assert!(matches!(err, Err(MeshError::UnknownTypeUrl { .. })));
    }

    #[test]
    fn wildcard_classification() {
        assert!(TypeUri::Cluster.is_wildcard());
        assert!(TypeUri::Listener.is_wildcard());
        assert!(!TypeUri::ClusterLoadAssignment.is_wildcard());
        assert!(!TypeUri::RouteConfiguration.is_wildcard());
        assert!(!TypeUri::Secret.is_wildcard());
    }

    #[test]
    fn broadcast_excludes_secrets() {
        assert!(!TypeUri::BROADCAST.contains(&TypeUri::Secret));
        assert_eq!(TypeUri::BROADCAST.len(), 4);
    }
}
