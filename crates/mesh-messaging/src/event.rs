//! The event model shared by every control-plane component.
//!
//! Events are a tagged union: a [`Topic`] plus optional old/new object
//! handles. Watchers publish one event per observed change; components
//! subscribe to the topics they care about.

use std::fmt;

use mesh_core::{CommonName, PodMetadata, SerialNumber};

/// Everything that can be announced on the bus.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[allow(missing_docs)]
pub enum Topic {
    PodAdded,
    PodDeleted,
    PodUpdated,
    EndpointAdded,
    EndpointDeleted,
    EndpointUpdated,
    NamespaceAdded,
    NamespaceDeleted,
    NamespaceUpdated,
    ServiceAdded,
    ServiceDeleted,
    ServiceUpdated,
    ServiceAccountAdded,
    ServiceAccountDeleted,
    ServiceAccountUpdated,
    RouteGroupAdded,
    RouteGroupDeleted,
    RouteGroupUpdated,
    TrafficSplitAdded,
    TrafficSplitDeleted,
    TrafficSplitUpdated,
    TrafficTargetAdded,
    TrafficTargetDeleted,
    TrafficTargetUpdated,
    IngressAdded,
    IngressDeleted,
    IngressUpdated,
    TcpRouteAdded,
    TcpRouteDeleted,
    TcpRouteUpdated,
    EgressAdded,
    EgressDeleted,
    EgressUpdated,
    IngressBackendAdded,
    IngressBackendDeleted,
    IngressBackendUpdated,
    /// Another component requests a coalesced global proxy update.
    ScheduleProxyBroadcast,
    /// The dispatcher's coalesced "update every proxy" announcement.
    ProxyBroadcast,
    /// A workload certificate was rotated by the certificate provider.
    CertificateRotated,
}

impl Topic {
    /// The catalog-change topics the dispatcher watches for deltas.
    ///
    /// `ScheduleProxyBroadcast` is subscribed separately and unconditionally
    /// schedules; `ProxyBroadcast` and `CertificateRotated` are outputs, not
    /// inputs.
    pub const POLICY_CHANGES: [Topic; 36] = [
        Topic::PodAdded,
        Topic::PodDeleted,
        Topic::PodUpdated,
        Topic::EndpointAdded,
        Topic::EndpointDeleted,
        Topic::EndpointUpdated,
        Topic::NamespaceAdded,
        Topic::NamespaceDeleted,
        Topic::NamespaceUpdated,
        Topic::ServiceAdded,
        Topic::ServiceDeleted,
        Topic::ServiceUpdated,
        Topic::ServiceAccountAdded,
        Topic::ServiceAccountDeleted,
        Topic::ServiceAccountUpdated,
        Topic::RouteGroupAdded,
        Topic::RouteGroupDeleted,
        Topic::RouteGroupUpdated,
        Topic::TrafficSplitAdded,
        Topic::TrafficSplitDeleted,
        Topic::TrafficSplitUpdated,
        Topic::TrafficTargetAdded,
        Topic::TrafficTargetDeleted,
        Topic::TrafficTargetUpdated,
        Topic::IngressAdded,
        Topic::IngressDeleted,
        Topic::IngressUpdated,
        Topic::TcpRouteAdded,
        Topic::TcpRouteDeleted,
        Topic::TcpRouteUpdated,
        Topic::EgressAdded,
        Topic::EgressDeleted,
        Topic::EgressUpdated,
        Topic::IngressBackendAdded,
        Topic::IngressBackendDeleted,
        Topic::IngressBackendUpdated,
    ];

    /// Whether this topic is the `updated` variant of a watched kind.
    #[must_use]
    pub fn is_update(&self) -> bool {
        matches!(
            self,
            Topic::PodUpdated
                | Topic::EndpointUpdated
                | Topic::NamespaceUpdated
                | Topic::ServiceUpdated
                | Topic::ServiceAccountUpdated
                | Topic::RouteGroupUpdated
                | Topic::TrafficSplitUpdated
                | Topic::TrafficTargetUpdated
                | Topic::IngressUpdated
                | Topic::TcpRouteUpdated
                | Topic::EgressUpdated
                | Topic::IngressBackendUpdated
        )
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// A certificate as seen in rotation announcements.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CertificateSummary {
    /// Common name of the rotated certificate.
    pub common_name: CommonName,
    /// Serial number of the new certificate.
    pub serial_number: SerialNumber,
}

/// An object carried by an event.
///
/// The topics the core consumes directly (pods, certificates) carry typed
/// payloads; catalog policy objects travel as JSON values, which gives the
/// dispatcher structural equality for its delta filter without the bus
/// knowing every policy schema.
#[derive(Clone, Debug, PartialEq)]
pub enum ObjectHandle {
    /// A workload pod.
    Pod(PodMetadata),
    /// A workload certificate.
    Certificate(CertificateSummary),
    /// An opaque catalog object.
    Raw(serde_json::Value),
}

/// An announcement on the bus.
#[derive(Clone, Debug, PartialEq)]
pub struct Event {
    /// What happened.
    pub topic: Topic,
    /// The object before the change, when the watcher had one.
    pub old_obj: Option<ObjectHandle>,
    /// The object after the change, when the watcher had one.
    pub new_obj: Option<ObjectHandle>,
}

impl Event {
    /// An event with no payload.
    #[must_use]
    pub fn new(topic: Topic) -> Self {
        Self {
            topic,
            old_obj: None,
            new_obj: None,
        }
    }

    /// An event carrying old/new object handles.
    #[must_use]
    pub fn with_objects(
        topic: Topic,
        old_obj: Option<ObjectHandle>,
        new_obj: Option<ObjectHandle>,
    ) -> Self {
        Self {
            topic,
            old_obj,
            new_obj,
        }
    }

    /// Whether this event represents an actual change in configuration.
    ///
    /// Informer resyncs re-announce unchanged objects as `updated` events;
    /// those must not schedule proxy updates.
    #[must_use]
    pub fn is_delta(&self) -> bool {
        !(self.topic.is_update() && self.old_obj == self.new_obj)
    }
}
