//! Certificate disposal for deleted pods.
//!
//! A singleton that bridges pod-deletion announcements to the certificate
//! provider: release the pod's certificate and nudge the dispatcher. The
//! dispatcher also watches pod deletions directly, so the nudge usually
//! coalesces into the same broadcast.

use std::sync::Arc;

use tracing::{debug, info, warn};

use mesh_core::CommonName;
use mesh_messaging::{Broker, Event, ObjectHandle, ShutdownSignal, Topic};

use crate::registry::ProxyRegistry;

/// Disposes certificates when their workloads go away.
///
/// Implemented by the certificate provider integration, outside the core.
pub trait CertificateManager: Send + Sync + 'static {
    /// Release the certificate issued for `common_name`.
    fn release_certificate(&self, common_name: &CommonName);
}

/// The pod-deletion to certificate-release bridge. One per process.
pub struct CertificateReleaseHandler {
    registry: Arc<ProxyRegistry>,
    broker: Broker,
    manager: Arc<dyn CertificateManager>,
}

impl CertificateReleaseHandler {
    /// Create the handler over the given registry and certificate manager.
    pub fn new(
        registry: Arc<ProxyRegistry>,
        broker: Broker,
        manager: Arc<dyn CertificateManager>,
    ) -> Self {
        Self {
            registry,
            broker,
            manager,
        }
    }

    /// Spawn the handler loop; it runs until `shutdown` triggers or the bus
    /// closes.
    pub fn spawn(self, shutdown: ShutdownSignal) -> tokio::task::JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }

    /// Run the handler loop on the current task.
    pub async fn run(self, mut shutdown: ShutdownSignal) {
        let mut deletions = self.broker.subscribe([Topic::PodDeleted]);

        info!("certificate release handler started");

        loop {
            tokio::select! {
                _ = shutdown.wait() => {
                    debug!("certificate release handler stopping");
                    break;
                }

                maybe_event = deletions.recv() => {
                    let Some(event) = maybe_event else {
                        warn!("event bus closed, certificate release handler stopping");
                        break;
                    };
                    self.handle_pod_deleted(&event);
                }
            }
        }
    }

    fn handle_pod_deleted(&self, event: &Event) {
        let Some(ObjectHandle::Pod(pod)) = &event.old_obj else {
            warn!(topic = %event.topic, "pod-deleted event without pod payload");
            return;
        };

        match self.registry.release_cn(&pod.uid) {
            Some(common_name) => {
                warn!(
                    pod_uid = %pod.uid,
                    pod = %pod.name,
                    cn = %common_name,
                    "pod deleted, releasing certificate"
                );
                self.manager.release_certificate(&common_name);

                // Nudge the dispatcher; coalescing makes the double trigger
                // (it also sees PodDeleted) harmless.
                self.broker
                    .publish(Event::new(Topic::ScheduleProxyBroadcast));
            }
            None => {
                // release_cn already logged the miss.
            }
        }
    }
}

impl std::fmt::Debug for CertificateReleaseHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertificateReleaseHandler")
            .field("registry", &self.registry)
            .finish()
    }
}
