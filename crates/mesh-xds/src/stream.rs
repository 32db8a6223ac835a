//! The per-connection ADS stream machinery.
//!
//! Each accepted stream runs two tasks: a receive task that decodes inbound
//! discovery requests into a channel, and the main loop that selects over
//! inbound requests, proxy-broadcast announcements and certificate
//! rotations. Any work that produces response bytes goes through the work
//! queue, and the loop always awaits the job's completion signal before
//! taking the next input, which serializes responses per proxy and
//! backpressures the stream.

use std::collections::BTreeSet;
use std::sync::Arc;

use futures::Stream;
use tokio::sync::mpsc;
use tokio_stream::StreamExt;
use tonic::Status;
use tracing::{debug, error, info, warn};

use mesh_core::{CommonName, Proxy, TypeUri};
use mesh_messaging::{Event, ObjectHandle, Subscription};
use mesh_types::DiscoveryRequest;

use crate::metrics::ProxyMetrics;
use crate::response::ResponseSender;
use crate::workqueue::{Job, WorkQueue};

/// Outcome of running a discovery request through the protocol state
/// machine.
#[derive(Debug, PartialEq, Eq)]
pub enum RequestDecision {
    /// Materialize and send a response for this type URI.
    Reply(TypeUri),
    /// Consume the request without responding.
    Ignore,
}

/// Run one discovery request through the xDS state machine.
///
/// Decides whether the request warrants a response and applies its side
/// effects (subscription updates, applied-version bookkeeping, reconnect
/// adoption) to the proxy's per-type state.
pub fn assess_request(
    proxy: &Proxy,
    request: &DiscoveryRequest,
    metrics: &ProxyMetrics,
) -> RequestDecision {
    // Reserved empty sentinel: consume without handling, but keep it
    // observable.
    if request.type_url.is_empty() {
        metrics.empty_type_url();
        debug!(proxy = %proxy, "ignoring empty type URL");
        return RequestDecision::Ignore;
    }

    let type_uri = match TypeUri::from_type_url(&request.type_url) {
        Ok(t) => t,
        Err(_) => {
            error!(proxy = %proxy, type_url = %request.type_url, "unknown type URL");
            return RequestDecision::Ignore;
        }
    };

    debug!(
        proxy = %proxy,
        type_uri = %type_uri,
        nonce = %request.response_nonce,
        version = %request.version_info,
        resources = ?request.resource_names,
        last_nonce = %proxy.last_sent_nonce(type_uri),
        last_version = proxy.last_sent_version(type_uri),
        "assessing discovery request"
    );

    // Empty version_info means no configuration applied yet.
    let request_version = if request.version_info.is_empty() {
        0
    } else {
        match request.version_info.parse::<u64>() {
            Ok(v) => v,
            Err(err) => {
                error!(
                    proxy = %proxy,
                    type_uri = %type_uri,
                    version = %request.version_info,
                    error = %err,
                    "unparseable version_info"
                );
                return RequestDecision::Ignore;
            }
        }
    };

    // NACK: the proxy rejected a previous response. Dropped for now; a
    // retry policy would hook in here with the nonce and reported version.
    if let Some(detail) = &request.error_detail {
        metrics.nack(type_uri.short_name());
        error!(
            proxy = %proxy,
            type_uri = %type_uri,
            nonce = %request.response_nonce,
            applied_version = request_version,
            error = %detail.message,
            "NACK received"
        );
        return RequestDecision::Ignore;
    }

    // First request on the stream for this type URI; always answered.
    if request.response_nonce.is_empty() {
        debug!(
            proxy = %proxy,
            type_uri = %type_uri,
            "first request on stream"
        );
        proxy.set_subscribed_resources(type_uri, requested_names(request));
        return RequestDecision::Reply(type_uri);
    }

    // Non-empty nonce we never issued: the proxy carries state from a
    // previous control-plane connection. Adopt its version so our next
    // response continues the sequence, and answer.
    let last_nonce = proxy.last_sent_nonce(type_uri);
    if last_nonce.is_empty() {
        debug!(
            proxy = %proxy,
            type_uri = %type_uri,
            adopted_version = request_version,
            "reconnected proxy, adopting reported version"
        );
        proxy.adopt_peer_version(type_uri, request_version);
        proxy.set_subscribed_resources(type_uri, requested_names(request));
        metrics.proxy_reconnected();
        return RequestDecision::Reply(type_uri);
    }

    // Requests for superseded responses carry a stale nonce; ignore them.
    if request.response_nonce != last_nonce {
        debug!(
            proxy = %proxy,
            type_uri = %type_uri,
            request_nonce = %request.response_nonce,
            current_nonce = %last_nonce,
            "ignoring stale nonce"
        );
        return RequestDecision::Ignore;
    }

    // Nonces match: this is an ACK, possibly with a changed subscription.
    proxy.set_last_applied_version(type_uri, request_version);

    // Wildcard types never carry meaningful resource names; the nonce alone
    // ACKs them.
    if type_uri.is_wildcard() {
        debug!(
            proxy = %proxy,
            type_uri = %type_uri,
            version = request_version,
            "ACK"
        );
        return RequestDecision::Ignore;
    }

    let requested = requested_names(request);
    proxy.set_subscribed_resources(type_uri, requested.clone());
    let last_sent = proxy.last_sent_resources(type_uri);

    if requested != last_sent {
        debug!(
            proxy = %proxy,
            type_uri = %type_uri,
            requested = ?requested,
            last_sent = ?last_sent,
            "subscription changed, responding"
        );
        return RequestDecision::Reply(type_uri);
    }

    debug!(
        proxy = %proxy,
        type_uri = %type_uri,
        version = request_version,
        "ACK with unchanged subscription"
    );
    RequestDecision::Ignore
}

fn requested_names(request: &DiscoveryRequest) -> BTreeSet<String> {
    request.resource_names.iter().cloned().collect()
}

/// Whether the rotated certificate belongs to this proxy's workload.
///
/// The rotated certificate's common name encodes the workload identity;
/// compare it against the identity in the proxy's own certificate.
pub(crate) fn is_cn_for_proxy(proxy: &Proxy, cn: &CommonName) -> bool {
    let Ok(proxy_identity) = proxy.identity() else {
        error!(proxy = %proxy, "proxy certificate has no parseable identity");
        return false;
    };
    match cn.identity() {
        Ok(identity) => identity == proxy_identity,
        Err(_) => false,
    }
}

/// Spawn the receive task: decode inbound requests into `tx` until the
/// stream errors or ends. Dropping `tx` is the quit signal the main loop
/// observes.
pub(crate) fn spawn_receiver<S>(
    mut inbound: S,
    tx: mpsc::Sender<DiscoveryRequest>,
    proxy: Arc<Proxy>,
) -> tokio::task::JoinHandle<()>
where
    S: Stream<Item = Result<DiscoveryRequest, Status>> + Send + Unpin + 'static,
{
    tokio::spawn(async move {
        loop {
            match inbound.next().await {
                Some(Ok(request)) => {
                    if tx.send(request).await.is_err() {
                        // Main loop is gone.
                        break;
                    }
                }
                Some(Err(status)) => {
                    warn!(proxy = %proxy, status = %status, "stream receive error");
                    break;
                }
                None => {
                    debug!(proxy = %proxy, "stream closed by proxy");
                    break;
                }
            }
        }
    })
}

/// Everything the main loop needs besides the stream itself.
pub(crate) struct StreamContext {
    pub proxy: Arc<Proxy>,
    pub workqueue: Arc<WorkQueue>,
    pub metrics: ProxyMetrics,
    pub broadcasts: Subscription,
    pub cert_rotations: Subscription,
}

/// The per-proxy main loop.
///
/// Selects over inbound requests, broadcast announcements and certificate
/// rotations; exits when the proxy hangs up, the response stream is
/// cancelled, or the bus shuts down.
pub(crate) async fn run_stream_loop(
    ctx: StreamContext,
    mut requests: mpsc::Receiver<DiscoveryRequest>,
    response_tx: ResponseSender,
) {
    let StreamContext {
        proxy,
        workqueue,
        metrics,
        mut broadcasts,
        mut cert_rotations,
    } = ctx;

    info!(proxy = %proxy, "ADS stream started");

    loop {
        tokio::select! {
            // The transport dropped the response stream: the peer is gone
            // or the server is shutting the connection down.
            _ = response_tx.closed() => {
                debug!(proxy = %proxy, "response stream cancelled");
                break;
            }

            maybe_request = requests.recv() => {
                let Some(request) = maybe_request else {
                    debug!(proxy = %proxy, "request channel closed");
                    break;
                };

                let RequestDecision::Reply(type_uri) =
                    assess_request(&proxy, &request, &metrics)
                else {
                    continue;
                };

                dispatch_job(&proxy, &workqueue, vec![type_uri], Some(request), &response_tx)
                    .await;
            }

            maybe_event = broadcasts.recv() => {
                if maybe_event.is_none() {
                    warn!(proxy = %proxy, "event bus closed, ending stream");
                    break;
                }
                info!(proxy = %proxy, "broadcast update received");

                // A proxy still in its init phase has no version sequence
                // for us to extend; its first requests will pull the
                // current snapshot anyway.
                if !proxy.ready_for_broadcast() {
                    warn!(
                        proxy = %proxy,
                        "proxy has not completed init, skipping broadcast push"
                    );
                    continue;
                }

                // Full configuration refresh, secrets excluded: Envoy asks
                // for the secrets it wants on its own.
                dispatch_job(&proxy, &workqueue, TypeUri::BROADCAST.to_vec(), None, &response_tx)
                    .await;
            }

            maybe_event = cert_rotations.recv() => {
                let Some(event) = maybe_event else {
                    warn!(proxy = %proxy, "event bus closed, ending stream");
                    break;
                };

                let Some(certificate) = rotated_certificate(&event) else {
                    warn!(proxy = %proxy, topic = %event.topic, "rotation event without certificate");
                    continue;
                };

                if is_cn_for_proxy(&proxy, &certificate) {
                    debug!(proxy = %proxy, cn = %certificate, "certificate rotated, refreshing secrets");
                    dispatch_job(&proxy, &workqueue, vec![TypeUri::Secret], None, &response_tx)
                        .await;
                }
            }
        }
    }

    info!(proxy = %proxy, "ADS stream ended");
}

fn rotated_certificate(event: &Event) -> Option<CommonName> {
    match &event.new_obj {
        Some(ObjectHandle::Certificate(certificate)) => Some(certificate.common_name.clone()),
        _ => None,
    }
}

/// Queue one job and wait for its completion signal.
///
/// The wait is load-bearing: it serializes this proxy's responses and
/// stalls inbound consumption while the pool is saturated. Job failures are
/// recovered by the proxy's next request or the next broadcast, so they are
/// logged and dropped here.
async fn dispatch_job(
    proxy: &Arc<Proxy>,
    workqueue: &WorkQueue,
    type_uris: Vec<TypeUri>,
    request: Option<DiscoveryRequest>,
    response_tx: &ResponseSender,
) {
    let signal = workqueue
        .enqueue(Job {
            proxy: Arc::clone(proxy),
            type_uris,
            request,
            response_tx: response_tx.clone(),
        })
        .await;

    match signal.await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => {
            warn!(proxy = %proxy, error = %err, "response job failed");
        }
        Err(_) => {
            warn!(proxy = %proxy, "response job dropped without completing");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mesh_core::{ProxyKind, SerialNumber};
    use mesh_types::google::rpc::Status as RpcStatus;

    fn proxy() -> Proxy {
        Proxy::new(
            CommonName::from("bookstore-sa.bookstore.cluster.local"),
            SerialNumber::from("serial"),
            None,
            ProxyKind::Sidecar,
        )
    }

    fn request(type_url: &str, version: &str, nonce: &str, resources: &[&str]) -> DiscoveryRequest {
        DiscoveryRequest {
            version_info: version.to_string(),
            node: None,
            resource_names: resources.iter().map(|s| s.to_string()).collect(),
            type_url: type_url.to_string(),
            response_nonce: nonce.to_string(),
            error_detail: None,
        }
    }

    #[test]
    fn first_request_replies_and_records_subscription() {
        let proxy = proxy();
        let metrics = ProxyMetrics::new();
        let req = request(mesh_core::ROUTE_TYPE_URL, "", "", &["a", "b"]);

        assert_eq!(
            assess_request(&proxy, &req, &metrics),
            RequestDecision::Reply(TypeUri::RouteConfiguration)
        );
        let subscribed = proxy.subscribed_resources(TypeUri::RouteConfiguration);
        assert!(subscribed.contains("a") && subscribed.contains("b"));
    }

    #[test]
    fn empty_type_url_is_dropped() {
        let proxy = proxy();
        let req = request("", "", "", &[]);
        assert_eq!(
            assess_request(&proxy, &req, &ProxyMetrics::new()),
            RequestDecision::Ignore
        );
    }

    #[test]
    fn unknown_type_url_is_dropped() {
        let proxy = proxy();
        let req = request("type.googleapis.com/envoy.api.v2.Cluster", "", "", &[]);
        assert_eq!(
            assess_request(&proxy, &req, &ProxyMetrics::new()),
            RequestDecision::Ignore
        );
    }

    #[test]
    fn garbage_version_is_dropped() {
        let proxy = proxy();
        let req = request(mesh_core::CLUSTER_TYPE_URL, "not-a-number", "", &[]);
        assert_eq!(
            assess_request(&proxy, &req, &ProxyMetrics::new()),
            RequestDecision::Ignore
        );
    }

    #[test]
    fn nack_is_inert() {
        let proxy = proxy();
        proxy.commit_response(TypeUri::Listener, 3, "n3".to_string(), BTreeSet::new());

        let mut req = request(mesh_core::LISTENER_TYPE_URL, "2", "n3", &[]);
        req.error_detail = Some(RpcStatus {
            code: 13,
            message: "bad listener config".to_string(),
            details: vec![],
        });

        assert_eq!(
            assess_request(&proxy, &req, &ProxyMetrics::new()),
            RequestDecision::Ignore
        );
        // State untouched: version and applied version did not move.
        assert_eq!(proxy.last_sent_version(TypeUri::Listener), 3);
        assert_eq!(proxy.last_applied_version(TypeUri::Listener), 0);
    }

    #[test]
    fn reconnecting_proxy_adopts_version_and_gets_reply() {
        let proxy = proxy();
        let req = request(mesh_core::LISTENER_TYPE_URL, "42", "nonce-from-elsewhere", &[]);

        assert_eq!(
            assess_request(&proxy, &req, &ProxyMetrics::new()),
            RequestDecision::Reply(TypeUri::Listener)
        );
        assert_eq!(proxy.last_sent_version(TypeUri::Listener), 42);
        assert_eq!(proxy.last_applied_version(TypeUri::Listener), 42);
        assert_eq!(proxy.next_version(TypeUri::Listener), 43);
    }

    #[test]
    fn stale_nonce_is_dropped() {
        let proxy = proxy();
        proxy.commit_response(TypeUri::Cluster, 2, "n2".to_string(), BTreeSet::new());

        let req = request(mesh_core::CLUSTER_TYPE_URL, "1", "n1", &[]);
        assert_eq!(
            assess_request(&proxy, &req, &ProxyMetrics::new()),
            RequestDecision::Ignore
        );
        // A stale request must not move the applied version.
        assert_eq!(proxy.last_applied_version(TypeUri::Cluster), 0);
    }

    #[test]
    fn wildcard_ack_ignores_resource_names() {
        let proxy = proxy();
        proxy.commit_response(TypeUri::Cluster, 1, "n1".to_string(), BTreeSet::new());

        // Resource names on a wildcard ACK carry no meaning.
        let req = request(mesh_core::CLUSTER_TYPE_URL, "1", "n1", &["anything"]);
        assert_eq!(
            assess_request(&proxy, &req, &ProxyMetrics::new()),
            RequestDecision::Ignore
        );
        assert_eq!(proxy.last_applied_version(TypeUri::Cluster), 1);
    }

    #[test]
    fn non_wildcard_ack_with_same_resources_is_inert() {
        let proxy = proxy();
        let sent: BTreeSet<String> = ["a", "b"].iter().map(|s| s.to_string()).collect();
        proxy.commit_response(TypeUri::ClusterLoadAssignment, 4, "ne".to_string(), sent);

        let req = request(mesh_core::ENDPOINT_TYPE_URL, "4", "ne", &["a", "b"]);
        assert_eq!(
            assess_request(&proxy, &req, &ProxyMetrics::new()),
            RequestDecision::Ignore
        );
        assert_eq!(proxy.last_applied_version(TypeUri::ClusterLoadAssignment), 4);
    }

    #[test]
    fn non_wildcard_resource_change_triggers_reply() {
        let proxy = proxy();
        let sent: BTreeSet<String> = ["a", "b"].iter().map(|s| s.to_string()).collect();
        proxy.commit_response(TypeUri::RouteConfiguration, 4, "nr".to_string(), sent);

        let req = request(mesh_core::ROUTE_TYPE_URL, "4", "nr", &["a", "c"]);
        assert_eq!(
            assess_request(&proxy, &req, &ProxyMetrics::new()),
            RequestDecision::Reply(TypeUri::RouteConfiguration)
        );
        // Subscription updated to the requested set.
        let subscribed = proxy.subscribed_resources(TypeUri::RouteConfiguration);
        assert!(subscribed.contains("c") && !subscribed.contains("b"));
    }

    #[test]
    fn cn_matching_uses_identity_components() {
        let proxy = proxy();
        assert!(is_cn_for_proxy(
            &proxy,
            &CommonName::from("bookstore-sa.bookstore.cluster.local")
        ));
        // Different trust domain, same identity: still this proxy's.
        assert!(is_cn_for_proxy(
            &proxy,
            &CommonName::from("bookstore-sa.bookstore.mesh.internal")
        ));
        assert!(!is_cn_for_proxy(
            &proxy,
            &CommonName::from("other-sa.bookstore.cluster.local")
        ));
        assert!(!is_cn_for_proxy(&proxy, &CommonName::from("malformed")));
    }
}
