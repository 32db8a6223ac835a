//! Protocol conformance tests for the aggregated discovery stream.
//!
//! These drive the real stream loop, work queue and emitter over in-memory
//! channels, standing in for the gRPC transport.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tonic::Status;

use mesh_core::{CommonName, MeshError, Proxy, ProxyKind, SerialNumber, TypeUri};
use mesh_messaging::{Broker, CertificateSummary, Event, ObjectHandle, Topic};
use mesh_types::google::rpc::Status as RpcStatus;
use mesh_types::{DiscoveryRequest, DiscoveryResponse};

use crate::metrics::ProxyMetrics;
use crate::response::{NamedResource, ResponseBuilder};
use crate::stream::{run_stream_loop, StreamContext};
use crate::workqueue::WorkQueue;

/// Builds one resource per subscribed name; wildcard requests with no
/// subscription get a single default resource.
struct SubscriptionBuilder;

#[async_trait]
impl ResponseBuilder for SubscriptionBuilder {
    async fn build(
        &self,
        type_uri: TypeUri,
        proxy: &Proxy,
        request: Option<&DiscoveryRequest>,
    ) -> Result<Vec<NamedResource>, MeshError> {
        let names: BTreeSet<String> = match request {
            Some(request) => request.resource_names.iter().cloned().collect(),
            None => proxy.subscribed_resources(type_uri),
        };

        let names = if names.is_empty() {
            BTreeSet::from(["default".to_string()])
        } else {
            names
        };

        Ok(names
            .into_iter()
            .map(|name| {
                let payload = prost_types::Any {
                    type_url: type_uri.type_url().to_string(),
                    value: name.as_bytes().to_vec(),
                };
                NamedResource::new(name, payload)
            })
            .collect())
    }
}

struct Harness {
    proxy: Arc<Proxy>,
    request_tx: mpsc::Sender<DiscoveryRequest>,
    responses: mpsc::Receiver<Result<DiscoveryResponse, Status>>,
}

impl Harness {
    fn start(broker: &Broker, cn: &str) -> Self {
        let proxy = Arc::new(Proxy::new(
            CommonName::from(cn),
            SerialNumber::from("serial"),
            None,
            ProxyKind::Sidecar,
        ));

        let metrics = ProxyMetrics::new();
        let workqueue = Arc::new(WorkQueue::new(
            2,
            16,
            Arc::new(SubscriptionBuilder),
            metrics.clone(),
        ));

        let ctx = StreamContext {
            proxy: Arc::clone(&proxy),
            workqueue,
            metrics,
            broadcasts: broker.subscribe([Topic::ProxyBroadcast]),
            cert_rotations: broker.subscribe([Topic::CertificateRotated]),
        };

        let (request_tx, request_rx) = mpsc::channel(16);
        let (response_tx, responses) = mpsc::channel(16);
        tokio::spawn(run_stream_loop(ctx, request_rx, response_tx));

        Self {
            proxy,
            request_tx,
            responses,
        }
    }

    async fn send(&self, request: DiscoveryRequest) {
        self.request_tx.send(request).await.expect("stream loop alive");
    }

    async fn expect_response(&mut self) -> DiscoveryResponse {
        tokio::time::timeout(Duration::from_secs(5), self.responses.recv())
            .await
            .expect("expected a response")
            .expect("stream still open")
            .expect("response, not status")
    }

    async fn expect_silence(&mut self) {
        let outcome =
            tokio::time::timeout(Duration::from_millis(200), self.responses.recv()).await;
        assert!(outcome.is_err(), "expected no response, got {outcome:?}");
    }
}

fn request(type_uri: TypeUri, version: &str, nonce: &str, resources: &[&str]) -> DiscoveryRequest {
    DiscoveryRequest {
        version_info: version.to_string(),
        node: None,
        resource_names: resources.iter().map(|s| s.to_string()).collect(),
        type_url: type_uri.type_url().to_string(),
        response_nonce: nonce.to_string(),
        error_detail: None,
    }
}

#[tokio::test]
async fn first_cds_request_yields_version_one() {
    let broker = Broker::new();
    let mut harness = Harness::start(&broker, "sa.ns.cluster.local");

    harness.send(request(TypeUri::Cluster, "", "", &[])).await;

    let response = harness.expect_response().await;
    assert_eq!(response.version_info, "1");
    assert!(!response.nonce.is_empty());
    assert_eq!(response.type_url, TypeUri::Cluster.type_url());
    assert!(!response.resources.is_empty());

    assert_eq!(harness.proxy.last_sent_version(TypeUri::Cluster), 1);
    assert_eq!(harness.proxy.last_sent_nonce(TypeUri::Cluster), response.nonce);
}

#[tokio::test]
async fn pure_wildcard_ack_is_silent() {
    let broker = Broker::new();
    let mut harness = Harness::start(&broker, "sa.ns.cluster.local");

    harness.send(request(TypeUri::Cluster, "", "", &[])).await;
    let response = harness.expect_response().await;

    harness
        .send(request(TypeUri::Cluster, "1", &response.nonce, &[]))
        .await;
    harness.expect_silence().await;

    assert_eq!(harness.proxy.last_applied_version(TypeUri::Cluster), 1);
    assert_eq!(harness.proxy.last_sent_version(TypeUri::Cluster), 1);
}

#[tokio::test]
async fn rds_subscription_change_yields_next_version() {
    let broker = Broker::new();
    let mut harness = Harness::start(&broker, "sa.ns.cluster.local");

    let sent: BTreeSet<String> = ["a", "b"].iter().map(|s| s.to_string()).collect();
    harness
        .proxy
        .commit_response(TypeUri::RouteConfiguration, 4, "nr".to_string(), sent);

    harness
        .send(request(TypeUri::RouteConfiguration, "4", "nr", &["a", "c"]))
        .await;

    let response = harness.expect_response().await;
    assert_eq!(response.version_info, "5");
    assert_ne!(response.nonce, "nr");
    assert_eq!(response.resources.len(), 2);

    let names = harness.proxy.last_sent_resources(TypeUri::RouteConfiguration);
    assert!(names.contains("a") && names.contains("c"));
    assert_eq!(harness.proxy.last_applied_version(TypeUri::RouteConfiguration), 4);
}

#[tokio::test]
async fn nack_is_inert() {
    let broker = Broker::new();
    let mut harness = Harness::start(&broker, "sa.ns.cluster.local");

    harness
        .proxy
        .commit_response(TypeUri::Listener, 3, "nl".to_string(), BTreeSet::new());

    let mut nack = request(TypeUri::Listener, "2", "nl", &[]);
    nack.error_detail = Some(RpcStatus {
        code: 13,
        message: "rejected listener".to_string(),
        details: vec![],
    });
    harness.send(nack).await;

    harness.expect_silence().await;
    assert_eq!(harness.proxy.last_sent_version(TypeUri::Listener), 3);
    assert_eq!(harness.proxy.last_applied_version(TypeUri::Listener), 0);
}

#[tokio::test]
async fn reconnecting_proxy_resumes_version_sequence() {
    let broker = Broker::new();
    let mut harness = Harness::start(&broker, "sa.ns.cluster.local");

    harness
        .send(request(TypeUri::Listener, "42", "nonce-from-previous-control-plane", &[]))
        .await;

    let response = harness.expect_response().await;
    assert_eq!(response.version_info, "43");
    assert_eq!(harness.proxy.last_applied_version(TypeUri::Listener), 42);
    assert_eq!(harness.proxy.last_sent_version(TypeUri::Listener), 43);
}

#[tokio::test]
async fn broadcast_reaches_only_initialized_proxies() {
    let broker = Broker::new();
    let mut initialized = Harness::start(&broker, "a.ns.cluster.local");
    let mut fresh = Harness::start(&broker, "b.ns.cluster.local");

    // Bring the first proxy through its init phase.
    initialized.send(request(TypeUri::Cluster, "", "", &[])).await;
    let _ = initialized.expect_response().await;

    broker.publish(Event::new(Topic::ProxyBroadcast));

    // Full refresh for the initialized proxy, in broadcast order.
    for expected in TypeUri::BROADCAST {
        let response = initialized.expect_response().await;
        assert_eq!(response.type_url, expected.type_url());
    }

    // The uninitialized proxy is skipped entirely.
    fresh.expect_silence().await;
    assert_eq!(fresh.proxy.last_sent_version(TypeUri::Cluster), 0);
}

#[tokio::test]
async fn broadcast_versions_stay_monotonic() {
    let broker = Broker::new();
    let mut harness = Harness::start(&broker, "a.ns.cluster.local");

    harness.send(request(TypeUri::Cluster, "", "", &[])).await;
    let first = harness.expect_response().await;
    assert_eq!(first.version_info, "1");

    broker.publish(Event::new(Topic::ProxyBroadcast));
    let refreshed = harness.expect_response().await;
    assert_eq!(refreshed.type_url, TypeUri::Cluster.type_url());
    assert_eq!(refreshed.version_info, "2");
}

#[tokio::test]
async fn certificate_rotation_refreshes_secrets_for_matching_identity() {
    let broker = Broker::new();
    let mut matching = Harness::start(&broker, "bookstore-sa.bookstore.cluster.local");
    let mut other = Harness::start(&broker, "bookbuyer-sa.bookbuyer.cluster.local");

    broker.publish(Event::with_objects(
        Topic::CertificateRotated,
        None,
        Some(ObjectHandle::Certificate(CertificateSummary {
            common_name: CommonName::from("bookstore-sa.bookstore.cluster.local"),
            serial_number: SerialNumber::from("rotated"),
        })),
    ));

    let response = matching.expect_response().await;
    assert_eq!(response.type_url, TypeUri::Secret.type_url());

    other.expect_silence().await;
}

#[tokio::test]
async fn closing_requests_ends_the_stream() {
    let broker = Broker::new();
    let Harness {
        request_tx,
        mut responses,
        ..
    } = Harness::start(&broker, "sa.ns.cluster.local");

    drop(request_tx);

    let end = tokio::time::timeout(Duration::from_secs(5), responses.recv())
        .await
        .expect("stream should end");
    assert!(end.is_none(), "response stream closes when the proxy hangs up");
}
