//! Response materialization: the builder surface and the emission path.
//!
//! Builders translate catalog policy into wire resources; everything else
//! here is protocol bookkeeping. Versions are allocated from the proxy's
//! per-type counter and per-type state is committed only after the response
//! has been written to the stream, so a failed build or a dead stream never
//! advances what the proxy is believed to have.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tonic::Status;
use tracing::{debug, warn};

use mesh_core::{MeshError, Proxy, TypeUri};
use mesh_types::{DiscoveryRequest, DiscoveryResponse};

use crate::metrics::ProxyMetrics;
use crate::utils::generate_nonce;

/// A wire resource paired with its name.
///
/// Names drive subscription-delta detection and must match the name inside
/// the encoded payload.
#[derive(Debug, Clone)]
pub struct NamedResource {
    /// Resource name as the proxy subscribes to it.
    pub name: String,
    /// Encoded resource payload.
    pub resource: prost_types::Any,
}

impl NamedResource {
    /// Create a named resource.
    #[must_use]
    pub fn new(name: impl Into<String>, resource: prost_types::Any) -> Self {
        Self {
            name: name.into(),
            resource,
        }
    }
}

/// Translates catalog policy into wire resources for one proxy.
///
/// Implementations must be deterministic: identical catalog state, proxy
/// state and request yield the same resource list, modulo equally valid
/// orderings (the emitter sorts by name before sending).
#[async_trait]
pub trait ResponseBuilder: Send + Sync + 'static {
    /// Build the resources of `type_uri` currently applicable to `proxy`.
    ///
    /// `request` is the triggering discovery request when there is one;
    /// control-plane-initiated jobs pass `None` and builders fall back to
    /// the proxy's recorded subscriptions.
    async fn build(
        &self,
        type_uri: TypeUri,
        proxy: &Proxy,
        request: Option<&DiscoveryRequest>,
    ) -> Result<Vec<NamedResource>, MeshError>;
}

/// Outbound channel for one proxy stream.
pub type ResponseSender = mpsc::Sender<Result<DiscoveryResponse, Status>>;

/// Build and write one response per requested type URI.
///
/// Stops at the first failure; per-type state for already-written responses
/// stays committed.
pub(crate) async fn send_responses(
    builder: &dyn ResponseBuilder,
    proxy: &Proxy,
    type_uris: &[TypeUri],
    request: Option<&DiscoveryRequest>,
    response_tx: &ResponseSender,
    metrics: &ProxyMetrics,
) -> Result<(), MeshError> {
    for &type_uri in type_uris {
        send_one(builder, proxy, type_uri, request, response_tx, metrics).await?;
    }
    Ok(())
}

async fn send_one(
    builder: &dyn ResponseBuilder,
    proxy: &Proxy,
    type_uri: TypeUri,
    request: Option<&DiscoveryRequest>,
    response_tx: &ResponseSender,
    metrics: &ProxyMetrics,
) -> Result<(), MeshError> {
    let started = Instant::now();

    let resources = builder
        .build(type_uri, proxy, request)
        .await
        .map_err(|err| MeshError::BuildFailed {
            type_uri: type_uri.short_name().to_string(),
            message: err.to_string(),
        })?;

    let resources = dedup_resources(proxy, type_uri, resources);

    let version = proxy.next_version(type_uri);
    let nonce = generate_nonce();
    let names: BTreeSet<String> = resources.iter().map(|r| r.name.clone()).collect();

    let response = DiscoveryResponse {
        version_info: version.to_string(),
        resources: resources.into_iter().map(|r| r.resource).collect(),
        canary: false,
        type_url: type_uri.type_url().to_string(),
        nonce: nonce.clone(),
    };

    debug!(
        proxy = %proxy,
        type_uri = %type_uri,
        version,
        nonce = %nonce,
        resources = names.len(),
        "sending discovery response"
    );

    if response_tx.send(Ok(response)).await.is_err() {
        // Stream gone; leave state untouched so a reconnect starts from
        // what the proxy last ACKed.
        return Err(MeshError::StreamClosed {
            reason: format!("response channel closed for {proxy}"),
        });
    }

    proxy.commit_response(type_uri, version, nonce, names);
    metrics.response_sent(
        type_uri.short_name(),
        started.elapsed().as_millis() as u64,
    );
    Ok(())
}

/// Collapse duplicate resource names, keeping the first occurrence and
/// sorting the result for deterministic output.
fn dedup_resources(
    proxy: &Proxy,
    type_uri: TypeUri,
    resources: Vec<NamedResource>,
) -> Vec<NamedResource> {
    let mut seen = BTreeSet::new();
    let mut out: Vec<NamedResource> = Vec::with_capacity(resources.len());

    for resource in resources {
        if seen.insert(resource.name.clone()) {
            out.push(resource);
        } else {
            warn!(
                proxy = %proxy,
                type_uri = %type_uri,
                name = %resource.name,
                "duplicate resource from builder, dropping"
            );
        }
    }

    out.sort_by(|a, b| a.name.cmp(&b.name));
    out
}
