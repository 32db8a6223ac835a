//! The bounded worker pool that materializes discovery responses.
//!
//! Jobs flow through one bounded queue into a fixed set of workers. The
//! queue itself does not order jobs per proxy; stream loops enforce that by
//! awaiting each job's completion signal before enqueueing the next one for
//! the same stream.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, warn};

use mesh_core::{MeshError, Proxy, TypeUri};
use mesh_types::DiscoveryRequest;

use crate::metrics::ProxyMetrics;
use crate::response::{send_responses, ResponseBuilder, ResponseSender};

/// A response-materialization job for one proxy stream.
pub struct Job {
    /// The proxy the responses are for.
    pub proxy: Arc<Proxy>,
    /// Type URIs to regenerate, in emission order.
    pub type_uris: Vec<TypeUri>,
    /// The triggering request, when the job answers one.
    pub request: Option<DiscoveryRequest>,
    /// Outbound channel of the proxy's stream.
    pub response_tx: ResponseSender,
}

struct QueuedJob {
    job: Job,
    done: oneshot::Sender<Result<(), MeshError>>,
}

/// Fixed-size worker pool over a single bounded job queue.
pub struct WorkQueue {
    tx: mpsc::Sender<QueuedJob>,
    workers: usize,
}

impl WorkQueue {
    /// Spawn `workers` workers draining a queue of `capacity` jobs.
    ///
    /// Both must be positive; the server builder validates configuration
    /// before constructing the queue. Must be called from within a Tokio
    /// runtime.
    pub fn new(
        workers: usize,
        capacity: usize,
        builder: Arc<dyn ResponseBuilder>,
        metrics: ProxyMetrics,
    ) -> Self {
        let (tx, rx) = mpsc::channel::<QueuedJob>(capacity.max(1));
        let rx = Arc::new(Mutex::new(rx));
        let workers = workers.max(1);

        for worker_id in 0..workers {
            let rx = Arc::clone(&rx);
            let builder = Arc::clone(&builder);
            let metrics = metrics.clone();
            tokio::spawn(worker_loop(worker_id, rx, builder, metrics));
        }

        Self { tx, workers }
    }

    /// Number of workers in the pool.
    pub fn worker_count(&self) -> usize {
        self.workers
    }

    /// Queue a job, returning its completion signal.
    ///
    /// Blocks while the queue is full, which is the backpressure path: a
    /// stream loop awaiting this (and then the signal) stops consuming
    /// inbound requests. The signal resolves once the job's responses have
    /// been written to the stream, or with the failure that stopped it.
    pub async fn enqueue(&self, job: Job) -> oneshot::Receiver<Result<(), MeshError>> {
        let (done, signal) = oneshot::channel();
        if let Err(send_error) = self.tx.send(QueuedJob { job, done }).await {
            // Queue shut down; complete the signal in-line.
            let QueuedJob { job, done } = send_error.0;
            warn!(proxy = %job.proxy, "work queue is shut down, dropping job");
            let _ = done.send(Err(MeshError::Internal {
                message: "work queue is shut down".to_string(),
            }));
        }
        signal
    }
}

impl std::fmt::Debug for WorkQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkQueue")
            .field("workers", &self.workers)
            .finish()
    }
}

async fn worker_loop(
    worker_id: usize,
    rx: Arc<Mutex<mpsc::Receiver<QueuedJob>>>,
    builder: Arc<dyn ResponseBuilder>,
    metrics: ProxyMetrics,
) {
    debug!(worker = worker_id, "response worker started");

    loop {
        // Hold the receiver lock only while waiting for the next job, so
        // the remaining workers can pick up jobs while this one executes.
        let queued = { rx.lock().await.recv().await };
        let Some(QueuedJob { job, done }) = queued else {
            debug!(worker = worker_id, "response worker stopping");
            return;
        };

        let result = send_responses(
            builder.as_ref(),
            &job.proxy,
            &job.type_uris,
            job.request.as_ref(),
            &job.response_tx,
            &metrics,
        )
        .await;

        if let Err(err) = &result {
            for type_uri in &job.type_uris {
                metrics.job_failed(type_uri.short_name());
            }
            warn!(
                worker = worker_id,
                proxy = %job.proxy,
                error = %err,
                "response job failed"
            );
        }

        // The stream loop may have gone away; a dead signal receiver is
        // not a worker error.
        let _ = done.send(result);
    }
}
