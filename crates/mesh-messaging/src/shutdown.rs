//! Shutdown coordination for the long-lived singletons.
//!
//! The bus, dispatcher and certificate-release handler are spawned once per
//! process and stopped by triggering a shared [`ShutdownController`].

use std::sync::Arc;

use tokio::sync::watch;
use tracing::info;

/// Controller that fans a shutdown trigger out to every singleton task.
#[derive(Debug, Clone)]
pub struct ShutdownController {
    inner: Arc<ShutdownInner>,
}

#[derive(Debug)]
struct ShutdownInner {
    tx: watch::Sender<bool>,
    rx: watch::Receiver<bool>,
}

impl Default for ShutdownController {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownController {
    /// Create a new controller.
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self {
            inner: Arc::new(ShutdownInner { tx, rx }),
        }
    }

    /// A signal that resolves when shutdown is triggered.
    pub fn signal(&self) -> ShutdownSignal {
        ShutdownSignal {
            rx: self.inner.rx.clone(),
        }
    }

    /// Whether shutdown has been triggered.
    pub fn is_shutdown(&self) -> bool {
        *self.inner.rx.borrow()
    }

    /// Trigger shutdown, waking every outstanding signal.
    pub fn shutdown(&self) {
        if self.inner.tx.send_replace(true) {
            return;
        }
        info!("shutdown triggered");
    }
}

/// A cloneable future source that resolves once shutdown is triggered.
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    rx: watch::Receiver<bool>,
}

impl ShutdownSignal {
    /// Wait for the shutdown trigger.
    ///
    /// Resolves immediately if shutdown was already triggered, and also if
    /// the controller was dropped.
    pub async fn wait(&mut self) {
        loop {
            if *self.rx.borrow() {
                return;
            }
            if self.rx.changed().await.is_err() {
                return;
            }
        }
    }
}
