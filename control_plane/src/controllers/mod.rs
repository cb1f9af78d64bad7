mod certificates;
mod endpoints;
mod generation;
mod secrets;

pub use certificates::{CertificateController, CertificateKey};
pub use endpoints::EndpointsController;
pub use generation::GenerationTracker;
pub use secrets::SecretController;

use apisix_ingress_core::workqueue::RetryQueue;
use async_trait::async_trait;
use std::error::Error;
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::Arc;
use tracing::{Instrument, debug, error, info_span, warn};

/// Work done for one queue key.
#[async_trait]
pub trait Reconciler: Send + Sync + 'static {
    type Key: Clone + Debug + Eq + Hash + Send + Sync + 'static;
    type Error: Error + Send + Sync;

    async fn reconcile(&self, key: &Self::Key) -> Result<(), Self::Error>;

    fn is_retryable(error: &Self::Error) -> bool;
}

/// Pulls keys from `queue` until it shuts down. Retryable failures are re-queued
/// with backoff; everything else is logged and forgotten.
pub async fn run_queue_worker<R: Reconciler>(reconciler: Arc<R>, queue: RetryQueue<R::Key>) {
    let span = info_span!("queue_worker", queue = queue.name());

    async move {
        while let Some(key) = queue.get().await {
            match reconciler.reconcile(&key).await {
                Ok(()) => {
                    debug!(?key, "Reconciled");
                    queue.forget(&key);
                }
                Err(err) if R::is_retryable(&err) => {
                    warn!(?key, %err, attempt = queue.attempts(&key) + 1, "Reconcile failed, retrying");
                    queue.add_rate_limited(key);
                }
                Err(err) => {
                    error!(?key, %err, "Reconcile failed");
                    queue.forget(&key);
                }
            }
        }
        debug!("Queue shut down, worker exiting");
    }
    .instrument(span)
    .await;
}
