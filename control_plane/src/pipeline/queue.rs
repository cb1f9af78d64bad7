use crate::cluster::Cluster;
use crate::errors::SyncError;
use crate::mirror::MirrorStore;
use crate::pipeline::Event;
use crate::pipeline::solve::{Synced, retire, solve};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{Instrument, debug, debug_span, trace};

pub(crate) enum Action<T> {
    Apply(T),
    Remove(T),
}

struct Request<T> {
    action: Action<T>,
    reply: oneshot::Sender<Result<Event<T>, SyncError>>,
}

/// Bounded queue serializing every write of one kind through a single consumer task.
pub(crate) struct KindQueue<T> {
    tx: mpsc::Sender<Request<T>>,
}

impl<T: Synced> KindQueue<T> {
    /// Spawns the consumer on the current runtime. It stops once the queue is dropped.
    pub(crate) fn spawn(capacity: usize, cluster: Arc<dyn Cluster>, store: Arc<MirrorStore>) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        tokio::spawn(
            consume(rx, cluster, store)
                .instrument(debug_span!("kind_queue", kind = %T::KIND)),
        );
        Self { tx }
    }

    pub(crate) async fn submit(&self, action: Action<T>) -> Result<Event<T>, SyncError> {
        let name = match &action {
            Action::Apply(object) | Action::Remove(object) => object.full_name().to_string(),
        };
        let (reply, rx) = oneshot::channel();

        self.tx
            .send(Request { action, reply })
            .await
            .map_err(|_| SyncError::cancelled(T::KIND, &name))?;

        rx.await
            .map_err(|_| SyncError::cancelled(T::KIND, name))?
    }
}

async fn consume<T: Synced>(
    mut rx: mpsc::Receiver<Request<T>>,
    cluster: Arc<dyn Cluster>,
    store: Arc<MirrorStore>,
) {
    while let Some(Request { action, reply }) = rx.recv().await {
        let result = match action {
            Action::Apply(object) => solve(cluster.as_ref(), &store, object).await,
            Action::Remove(object) => retire(cluster.as_ref(), &store, object).await,
        };

        if reply.send(result).is_err() {
            trace!("Requester went away before the write completed");
        }
    }

    debug!("Queue closed");
}
