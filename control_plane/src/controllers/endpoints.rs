use super::Reconciler;
use crate::endpoints::{EndpointChange, EndpointProjector, ProjectionError};
use crate::kubernetes::objects::ObjectKey;
use apisix_ingress_core::workqueue::RetryQueue;
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// Queue key of an endpoint change. Endpoints and EndpointSlices of the same
/// name are distinct objects.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EndpointKey {
    Endpoints(ObjectKey),
    Slice(ObjectKey),
}

/// Feeds Endpoints and EndpointSlice changes to an [`EndpointProjector`].
/// Only the latest change per object is kept while it waits in the queue.
pub struct EndpointsController {
    projector: Arc<EndpointProjector>,
    pending: DashMap<EndpointKey, EndpointChange>,
    queue: RetryQueue<EndpointKey>,
}

impl EndpointsController {
    pub fn new(projector: Arc<EndpointProjector>, queue: RetryQueue<EndpointKey>) -> Self {
        Self {
            projector,
            pending: DashMap::new(),
            queue,
        }
    }

    pub fn queue(&self) -> &RetryQueue<EndpointKey> {
        &self.queue
    }

    pub fn enqueue(&self, change: EndpointChange) {
        let object = match change.object() {
            Ok(object) => object,
            Err(err) => {
                warn!(%err, kind = %change.kind, "Ignoring endpoint change");
                return;
            }
        };
        let key = if change.is_slice() {
            EndpointKey::Slice(object)
        } else {
            EndpointKey::Endpoints(object)
        };

        self.pending.insert(key.clone(), change);
        self.queue.add(key);
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }
}

#[async_trait]
impl Reconciler for EndpointsController {
    type Key = EndpointKey;
    type Error = ProjectionError;

    async fn reconcile(&self, key: &EndpointKey) -> Result<(), ProjectionError> {
        let Some(change) = self.pending.get(key).map(|change| change.clone()) else {
            debug!(?key, "No pending change");
            return Ok(());
        };

        let result = self.projector.apply(&change).await;
        if !result.as_ref().is_err_and(ProjectionError::is_retryable) {
            // A newer change queued while this one ran stays pending.
            self.pending.remove_if(key, |_, pending| pending == &change);
        }
        result
    }

    fn is_retryable(error: &ProjectionError) -> bool {
        error.is_retryable()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::apisix::{Metadata, Node, Upstream};
    use crate::cluster::{ClusterError, MemoryCluster};
    use crate::endpoints::ChangeKind;
    use crate::mirror::MirrorStore;
    use crate::pipeline::{Pipeline, Target};
    use apisix_ingress_core::workqueue::BackoffPolicy;
    use assertables::assert_ok;
    use dashmap::DashMap;
    use k8s_openapi::api::core::v1::{
        EndpointAddress, EndpointPort, EndpointSubset, Endpoints, Service,
    };
    use kube::api::ObjectMeta;

    fn endpoints(ip: &str) -> Endpoints {
        Endpoints {
            metadata: ObjectMeta {
                namespace: Some("prod".to_string()),
                name: Some("web".to_string()),
                ..Default::default()
            },
            subsets: Some(vec![EndpointSubset {
                addresses: Some(vec![EndpointAddress {
                    ip: ip.to_string(),
                    ..Default::default()
                }]),
                ports: Some(vec![EndpointPort {
                    port: 8080,
                    ..Default::default()
                }]),
                ..Default::default()
            }]),
        }
    }

    fn controller(cluster: Arc<MemoryCluster>) -> EndpointsController {
        let name = Upstream::compose_name("prod", "web", 8080);
        cluster.seed(
            Upstream::builder()
                .metadata(Metadata::builder().full_name(name).name("web").build())
                .nodes(vec![Node::builder().host("10.0.0.1").port(8080).build()])
                .build(),
        );
        let pipeline = Arc::new(Pipeline::new(cluster, Arc::new(MirrorStore::new()), 8));
        let projector = EndpointProjector::builder()
            .targets(vec![Target::builder().name("primary").pipeline(pipeline).build()])
            .services(Arc::new(DashMap::<ObjectKey, Arc<Service>>::new()))
            .build();
        EndpointsController::new(
            Arc::new(projector),
            RetryQueue::new("endpoints", BackoffPolicy::default()),
        )
    }

    #[test_log::test(tokio::test)]
    async fn test_latest_change_wins_while_queued() {
        let cluster = Arc::new(MemoryCluster::new("primary"));
        let controller = controller(cluster.clone());

        controller.enqueue(EndpointChange::endpoints(ChangeKind::Update, endpoints("10.0.0.2")));
        controller.enqueue(EndpointChange::endpoints(ChangeKind::Update, endpoints("10.0.0.3")));
        assert_eq!(controller.queue().len(), 1);

        let key = EndpointKey::Endpoints(ObjectKey::new("prod", "web"));
        assert_ok!(controller.reconcile(&key).await);
        assert_eq!(controller.pending(), 0);

        let upstream = cluster
            .object::<Upstream>(&Upstream::compose_name("prod", "web", 8080))
            .map(|upstream| upstream.nodes().clone());
        assert_eq!(
            upstream,
            Some(vec![Node::builder().host("10.0.0.3").port(8080).build()])
        );
    }

    #[test_log::test(tokio::test)]
    async fn test_retryable_failure_keeps_the_change() {
        let cluster = Arc::new(MemoryCluster::new("primary"));
        let controller = controller(cluster.clone());
        cluster.fail_on(
            &Upstream::compose_name("prod", "web", 8080),
            ClusterError::Transient("admin api unavailable".to_string()),
        );

        controller.enqueue(EndpointChange::endpoints(ChangeKind::Update, endpoints("10.0.0.2")));
        let key = EndpointKey::Endpoints(ObjectKey::new("prod", "web"));
        let error = controller.reconcile(&key).await.err();

        assert!(error.is_some_and(|error| EndpointsController::is_retryable(&error)));
        assert_eq!(controller.pending(), 1);
    }
}
