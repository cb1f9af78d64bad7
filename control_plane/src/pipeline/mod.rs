//! Dependency-ordered synchronization of manifests against one cluster.
//!
//! A pass solves upstreams first and broadcasts each solved upstream to the
//! service workers waiting on its name. Service workers stamp the upstream id,
//! solve their service and broadcast it to the route workers, which do the last
//! write. A failed write is not broadcast, so its dependents stall until the
//! next pass.

mod broadcast;
mod queue;
pub(crate) mod solve;

pub use broadcast::{Event, SyncState};
pub use solve::Synced;

use crate::apisix::{ApisixResource, Identity, Manifest, ResourceKind, Route, Service, Ssl, Upstream};
use crate::cluster::Cluster;
use crate::errors::{AggregateError, SyncError};
use crate::mirror::MirrorStore;
use broadcast::EventHub;
use futures::StreamExt;
use futures::stream::FuturesUnordered;
use getset::{CopyGetters, Getters};
use queue::{Action, KindQueue};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};
use typed_builder::TypedBuilder;

/// Outcome counts of one pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, CopyGetters)]
#[getset(get_copy = "pub")]
pub struct SyncReport {
    created: usize,
    updated: usize,
    unchanged: usize,
    suppressed: usize,
    removed: usize,
    stalled: usize,
}

impl SyncReport {
    fn record(&mut self, state: SyncState) {
        match state {
            SyncState::Created => self.created += 1,
            SyncState::Updated => self.updated += 1,
            SyncState::Unchanged => self.unchanged += 1,
            SyncState::Suppressed => self.suppressed += 1,
            SyncState::Removed => self.removed += 1,
            SyncState::Resolved => {}
        }
    }

    pub fn writes(&self) -> usize {
        self.created + self.updated + self.removed
    }
}

enum Outcome<T> {
    Solved(Event<T>),
    Stalled,
}

/// Waits for the dependency event of one worker. `None` when the dependency was
/// not solved in this pass.
async fn await_dependency<D, T: ApisixResource>(
    object: &T,
    mailbox: oneshot::Receiver<Event<D>>,
    cancel: &CancellationToken,
) -> Result<Option<Event<D>>, SyncError> {
    tokio::select! {
        biased;
        () = cancel.cancelled() => Err(SyncError::cancelled(T::KIND, object.full_name())),
        event = mailbox => Ok(event.ok()),
    }
}

/// A named pipeline, one per target cluster.
#[derive(TypedBuilder, Getters, Clone)]
pub struct Target {
    #[getset(get = "pub")]
    #[builder(setter(into))]
    name: String,

    #[getset(get = "pub")]
    pipeline: Arc<Pipeline>,
}

/// Writes manifests to one cluster. Several pipelines, one per cluster, run side by side.
pub struct Pipeline {
    cluster: Arc<dyn Cluster>,
    store: Arc<MirrorStore>,
    upstreams: KindQueue<Upstream>,
    services: KindQueue<Service>,
}

impl Pipeline {
    /// Must be called within a Tokio runtime; the per-kind queue consumers are spawned here.
    pub fn new(cluster: Arc<dyn Cluster>, store: Arc<MirrorStore>, queue_capacity: usize) -> Self {
        Self {
            upstreams: KindQueue::spawn(queue_capacity, cluster.clone(), store.clone()),
            services: KindQueue::spawn(queue_capacity, cluster.clone(), store.clone()),
            cluster,
            store,
        }
    }

    pub fn cluster(&self) -> &Arc<dyn Cluster> {
        &self.cluster
    }

    pub fn store(&self) -> &Arc<MirrorStore> {
        &self.store
    }

    /// Finds a referenced object in the mirror, or in the remote when the mirror has
    /// no copy. A reference that matches no identity falls back to a unique short name.
    pub async fn resolve<T: Synced>(
        &self,
        identity: impl Into<Identity>,
    ) -> Result<Option<T>, SyncError> {
        solve::resolve_reference(self.cluster.as_ref(), &self.store, &identity.into()).await
    }

    pub async fn sync(&self, manifest: Manifest) -> Result<SyncReport, AggregateError> {
        self.sync_with_cancel(manifest, CancellationToken::new())
            .await
    }

    #[instrument(skip_all, fields(cluster = self.cluster.name(), objects = manifest.len()))]
    pub async fn sync_with_cancel(
        &self,
        manifest: Manifest,
        cancel: CancellationToken,
    ) -> Result<SyncReport, AggregateError> {
        let (routes, services, upstreams, ssls) = manifest.into_parts();
        let mut report = SyncReport::default();
        let mut errors = AggregateError::new();

        let upstream_hub = EventHub::<Upstream>::new();
        let service_hub = EventHub::<Service>::new();

        let service_workers = services
            .into_iter()
            .map(|service| {
                let mailbox = upstream_hub.subscribe(service.upstream_identity());
                (service, mailbox)
            })
            .collect::<Vec<_>>();
        let route_workers = routes
            .into_iter()
            .map(|route| {
                let mailbox = service_hub.subscribe(route.service_identity());
                (route, mailbox)
            })
            .collect::<Vec<_>>();

        let attempted = upstreams
            .iter()
            .map(|upstream| upstream.identity())
            .collect::<HashSet<_>>();
        let solved = upstreams.into_iter().map(|upstream| {
            let cancel = &cancel;
            async move {
                if cancel.is_cancelled() {
                    return Err(SyncError::cancelled(
                        ResourceKind::Upstream,
                        upstream.full_name(),
                    ));
                }
                self.upstreams.submit(Action::Apply(upstream)).await
            }
        });
        collect(solved, &upstream_hub, &mut report, &mut errors).await;
        self.publish_dangling(&upstream_hub, &attempted, &mut errors)
            .await;
        upstream_hub.close();

        let attempted = service_workers
            .iter()
            .map(|(service, _)| service.identity())
            .collect::<HashSet<_>>();
        let solved = service_workers.into_iter().map(|(service, mailbox)| {
            let cancel = &cancel;
            async move {
                let Some(event) = await_dependency(&service, mailbox, cancel).await? else {
                    debug!(
                        service = service.full_name(),
                        upstream = service.upstream_name(),
                        "Upstream not solved, service stalls"
                    );
                    return Ok(Outcome::Stalled);
                };
                let mut service = service;
                service.set_upstream_id(event.object.id().clone());
                self.services
                    .submit(Action::Apply(service))
                    .await
                    .map(Outcome::Solved)
            }
        });
        collect_outcomes(solved, &service_hub, &mut report, &mut errors).await;
        self.publish_dangling(&service_hub, &attempted, &mut errors)
            .await;
        service_hub.close();

        let route_hub = EventHub::<Route>::new();
        let solved = route_workers.into_iter().map(|(route, mailbox)| {
            let cancel = &cancel;
            async move {
                let Some(event) = await_dependency(&route, mailbox, cancel).await? else {
                    debug!(
                        route = route.full_name(),
                        service = route.service_name(),
                        "Service not solved, route stalls"
                    );
                    return Ok(Outcome::Stalled);
                };
                let mut route = route;
                route.set_service_id(event.object.id().clone());
                solve::solve(self.cluster.as_ref(), &self.store, route)
                    .await
                    .map(Outcome::Solved)
            }
        });
        collect_outcomes(solved, &route_hub, &mut report, &mut errors).await;

        let ssl_hub = EventHub::<Ssl>::new();
        let solved = ssls.into_iter().map(|ssl| {
            let cancel = &cancel;
            async move {
                if cancel.is_cancelled() {
                    return Err(SyncError::cancelled(ResourceKind::Ssl, ssl.full_name()));
                }
                solve::solve(self.cluster.as_ref(), &self.store, ssl).await
            }
        });
        collect(solved, &ssl_hub, &mut report, &mut errors).await;

        if !errors.is_empty() {
            warn!(failures = errors.len(), %errors, "Pass finished with failures");
        }
        errors.into_result(report)
    }

    /// Broadcasts dependencies that were referenced but not part of the manifest.
    async fn publish_dangling<T: Synced>(
        &self,
        hub: &EventHub<T>,
        attempted: &HashSet<Identity>,
        errors: &mut AggregateError,
    ) {
        for identity in hub.pending() {
            if attempted.contains(&identity) {
                continue;
            }

            match self.resolve::<T>(identity.clone()).await {
                Ok(Some(object)) => {
                    hub.publish_to(&identity, &Event::new(SyncState::Resolved, object));
                }
                Ok(None) => debug!(kind = %T::KIND, %identity, "Referenced object not found"),
                Err(err) => errors.push(err),
            }
        }
    }

    /// Retires the manifest's objects in reverse dependency order.
    #[instrument(skip_all, fields(cluster = self.cluster.name(), objects = manifest.len()))]
    pub async fn remove(&self, manifest: Manifest) -> Result<SyncReport, AggregateError> {
        let (routes, services, upstreams, ssls) = manifest.into_parts();
        let mut report = SyncReport::default();
        let mut errors = AggregateError::new();

        for route in routes {
            record(
                solve::retire(self.cluster.as_ref(), &self.store, route).await,
                &mut report,
                &mut errors,
            );
        }
        for service in services {
            record(
                self.services.submit(Action::Remove(service)).await,
                &mut report,
                &mut errors,
            );
        }
        for upstream in upstreams {
            record(
                self.upstreams.submit(Action::Remove(upstream)).await,
                &mut report,
                &mut errors,
            );
        }
        for ssl in ssls {
            record(
                solve::retire(self.cluster.as_ref(), &self.store, ssl).await,
                &mut report,
                &mut errors,
            );
        }

        errors.into_result(report)
    }
}

fn record<T>(
    result: Result<Event<T>, SyncError>,
    report: &mut SyncReport,
    errors: &mut AggregateError,
) {
    match result {
        Ok(event) => report.record(event.state),
        Err(err) => errors.push(err),
    }
}

async fn collect<T, F>(
    workers: impl Iterator<Item = F>,
    hub: &EventHub<T>,
    report: &mut SyncReport,
    errors: &mut AggregateError,
) where
    T: Synced,
    F: Future<Output = Result<Event<T>, SyncError>>,
{
    collect_outcomes(
        workers.map(|worker| async move { worker.await.map(Outcome::Solved) }),
        hub,
        report,
        errors,
    )
    .await;
}

async fn collect_outcomes<T, F>(
    workers: impl Iterator<Item = F>,
    hub: &EventHub<T>,
    report: &mut SyncReport,
    errors: &mut AggregateError,
) where
    T: Synced,
    F: Future<Output = Result<Outcome<T>, SyncError>>,
{
    let mut workers = workers.collect::<FuturesUnordered<_>>();
    while let Some(outcome) = workers.next().await {
        match outcome {
            Ok(Outcome::Solved(event)) => {
                report.record(event.state);
                hub.publish(&event);
            }
            Ok(Outcome::Stalled) => report.stalled += 1,
            Err(err) => {
                warn!(%err, "Write failed, dependents will stall");
                errors.push(err);
            }
        }
    }
}
