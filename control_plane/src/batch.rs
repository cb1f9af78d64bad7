//! Whole-manifest reconciliation: what changed between two complete manifests
//! and how to apply that change.

use crate::apisix::{ApisixResource, Identity, Manifest, RemoteId, Route, Service, Ssl, Upstream};
use crate::cluster::{Cluster, Operation, Remote};
use crate::diff::{DiffError, has_diff, pad_id};
use crate::errors::{AggregateError, SyncError};
use crate::instrumentation::record_remote_write;
use crate::mirror::{Mirrored, MirrorStore};
use crate::pipeline::Synced;
use crate::pipeline::solve::resolve_reference;
use getset::Getters;
use std::collections::{HashMap, HashSet};
use tracing::{debug, instrument, warn};

#[derive(Debug, Clone, Default, PartialEq, Getters)]
#[getset(get = "pub")]
pub struct ManifestDiff {
    added: Manifest,
    updated: Manifest,
    deleted: Manifest,
}

impl ManifestDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.updated.is_empty() && self.deleted.is_empty()
    }
}

struct Changes<T> {
    added: Vec<T>,
    updated: Vec<T>,
    deleted: Vec<T>,
}

/// Matches every new object to an old one by remote id when it has one, by
/// identity otherwise.
fn diff_kind<T: ApisixResource>(old: &[T], new: &[T]) -> Result<Changes<T>, DiffError> {
    let by_id = old
        .iter()
        .enumerate()
        .filter_map(|(index, object)| object.id().as_assigned().map(|id| (id, index)))
        .collect::<HashMap<_, _>>();
    let by_identity = old
        .iter()
        .enumerate()
        .map(|(index, object)| (object.identity(), index))
        .collect::<HashMap<_, _>>();

    let mut matched = HashSet::new();
    let mut changes = Changes {
        added: Vec::new(),
        updated: Vec::new(),
        deleted: Vec::new(),
    };

    for object in new {
        let index = object
            .id()
            .as_assigned()
            .and_then(|id| by_id.get(id))
            .or_else(|| by_identity.get(&object.identity()))
            .copied()
            .filter(|index| !matched.contains(index));

        match index {
            None => changes.added.push(object.clone()),
            Some(index) => {
                matched.insert(index);
                let mut object = object.clone();
                pad_id(&mut object, Some(&old[index]));
                if has_diff(&object, Some(&old[index]))? {
                    changes.updated.push(object);
                }
            }
        }
    }

    changes.deleted = old
        .iter()
        .enumerate()
        .filter(|(index, _)| !matched.contains(index))
        .map(|(_, object)| object.clone())
        .collect();

    Ok(changes)
}

fn assigned_ids<T: ApisixResource>(objects: &[T]) -> HashMap<Identity, RemoteId> {
    objects
        .iter()
        .filter(|object| !object.id().is_unassigned())
        .map(|object| (object.identity(), object.id().clone()))
        .collect()
}

/// Objects only in `new` are added, objects in both that differ are updated and
/// objects only in `old` are deleted. References `new` leaves unassigned take the
/// ids of the objects `old` holds under those names.
pub fn diff(old: &Manifest, new: &Manifest) -> Result<ManifestDiff, DiffError> {
    let upstream_ids = assigned_ids(old.upstreams());
    let services = new
        .services()
        .iter()
        .cloned()
        .map(|mut service| {
            let inherited = upstream_ids
                .get(&service.upstream_identity())
                .filter(|_| service.upstream_id().is_unassigned())
                .cloned();
            if let Some(id) = inherited {
                service.set_upstream_id(id);
            }
            service
        })
        .collect::<Vec<_>>();
    let service_ids = assigned_ids(old.services());
    let routes = new
        .routes()
        .iter()
        .cloned()
        .map(|mut route| {
            let inherited = service_ids
                .get(&route.service_identity())
                .filter(|_| route.service_id().is_unassigned())
                .cloned();
            if let Some(id) = inherited {
                route.set_service_id(id);
            }
            route
        })
        .collect::<Vec<_>>();

    let routes = diff_kind(old.routes(), &routes)?;
    let services = diff_kind(old.services(), &services)?;
    let upstreams = diff_kind(old.upstreams(), new.upstreams())?;
    let ssls = diff_kind(old.ssls(), new.ssls())?;

    Ok(ManifestDiff {
        added: Manifest::builder()
            .routes(routes.added)
            .services(services.added)
            .upstreams(upstreams.added)
            .ssls(ssls.added)
            .build(),
        updated: Manifest::builder()
            .routes(routes.updated)
            .services(services.updated)
            .upstreams(upstreams.updated)
            .ssls(ssls.updated)
            .build(),
        deleted: Manifest::builder()
            .routes(routes.deleted)
            .services(services.deleted)
            .upstreams(upstreams.deleted)
            .ssls(ssls.deleted)
            .build(),
    })
}

struct Batch<'a> {
    cluster: &'a dyn Cluster,
    store: &'a MirrorStore,
    errors: AggregateError,
    /// Remote ids of the objects written so far, for stamping references.
    upstream_ids: HashMap<Identity, RemoteId>,
    service_ids: HashMap<Identity, RemoteId>,
}

/// Id for a reference to `dependency`: the id written in this batch, else the id the
/// reference already carries, else the id of the object found in the mirror or the
/// remote. `None` leaves the reference as it is.
async fn reference_id<D: Synced>(
    cluster: &dyn Cluster,
    store: &MirrorStore,
    written: &HashMap<Identity, RemoteId>,
    dependency: &Identity,
    current: &RemoteId,
) -> Result<Option<RemoteId>, SyncError> {
    if let Some(id) = written.get(dependency) {
        return Ok(Some(id.clone()));
    }
    if !current.is_unassigned() {
        return Ok(None);
    }

    let found = resolve_reference::<D>(cluster, store, dependency).await?;
    if found.is_none() {
        debug!(kind = %D::KIND, %dependency, "Referenced object not found");
    }
    Ok(found
        .map(|found| found.id().clone())
        .filter(|id| !id.is_unassigned()))
}

impl Batch<'_> {
    async fn write<T: Remote + Mirrored>(&mut self, operation: Operation, object: &T) -> Option<T> {
        let client = T::client(self.cluster);
        let result = match operation {
            Operation::Create => client.create(object).await,
            Operation::Update => client.update(object).await,
            Operation::Delete => client.delete(object).await.map(|()| object.clone()),
        };
        record_remote_write(T::KIND, operation, result.is_ok());

        let written = match result {
            Ok(written) => written,
            Err(err) if operation == Operation::Delete && err.is_not_found() => {
                debug!(kind = %T::KIND, name = object.full_name(), "Already deleted");
                object.clone()
            }
            Err(err) => {
                warn!(kind = %T::KIND, name = object.full_name(), %operation, %err, "Batch write failed");
                self.errors
                    .push(SyncError::remote(T::KIND, object.full_name(), err));
                return None;
            }
        };

        let mirrored = match operation {
            Operation::Delete => self.store.delete(&written).map(|_| ()).or_else(|err| {
                if err.is_not_found() { Ok(()) } else { Err(err) }
            }),
            Operation::Create | Operation::Update => self.store.insert(written.clone()),
        };
        if let Err(err) = mirrored {
            self.errors.push(err.into());
        }

        Some(written)
    }

    async fn write_all<T: Remote + Mirrored>(&mut self, operation: Operation, objects: Vec<T>) -> Vec<T> {
        let mut written = Vec::with_capacity(objects.len());
        for object in objects {
            if let Some(object) = self.write(operation, &object).await {
                written.push(object);
            }
        }
        written
    }

    async fn write_chain(&mut self, operation: Operation, manifest: &Manifest) {
        self.write_all(operation, manifest.ssls().clone()).await;

        for upstream in self
            .write_all(operation, manifest.upstreams().clone())
            .await
        {
            self.upstream_ids
                .insert(upstream.identity(), upstream.id().clone());
        }

        let mut services = Vec::with_capacity(manifest.services().len());
        for mut service in manifest.services().iter().cloned() {
            let stamped = reference_id::<Upstream>(
                self.cluster,
                self.store,
                &self.upstream_ids,
                &service.upstream_identity(),
                service.upstream_id(),
            )
            .await;
            match stamped {
                Ok(Some(id)) => {
                    service.set_upstream_id(id);
                }
                Ok(None) => {}
                Err(err) => self.errors.push(err),
            }
            services.push(service);
        }
        for service in self.write_all::<Service>(operation, services).await {
            self.service_ids
                .insert(service.identity(), service.id().clone());
        }

        let mut routes = Vec::with_capacity(manifest.routes().len());
        for mut route in manifest.routes().iter().cloned() {
            let stamped = reference_id::<Service>(
                self.cluster,
                self.store,
                &self.service_ids,
                &route.service_identity(),
                route.service_id(),
            )
            .await;
            match stamped {
                Ok(Some(id)) => {
                    route.set_service_id(id);
                }
                Ok(None) => {}
                Err(err) => self.errors.push(err),
            }
            routes.push(route);
        }
        self.write_all::<Route>(operation, routes).await;
    }
}

/// Applies `diff`: deletes routes, services, upstreams and ssls, then creates and
/// finally updates ssls, upstreams, services and routes. Every failure is
/// collected and the batch keeps going; successful writes are kept and mirrored.
#[instrument(skip_all, fields(cluster = cluster.name()))]
pub async fn apply(
    cluster: &dyn Cluster,
    store: &MirrorStore,
    diff: &ManifestDiff,
) -> Result<(), AggregateError> {
    let mut batch = Batch {
        cluster,
        store,
        errors: AggregateError::new(),
        upstream_ids: HashMap::new(),
        service_ids: HashMap::new(),
    };

    let deleted = diff.deleted();
    batch
        .write_all::<Route>(Operation::Delete, deleted.routes().clone())
        .await;
    batch
        .write_all::<Service>(Operation::Delete, deleted.services().clone())
        .await;
    batch
        .write_all::<Upstream>(Operation::Delete, deleted.upstreams().clone())
        .await;
    batch
        .write_all::<Ssl>(Operation::Delete, deleted.ssls().clone())
        .await;

    batch.write_chain(Operation::Create, diff.added()).await;
    batch.write_chain(Operation::Update, diff.updated()).await;

    batch.errors.into_result(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::apisix::{Metadata, Node};
    use assertables::assert_ok;

    fn upstream(full_name: &str, id: Option<&str>, port: u16) -> Upstream {
        let metadata = Metadata::builder()
            .id(RemoteId::from(id.map(ToString::to_string)))
            .full_name(full_name)
            .name(full_name)
            .build();
        Upstream::builder()
            .metadata(metadata)
            .nodes(vec![Node::builder().host("10.0.0.1").port(port).build()])
            .build()
    }

    #[test]
    fn test_diff_classifies_objects() {
        let old = Manifest::builder()
            .upstreams(vec![
                upstream("kept", Some("1"), 80),
                upstream("changed", Some("2"), 80),
                upstream("gone", Some("3"), 80),
            ])
            .build();
        let new = Manifest::builder()
            .upstreams(vec![
                upstream("kept", None, 80),
                upstream("changed", None, 8080),
                upstream("fresh", None, 80),
            ])
            .build();

        let diff = assert_ok!(diff(&old, &new));

        assert_eq!(diff.added().upstreams()[0].full_name(), "fresh");
        assert_eq!(diff.updated().upstreams().len(), 1);
        assert_eq!(diff.updated().upstreams()[0].id(), &RemoteId::assigned("2"));
        assert_eq!(diff.deleted().upstreams()[0].full_name(), "gone");
    }

    #[test]
    fn test_diff_matches_renamed_object_by_id() {
        let old = Manifest::builder()
            .upstreams(vec![upstream("before", Some("1"), 80)])
            .build();
        let new = Manifest::builder()
            .upstreams(vec![upstream("after", Some("1"), 80)])
            .build();

        let diff = assert_ok!(diff(&old, &new));

        assert!(diff.added().is_empty());
        assert!(diff.deleted().is_empty());
        assert_eq!(diff.updated().upstreams()[0].full_name(), "after");
    }

    #[test]
    fn test_diff_inherits_reference_ids_from_old() {
        let stored = Service::builder()
            .metadata(
                Metadata::builder()
                    .id(RemoteId::assigned("7"))
                    .full_name("s")
                    .name("s")
                    .build(),
            )
            .upstream_name("u")
            .upstream_id(RemoteId::assigned("1"))
            .build();
        let old = Manifest::builder()
            .upstreams(vec![upstream("u", Some("1"), 80)])
            .services(vec![stored])
            .build();
        let new = Manifest::builder()
            .upstreams(vec![upstream("u", None, 80)])
            .services(vec![
                Service::builder()
                    .metadata(Metadata::builder().full_name("s").name("s").build())
                    .upstream_name("u")
                    .build(),
            ])
            .build();

        assert!(assert_ok!(diff(&old, &new)).is_empty());
    }

    #[test]
    fn test_identical_manifests_have_empty_diff() {
        let manifest = Manifest::builder()
            .upstreams(vec![upstream("a", Some("1"), 80)])
            .build();
        assert!(assert_ok!(diff(&manifest, &manifest)).is_empty());
    }
}
