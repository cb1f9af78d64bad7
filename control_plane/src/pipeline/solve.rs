use crate::apisix::{ApisixResource, Identity};
use crate::cluster::{Cluster, Operation, Remote};
use crate::diff::{has_diff, pad_id};
use crate::errors::SyncError;
use crate::instrumentation::record_remote_write;
use crate::mirror::{Mirrored, MirrorStore};
use crate::ownership::Arbitrated;
use crate::pipeline::{Event, SyncState};
use tracing::{debug, instrument, warn};

/// Bound shared by every kind the pipeline writes.
pub trait Synced: Remote + Mirrored + Arbitrated {}

impl<T: Remote + Mirrored + Arbitrated> Synced for T {}

/// Looks `identity` up in the mirror, re-populating the mirror from the remote on a miss.
#[instrument(skip(cluster, store), fields(kind = %T::KIND, %identity))]
pub(crate) async fn resolve<T: Synced>(
    cluster: &dyn Cluster,
    store: &MirrorStore,
    identity: &Identity,
) -> Result<Option<T>, SyncError> {
    match store.get::<T>(identity.clone()) {
        Ok(found) => return Ok(Some(found)),
        Err(err) if err.is_not_found() => {}
        Err(err) => return Err(err.into()),
    }

    debug!("Mirror miss, listing remote objects");
    let listed = T::client(cluster)
        .list()
        .await
        .map_err(|err| SyncError::remote(T::KIND, identity.full_name(), err))?;
    store.insert_all(
        listed
            .into_iter()
            .filter(|object| !object.full_name().is_empty()),
    )?;

    match store.get::<T>(identity.clone()) {
        Ok(found) => Ok(Some(found)),
        Err(err) if err.is_not_found() => Ok(None),
        Err(err) => Err(err.into()),
    }
}

/// Resolves a reference by identity, then by a unique short name within the group.
pub(crate) async fn resolve_reference<T: Synced>(
    cluster: &dyn Cluster,
    store: &MirrorStore,
    identity: &Identity,
) -> Result<Option<T>, SyncError> {
    if let Some(found) = resolve::<T>(cluster, store, identity).await? {
        return Ok(Some(found));
    }

    let mut candidates = store.get_by_name::<T>(identity.group().as_deref(), identity.full_name())?;
    match candidates.len() {
        0 | 1 => Ok(candidates.pop()),
        count => {
            warn!(kind = %T::KIND, %identity, count, "Short name matches several objects");
            Ok(None)
        }
    }
}

/// Brings one object's remote state in line with `desired` and mirrors the result.
#[instrument(skip_all, fields(kind = %T::KIND, name = desired.full_name()))]
pub(crate) async fn solve<T: Synced>(
    cluster: &dyn Cluster,
    store: &MirrorStore,
    desired: T,
) -> Result<Event<T>, SyncError> {
    let observed = resolve::<T>(cluster, store, &desired.identity()).await?;

    let mut desired = match &observed {
        None => desired,
        Some(observed) => match T::arbitrate(desired, observed) {
            Some(merged) => merged,
            None => {
                debug!("Write suppressed by the owner of the observed object");
                return Ok(Event::new(SyncState::Suppressed, observed.clone()));
            }
        },
    };

    pad_id(&mut desired, observed.as_ref());
    if !has_diff(&desired, observed.as_ref())? {
        debug!("Object is up to date");
        return Ok(Event::new(SyncState::Unchanged, desired));
    }

    let client = T::client(cluster);
    let (operation, state, result) = if desired.id().is_unassigned() {
        (Operation::Create, SyncState::Created, client.create(&desired).await)
    } else {
        (Operation::Update, SyncState::Updated, client.update(&desired).await)
    };
    record_remote_write(T::KIND, operation, result.is_ok());

    let written = result.map_err(|err| SyncError::remote(T::KIND, desired.full_name(), err))?;
    debug!(%operation, id = %written.id(), "Object written");
    store.insert(written.clone())?;

    Ok(Event::new(state, written))
}

/// Deletes one object remotely and from the mirror. A missing remote object counts as deleted.
#[instrument(skip_all, fields(kind = %T::KIND, name = object.full_name()))]
pub(crate) async fn retire<T: Synced>(
    cluster: &dyn Cluster,
    store: &MirrorStore,
    object: T,
) -> Result<Event<T>, SyncError> {
    let target = if object.id().is_unassigned() {
        resolve::<T>(cluster, store, &object.identity())
            .await?
            .unwrap_or(object)
    } else {
        object
    };

    let result = T::client(cluster).delete(&target).await;
    record_remote_write(T::KIND, Operation::Delete, result.is_ok());
    match result {
        Ok(()) => debug!("Object deleted"),
        Err(err) if err.is_not_found() => debug!("Object already absent from the remote"),
        Err(err) => return Err(SyncError::remote(T::KIND, target.full_name(), err)),
    }

    match store.delete(&target) {
        Ok(_) => {}
        Err(err) if err.is_not_found() => {}
        Err(err) => return Err(err.into()),
    }

    Ok(Event::new(SyncState::Removed, target))
}
