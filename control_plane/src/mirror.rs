use crate::apisix::{ApisixResource, Identity, ResourceKind, Route, Service, Ssl, Upstream};
use std::collections::{BTreeSet, HashMap};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use thiserror::Error;
use tracing::trace;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("{kind} {name} not found in mirror")]
    NotFound { kind: ResourceKind, name: String },
    #[error("{kind} without a full name cannot be mirrored")]
    MissingFullName { kind: ResourceKind },
    #[error("mirror lock poisoned")]
    Poisoned,
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

/// One resource-kind partition with a unique primary index on the identity (group
/// and full name) and a non-unique secondary index on the short name.
#[derive(Debug)]
pub struct Partition<T> {
    by_identity: HashMap<Identity, T>,
    by_name: HashMap<String, BTreeSet<Identity>>,
}

impl<T> Default for Partition<T> {
    fn default() -> Self {
        Self {
            by_identity: HashMap::new(),
            by_name: HashMap::new(),
        }
    }
}

impl<T: ApisixResource> Partition<T> {
    fn put(&mut self, object: T) -> Option<T> {
        let identity = object.identity();
        let name = object.name().to_string();
        let previous = self.by_identity.insert(identity.clone(), object);
        if let Some(previous) = &previous {
            self.unindex(previous.name(), &identity);
        }
        self.by_name.entry(name).or_default().insert(identity);
        previous
    }

    fn take(&mut self, identity: &Identity) -> Option<T> {
        let removed = self.by_identity.remove(identity)?;
        self.unindex(removed.name(), identity);
        Some(removed)
    }

    fn unindex(&mut self, name: &str, identity: &Identity) {
        if let Some(identities) = self.by_name.get_mut(name) {
            identities.remove(identity);
            if identities.is_empty() {
                self.by_name.remove(name);
            }
        }
    }
}

#[derive(Debug, Default)]
pub struct MirrorTables {
    routes: Partition<Route>,
    services: Partition<Service>,
    upstreams: Partition<Upstream>,
    ssls: Partition<Ssl>,
}

pub trait Mirrored: ApisixResource {
    #[doc(hidden)]
    fn partition(tables: &MirrorTables) -> &Partition<Self>;

    #[doc(hidden)]
    fn partition_mut(tables: &mut MirrorTables) -> &mut Partition<Self>;
}

macro_rules! mirrored {
    ($type:ty, $field:ident) => {
        impl Mirrored for $type {
            fn partition(tables: &MirrorTables) -> &Partition<Self> {
                &tables.$field
            }

            fn partition_mut(tables: &mut MirrorTables) -> &mut Partition<Self> {
                &mut tables.$field
            }
        }
    };
}

mirrored!(Route, routes);
mirrored!(Service, services);
mirrored!(Upstream, upstreams);
mirrored!(Ssl, ssls);

enum Undo<T> {
    Restore(T),
    Remove(Identity),
}

/// Mutation batch over one partition. Dropping it without commit reverts every change.
struct Transaction<'a, T: Mirrored> {
    tables: RwLockWriteGuard<'a, MirrorTables>,
    undo: Vec<Undo<T>>,
}

impl<T: Mirrored> Transaction<'_, T> {
    fn put(&mut self, object: T) -> Result<(), StoreError> {
        if object.full_name().is_empty() {
            return Err(StoreError::MissingFullName { kind: T::KIND });
        }
        let identity = object.identity();
        match T::partition_mut(&mut self.tables).put(object) {
            Some(previous) => self.undo.push(Undo::Restore(previous)),
            None => self.undo.push(Undo::Remove(identity)),
        }
        Ok(())
    }

    fn take(&mut self, identity: &Identity) -> Result<T, StoreError> {
        let removed = T::partition_mut(&mut self.tables)
            .take(identity)
            .ok_or_else(|| StoreError::NotFound {
                kind: T::KIND,
                name: identity.to_string(),
            })?;
        self.undo.push(Undo::Restore(removed.clone()));
        Ok(removed)
    }

    fn commit(mut self) {
        self.undo.clear();
    }
}

impl<T: Mirrored> Drop for Transaction<'_, T> {
    fn drop(&mut self) {
        if self.undo.is_empty() {
            return;
        }
        trace!(kind = %T::KIND, changes = self.undo.len(), "Rolling back mirror transaction");
        let undo = std::mem::take(&mut self.undo);
        let partition = T::partition_mut(&mut self.tables);
        for step in undo.into_iter().rev() {
            match step {
                Undo::Restore(previous) => {
                    partition.put(previous);
                }
                Undo::Remove(identity) => {
                    partition.take(&identity);
                }
            }
        }
    }
}

/// Last-known-synced copy of the remote state, one instance per pipeline.
#[derive(Debug, Default)]
pub struct MirrorStore {
    tables: RwLock<MirrorTables>,
}

impl MirrorStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, MirrorTables>, StoreError> {
        self.tables.read().map_err(|_| StoreError::Poisoned)
    }

    fn begin<T: Mirrored>(&self) -> Result<Transaction<'_, T>, StoreError> {
        let tables = self.tables.write().map_err(|_| StoreError::Poisoned)?;
        Ok(Transaction {
            tables,
            undo: Vec::new(),
        })
    }

    pub fn insert<T: Mirrored>(&self, object: T) -> Result<(), StoreError> {
        let mut transaction = self.begin::<T>()?;
        transaction.put(object)?;
        transaction.commit();
        Ok(())
    }

    /// Inserts every object or none of them.
    pub fn insert_all<T: Mirrored, I: IntoIterator<Item = T>>(
        &self,
        objects: I,
    ) -> Result<(), StoreError> {
        let mut transaction = self.begin::<T>()?;
        for object in objects {
            transaction.put(object)?;
        }
        transaction.commit();
        Ok(())
    }

    /// A plain full name addresses the object outside any group.
    pub fn get<T: Mirrored>(&self, identity: impl Into<Identity>) -> Result<T, StoreError> {
        let identity = identity.into();
        T::partition(&*self.read()?)
            .by_identity
            .get(&identity)
            .cloned()
            .ok_or_else(|| StoreError::NotFound {
                kind: T::KIND,
                name: identity.to_string(),
            })
    }

    /// Objects of `group` whose short name is `name`, ordered by full name.
    pub fn get_by_name<T: Mirrored>(
        &self,
        group: Option<&str>,
        name: &str,
    ) -> Result<Vec<T>, StoreError> {
        let tables = self.read()?;
        let partition = T::partition(&tables);
        Ok(partition
            .by_name
            .get(name)
            .into_iter()
            .flatten()
            .filter(|identity| identity.group().as_deref() == group)
            .filter_map(|identity| partition.by_identity.get(identity).cloned())
            .collect())
    }

    pub fn list<T: Mirrored>(&self) -> Result<Vec<T>, StoreError> {
        Ok(T::partition(&*self.read()?)
            .by_identity
            .values()
            .cloned()
            .collect())
    }

    pub fn delete<T: Mirrored>(&self, object: &T) -> Result<T, StoreError> {
        let mut transaction = self.begin::<T>()?;
        let removed = transaction.take(&object.identity())?;
        transaction.commit();
        Ok(removed)
    }

    pub fn len<T: Mirrored>(&self) -> Result<usize, StoreError> {
        Ok(T::partition(&*self.read()?).by_identity.len())
    }
}
