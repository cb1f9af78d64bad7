use crate::endpoints::ChangeKind;
use apisix_ingress_core::task::Spawner;
use dashmap::DashMap;
use futures::StreamExt;
use kube::runtime::reflector::{self, ObjectRef, Store};
use kube::runtime::watcher::{self, Event};
use kube::runtime::{WatchStreamExt, reflector::store::Writer};
use kube::{Api, Resource};
use serde::de::DeserializeOwned;
use std::fmt::Debug;
use std::hash::Hash;
use std::pin::pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, warn};

pub mod objects;
pub mod tls;

use objects::ObjectKey;

/// Read access to the live objects of one kind.
pub trait Lister<K>: Send + Sync {
    fn get(&self, key: &ObjectKey) -> Option<Arc<K>>;

    fn exists(&self, key: &ObjectKey) -> bool {
        self.get(key).is_some()
    }
}

impl<K> Lister<K> for Store<K>
where
    K: Resource + Clone + Send + Sync + 'static,
    K::DynamicType: Default + Eq + Hash + Clone + Send + Sync,
{
    fn get(&self, key: &ObjectKey) -> Option<Arc<K>> {
        let reference = ObjectRef::new(key.name());
        let reference = match key.namespace() {
            Some(namespace) => reference.within(namespace),
            None => reference,
        };
        Store::get(self, &reference)
    }
}

impl<K: Send + Sync> Lister<K> for DashMap<ObjectKey, Arc<K>> {
    fn get(&self, key: &ObjectKey) -> Option<Arc<K>> {
        DashMap::get(self, key).map(|object| object.clone())
    }
}

/// Watches every object of `K`, keeps `writer` current and hands each change to `on_change`.
pub fn spawn_watch<K, F>(spawner: Spawner, api: Api<K>, writer: Writer<K>, mut on_change: F)
where
    K: Resource + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
    K::DynamicType: Default + Eq + Hash + Clone + Send + Sync,
    F: FnMut(ChangeKind, K) + Send + 'static,
{
    spawner.spawn(async move {
        let stream = reflector::reflector(
            writer,
            watcher::watcher(api, watcher::Config::default()).default_backoff(),
        );
        let mut stream = pin!(stream);

        while let Some(event) = stream.next().await {
            match event {
                Ok(Event::Apply(object) | Event::InitApply(object)) => {
                    on_change(ChangeKind::Update, object);
                }
                Ok(Event::Delete(object)) => on_change(ChangeKind::Delete, object),
                Ok(Event::Init) => debug!("Watch (re)listing objects"),
                Ok(Event::InitDone) => debug!("Watch initial listing done"),
                Err(err) => warn!(%err, "Watch failed, backing off"),
            }
        }
    });
}

/// Hands every object cached in `store` to `on_change` once per `period`.
pub fn spawn_resync<K, F>(spawner: Spawner, store: Store<K>, period: Duration, mut on_change: F)
where
    K: Resource + Clone + Send + Sync + 'static,
    K::DynamicType: Default + Eq + Hash + Clone + Send + Sync,
    F: FnMut(ChangeKind, K) + Send + 'static,
{
    if period.is_zero() {
        debug!("Resync disabled");
        return;
    }

    spawner.spawn(async move {
        let mut ticks = tokio::time::interval_at(Instant::now() + period, period);
        ticks.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            ticks.tick().await;
            let objects = store.state();
            debug!(objects = objects.len(), "Resyncing");
            for object in objects {
                on_change(ChangeKind::Update, object.as_ref().clone());
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::Secret;
    use kube::api::ObjectMeta;

    fn secret(namespace: &str, name: &str) -> Secret {
        Secret {
            metadata: ObjectMeta {
                namespace: Some(namespace.to_string()),
                name: Some(name.to_string()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_store_lister_finds_namespaced_objects() {
        let mut writer = Writer::<Secret>::default();
        writer.apply_watcher_event(&Event::Apply(secret("prod", "site-tls")));
        let store = writer.as_reader();

        assert!(Lister::exists(&store, &ObjectKey::new("prod", "site-tls")));
        assert!(!Lister::exists(&store, &ObjectKey::new("dev", "site-tls")));
    }

    #[test]
    fn test_map_lister() {
        let objects = DashMap::new();
        objects.insert(
            ObjectKey::new("prod", "site-tls"),
            Arc::new(secret("prod", "site-tls")),
        );

        assert!(Lister::exists(&objects, &ObjectKey::new("prod", "site-tls")));
    }
}
