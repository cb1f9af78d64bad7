use crate::apisix::{ApisixResource, RemoteId, ResourceKind, Route, Service, Ssl, Upstream};
use crate::cluster::{Cluster, ClusterError, Operation, ResourceClient};
use async_trait::async_trait;
use dashmap::DashMap;
use getset::{CopyGetters, Getters};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::trace;

/// A remote write as observed by [`MemoryCluster`].
#[derive(Debug, Clone, PartialEq, Eq, Getters, CopyGetters)]
pub struct Call {
    #[getset(get_copy = "pub")]
    kind: ResourceKind,

    #[getset(get_copy = "pub")]
    operation: Operation,

    #[getset(get = "pub")]
    name: String,

    #[getset(get_copy = "pub")]
    succeeded: bool,
}

#[derive(Default)]
struct Journal {
    calls: Mutex<Vec<Call>>,
    failures: DashMap<String, ClusterError>,
    delays: DashMap<String, Duration>,
    next_id: AtomicU64,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Journal {
    fn record<T: ApisixResource>(&self, operation: Operation, object: &T, succeeded: bool) {
        trace!(kind = %T::KIND, %operation, name = object.full_name(), succeeded, "Recording call");
        lock(&self.calls).push(Call {
            kind: T::KIND,
            operation,
            name: object.full_name().to_string(),
            succeeded,
        });
    }

    fn injected_failure(&self, full_name: &str) -> Option<ClusterError> {
        self.failures.get(full_name).map(|failure| failure.clone())
    }

    async fn injected_delay(&self, full_name: &str) {
        let delay = self.delays.get(full_name).map(|delay| *delay);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
    }
}

struct MemoryClient<T> {
    objects: Mutex<BTreeMap<String, T>>,
    journal: Arc<Journal>,
}

impl<T: ApisixResource> MemoryClient<T> {
    fn new(journal: Arc<Journal>) -> Self {
        Self {
            objects: Mutex::new(BTreeMap::new()),
            journal,
        }
    }

    fn write<R>(
        &self,
        operation: Operation,
        object: &T,
        apply: impl FnOnce(&mut BTreeMap<String, T>) -> Result<R, ClusterError>,
    ) -> Result<R, ClusterError> {
        let result = match self.journal.injected_failure(object.full_name()) {
            Some(failure) => Err(failure),
            None => apply(&mut lock(&self.objects)),
        };
        self.journal.record(operation, object, result.is_ok());
        result
    }
}

#[async_trait]
impl<T: ApisixResource> ResourceClient<T> for MemoryClient<T> {
    async fn get(&self, full_name: &str) -> Result<T, ClusterError> {
        lock(&self.objects)
            .get(full_name)
            .cloned()
            .ok_or_else(|| ClusterError::not_found(T::KIND, full_name))
    }

    async fn list(&self) -> Result<Vec<T>, ClusterError> {
        Ok(lock(&self.objects).values().cloned().collect())
    }

    async fn create(&self, object: &T) -> Result<T, ClusterError> {
        self.journal.injected_delay(object.full_name()).await;
        self.write(Operation::Create, object, |objects| {
            if objects.contains_key(object.full_name()) {
                return Err(ClusterError::Validation(format!(
                    "{} {} already exists",
                    T::KIND,
                    object.full_name()
                )));
            }

            let id = self.journal.next_id.fetch_add(1, Ordering::SeqCst) + 1;
            let mut created = object.clone();
            created.set_id(RemoteId::assigned(format!("{id:020}")));
            objects.insert(created.full_name().to_string(), created.clone());
            Ok(created)
        })
    }

    async fn update(&self, object: &T) -> Result<T, ClusterError> {
        self.journal.injected_delay(object.full_name()).await;
        self.write(Operation::Update, object, |objects| {
            match objects.get(object.full_name()) {
                Some(existing) if existing.id() == object.id() => {
                    objects.insert(object.full_name().to_string(), object.clone());
                    Ok(object.clone())
                }
                _ => Err(ClusterError::not_found(T::KIND, object.full_name())),
            }
        })
    }

    async fn delete(&self, object: &T) -> Result<(), ClusterError> {
        self.journal.injected_delay(object.full_name()).await;
        self.write(Operation::Delete, object, |objects| {
            objects
                .remove(object.full_name())
                .map(|_| ())
                .ok_or_else(|| ClusterError::not_found(T::KIND, object.full_name()))
        })
    }
}

/// In-memory control plane recording every write it receives.
pub struct MemoryCluster {
    name: String,
    journal: Arc<Journal>,
    routes: MemoryClient<Route>,
    services: MemoryClient<Service>,
    upstreams: MemoryClient<Upstream>,
    ssls: MemoryClient<Ssl>,
}

pub trait Stored: ApisixResource {
    #[doc(hidden)]
    fn objects(cluster: &MemoryCluster) -> &Mutex<BTreeMap<String, Self>>;
}

macro_rules! stored {
    ($type:ty, $field:ident) => {
        impl Stored for $type {
            fn objects(cluster: &MemoryCluster) -> &Mutex<BTreeMap<String, Self>> {
                &cluster.$field.objects
            }
        }
    };
}

stored!(Route, routes);
stored!(Service, services);
stored!(Upstream, upstreams);
stored!(Ssl, ssls);

impl MemoryCluster {
    pub fn new<S: Into<String>>(name: S) -> Self {
        let journal = Arc::new(Journal::default());
        Self {
            name: name.into(),
            routes: MemoryClient::new(journal.clone()),
            services: MemoryClient::new(journal.clone()),
            upstreams: MemoryClient::new(journal.clone()),
            ssls: MemoryClient::new(journal.clone()),
            journal,
        }
    }

    /// Places `object` directly into the remote state without recording a call.
    pub fn seed<T: Stored>(&self, mut object: T) -> T {
        if object.id().is_unassigned() {
            let id = self.journal.next_id.fetch_add(1, Ordering::SeqCst) + 1;
            object.set_id(RemoteId::assigned(format!("{id:020}")));
        }
        lock(T::objects(self)).insert(object.full_name().to_string(), object.clone());
        object
    }

    pub fn object<T: Stored>(&self, full_name: &str) -> Option<T> {
        lock(T::objects(self)).get(full_name).cloned()
    }

    /// Makes every subsequent write of the object named `full_name` fail with `error`.
    pub fn fail_on<S: Into<String>>(&self, full_name: S, error: ClusterError) {
        self.journal.failures.insert(full_name.into(), error);
    }

    pub fn clear_failures(&self) {
        self.journal.failures.clear();
    }

    /// Makes every subsequent write of the object named `full_name` take `delay`.
    pub fn delay_on<S: Into<String>>(&self, full_name: S, delay: Duration) {
        self.journal.delays.insert(full_name.into(), delay);
    }

    pub fn calls(&self) -> Vec<Call> {
        lock(&self.journal.calls).clone()
    }

    pub fn calls_for(&self, full_name: &str) -> Vec<Call> {
        self.calls()
            .into_iter()
            .filter(|call| call.name == full_name)
            .collect()
    }

    pub fn clear_calls(&self) {
        lock(&self.journal.calls).clear();
    }
}

impl Cluster for MemoryCluster {
    fn name(&self) -> &str {
        &self.name
    }

    fn routes(&self) -> &dyn ResourceClient<Route> {
        &self.routes
    }

    fn services(&self) -> &dyn ResourceClient<Service> {
        &self.services
    }

    fn upstreams(&self) -> &dyn ResourceClient<Upstream> {
        &self.upstreams
    }

    fn ssls(&self) -> &dyn ResourceClient<Ssl> {
        &self.ssls
    }
}
