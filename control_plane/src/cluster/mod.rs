mod admin_api;
mod memory;

pub use admin_api::{AdminApiCluster, AdminApiConfig, derive_id};
pub use memory::{Call, MemoryCluster, Stored};

use crate::apisix::{ApisixResource, ResourceKind, Route, Service, Ssl, Upstream};
use async_trait::async_trait;
use strum::Display;
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ClusterError {
    #[error("{kind} {name} not found")]
    NotFound { kind: ResourceKind, name: String },
    #[error("admin API unavailable: {0}")]
    Transient(String),
    #[error("admin API rejected the request: {0}")]
    Validation(String),
}

impl ClusterError {
    pub fn not_found<S: Into<String>>(kind: ResourceKind, name: S) -> Self {
        Self::NotFound {
            kind,
            name: name.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[strum(serialize_all = "lowercase")]
pub enum Operation {
    Create,
    Update,
    Delete,
}

/// Per-kind capability of the remote control plane.
#[async_trait]
pub trait ResourceClient<T: ApisixResource>: Send + Sync {
    async fn get(&self, full_name: &str) -> Result<T, ClusterError>;

    async fn list(&self) -> Result<Vec<T>, ClusterError>;

    async fn create(&self, object: &T) -> Result<T, ClusterError>;

    async fn update(&self, object: &T) -> Result<T, ClusterError>;

    async fn delete(&self, object: &T) -> Result<(), ClusterError>;
}

/// One logical APISIX control plane.
pub trait Cluster: Send + Sync {
    fn name(&self) -> &str;

    fn routes(&self) -> &dyn ResourceClient<Route>;

    fn services(&self) -> &dyn ResourceClient<Service>;

    fn upstreams(&self) -> &dyn ResourceClient<Upstream>;

    fn ssls(&self) -> &dyn ResourceClient<Ssl>;
}

pub trait Remote: ApisixResource {
    fn client(cluster: &dyn Cluster) -> &dyn ResourceClient<Self>;
}

impl Remote for Route {
    fn client(cluster: &dyn Cluster) -> &dyn ResourceClient<Self> {
        cluster.routes()
    }
}

impl Remote for Service {
    fn client(cluster: &dyn Cluster) -> &dyn ResourceClient<Self> {
        cluster.services()
    }
}

impl Remote for Upstream {
    fn client(cluster: &dyn Cluster) -> &dyn ResourceClient<Self> {
        cluster.upstreams()
    }
}

impl Remote for Ssl {
    fn client(cluster: &dyn Cluster) -> &dyn ResourceClient<Self> {
        cluster.ssls()
    }
}
