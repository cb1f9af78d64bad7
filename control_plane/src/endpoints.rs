//! Projection of Endpoints and EndpointSlice changes onto upstream node lists.

use crate::apisix::{Manifest, Node, SourceKind, Upstream};
use crate::errors::{AggregateError, SyncError};
use crate::kubernetes::Lister;
use crate::kubernetes::objects::{ObjectKey, ObjectKeyError};
use crate::pipeline::Target;
use dashmap::DashMap;
use getset::{CopyGetters, Getters};
use k8s_openapi::api::core::v1::{Endpoints, Service};
use k8s_openapi::api::discovery::v1::EndpointSlice;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use strum::Display;
use thiserror::Error;
use tracing::{debug, instrument, warn};
use typed_builder::TypedBuilder;

pub const SERVICE_NAME_LABEL: &str = "kubernetes.io/service-name";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[strum(serialize_all = "lowercase")]
pub enum ChangeKind {
    Add,
    Update,
    Delete,
}

#[derive(Debug, Clone, PartialEq)]
pub enum EndpointSource {
    Endpoints(Box<Endpoints>),
    Slice(Box<EndpointSlice>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct EndpointChange {
    pub kind: ChangeKind,
    pub source: EndpointSource,
}

impl EndpointChange {
    pub fn endpoints(kind: ChangeKind, endpoints: Endpoints) -> Self {
        Self {
            kind,
            source: EndpointSource::Endpoints(Box::new(endpoints)),
        }
    }

    pub fn slice(kind: ChangeKind, slice: EndpointSlice) -> Self {
        Self {
            kind,
            source: EndpointSource::Slice(Box::new(slice)),
        }
    }

    /// Key of the Endpoints or EndpointSlice object that changed.
    pub fn object(&self) -> Result<ObjectKey, ObjectKeyError> {
        match &self.source {
            EndpointSource::Endpoints(endpoints) => ObjectKey::for_object(&**endpoints),
            EndpointSource::Slice(slice) => ObjectKey::for_object(&**slice),
        }
    }

    pub fn is_slice(&self) -> bool {
        matches!(self.source, EndpointSource::Slice(_))
    }
}

#[derive(Debug, Error)]
pub enum ProjectionError {
    #[error(transparent)]
    Key(#[from] ObjectKeyError),
    #[error("EndpointSlice {0} has no {SERVICE_NAME_LABEL} label")]
    UnownedSlice(ObjectKey),
    #[error(transparent)]
    Sync(#[from] AggregateError),
}

impl ProjectionError {
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Key(_) | Self::UnownedSlice(_) => false,
            Self::Sync(errors) => errors.is_retryable(),
        }
    }
}

/// Node lists of one Kubernetes Service, keyed by the port the Service exposes.
#[derive(Debug, Clone, PartialEq, Eq, Getters)]
#[getset(get = "pub")]
pub struct Projection {
    service: ObjectKey,
    nodes: BTreeMap<i32, Vec<Node>>,
}

impl Projection {
    pub fn upstream_names(&self) -> impl Iterator<Item = (String, &Vec<Node>)> {
        self.nodes.iter().map(|(port, nodes)| {
            (
                Upstream::compose_name(self.service.namespace_or_default(), self.service.name(), *port),
                nodes,
            )
        })
    }
}

fn node(host: &str, port: i32, weight: u32) -> Option<Node> {
    match u16::try_from(port) {
        Ok(port) => Some(Node::builder().host(host).port(port).weight(weight).build()),
        Err(_) => {
            warn!(host, port, "Skipping endpoint with an out-of-range port");
            None
        }
    }
}

/// A port published by Endpoints or an EndpointSlice: the name it shares with the
/// Service port and the number the backends listen on.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct TargetPort {
    name: String,
    number: i32,
}

type TargetNodes = BTreeMap<TargetPort, BTreeSet<Node>>;

fn slice_ports(slice: &EndpointSlice) -> impl Iterator<Item = TargetPort> + '_ {
    slice.ports.iter().flatten().filter_map(|port| {
        port.port.map(|number| TargetPort {
            name: port.name.clone().unwrap_or_default(),
            number,
        })
    })
}

fn slice_nodes(slice: &EndpointSlice, weight: u32, nodes: &mut TargetNodes) {
    let ready = slice
        .endpoints
        .iter()
        .filter(|endpoint| match endpoint.conditions.as_ref().and_then(|c| c.ready) {
            Some(true) => true,
            _ => {
                debug!(
                    slice = ?slice.metadata.name,
                    "Skipping endpoint in EndpointSlice: not ready"
                );
                false
            }
        })
        .flat_map(|endpoint| endpoint.addresses.iter())
        .collect::<Vec<_>>();

    for port in slice_ports(slice) {
        let number = port.number;
        let entry = nodes.entry(port).or_default();
        entry.extend(ready.iter().filter_map(|host| node(host, number, weight)));
    }
}

fn endpoints_nodes(endpoints: &Endpoints, weight: u32) -> TargetNodes {
    let mut nodes = TargetNodes::new();
    for subset in endpoints.subsets.iter().flatten() {
        for port in subset.ports.iter().flatten() {
            let target = TargetPort {
                name: port.name.clone().unwrap_or_default(),
                number: port.port,
            };
            let entry = nodes.entry(target).or_default();
            entry.extend(
                subset
                    .addresses
                    .iter()
                    .flatten()
                    .filter_map(|address| node(&address.ip, port.port, weight)),
            );
        }
    }
    nodes
}

/// Rebuilds upstream node lists from endpoint changes and writes them to every target.
#[derive(TypedBuilder, Getters, CopyGetters)]
pub struct EndpointProjector {
    #[getset(get = "pub")]
    targets: Vec<Target>,

    #[getset(get_copy = "pub")]
    #[builder(default = 100)]
    default_weight: u32,

    /// Kubernetes Services, for mapping target ports back to the ports they expose.
    services: Arc<dyn Lister<Service>>,

    /// Slices of every Service seen so far, by slice name.
    #[builder(default)]
    slices: DashMap<ObjectKey, BTreeMap<String, EndpointSlice>>,
}

impl EndpointProjector {
    /// Node lists implied by `change`. A Service's slices are combined, so a change
    /// to one slice re-projects the whole Service.
    pub fn project(&self, change: &EndpointChange) -> Result<Projection, ProjectionError> {
        match &change.source {
            EndpointSource::Endpoints(endpoints) => {
                let service = ObjectKey::for_object(&**endpoints)?;
                let mut nodes = endpoints_nodes(endpoints, self.default_weight);
                if change.kind == ChangeKind::Delete {
                    nodes.values_mut().for_each(BTreeSet::clear);
                }
                let nodes = self.expose(&service, nodes);
                Ok(Projection { service, nodes })
            }
            EndpointSource::Slice(slice) => self.project_slice(change.kind, slice),
        }
    }

    /// The Service port publishing `target`, matched by port name. Without a cached
    /// Service the target port is assumed to be exposed as is.
    fn service_port(&self, service: &ObjectKey, target: &TargetPort) -> Option<i32> {
        let Some(found) = self.services.get(service) else {
            debug!(%service, port = target.number, "Service not cached, using the target port");
            return Some(target.number);
        };

        let exposed = found
            .spec
            .iter()
            .flat_map(|spec| spec.ports.iter().flatten())
            .find(|port| port.name.as_deref().unwrap_or_default() == target.name)
            .map(|port| port.port);
        if exposed.is_none() {
            debug!(%service, name = %target.name, "Port not exposed by the Service, skipping");
        }
        exposed
    }

    fn expose(&self, service: &ObjectKey, nodes: TargetNodes) -> BTreeMap<i32, Vec<Node>> {
        let mut exposed: BTreeMap<i32, BTreeSet<Node>> = BTreeMap::new();
        for (target, nodes) in nodes {
            if let Some(port) = self.service_port(service, &target) {
                exposed.entry(port).or_default().extend(nodes);
            }
        }
        exposed
            .into_iter()
            .map(|(port, nodes)| (port, nodes.into_iter().collect()))
            .collect()
    }

    fn project_slice(
        &self,
        kind: ChangeKind,
        slice: &EndpointSlice,
    ) -> Result<Projection, ProjectionError> {
        let key = ObjectKey::for_object(slice)?;
        let service_name = slice
            .metadata
            .labels
            .as_ref()
            .and_then(|labels| labels.get(SERVICE_NAME_LABEL))
            .ok_or_else(|| ProjectionError::UnownedSlice(key.clone()))?;
        let service = ObjectKey::builder()
            .namespace(key.namespace_or_default())
            .name(service_name)
            .build();

        let mut slices = self.slices.entry(service.clone()).or_default();
        match kind {
            ChangeKind::Add | ChangeKind::Update => {
                slices.insert(key.name().clone(), slice.clone());
            }
            ChangeKind::Delete => {
                slices.remove(key.name());
            }
        }

        let mut nodes: TargetNodes = slice_ports(slice).map(|port| (port, BTreeSet::new())).collect();
        for remaining in slices.values() {
            slice_nodes(remaining, self.default_weight, &mut nodes);
        }

        let now_empty = slices.is_empty();
        drop(slices);
        if now_empty {
            self.slices.remove_if(&service, |_, slices| slices.is_empty());
        }

        let nodes = self.expose(&service, nodes);
        Ok(Projection { service, nodes })
    }

    /// Writes the node lists implied by `change` to every target that already
    /// has the corresponding upstream.
    #[instrument(skip_all, fields(kind = %change.kind))]
    pub async fn apply(&self, change: &EndpointChange) -> Result<(), ProjectionError> {
        let projection = self.project(change)?;
        let mut errors = AggregateError::new();

        for (upstream_name, nodes) in projection.upstream_names() {
            for target in &self.targets {
                if let Err(err) = self.apply_to(target, &upstream_name, nodes).await {
                    warn!(cluster = %target.name(), upstream = %upstream_name, %err, "Unable to project endpoints");
                    errors.extend(err);
                }
            }
        }

        errors.into_result(()).map_err(ProjectionError::from)
    }

    async fn apply_to(
        &self,
        target: &Target,
        upstream_name: &str,
        nodes: &[Node],
    ) -> Result<(), AggregateError> {
        let Some(mut upstream) = target
            .pipeline()
            .resolve::<Upstream>(upstream_name)
            .await
            .map_err(AggregateError::from)?
        else {
            debug!(cluster = %target.name(), upstream = upstream_name, "No upstream for endpoints, skipping");
            return Ok(());
        };

        upstream.set_nodes(nodes.to_vec());
        upstream.set_source(SourceKind::EndpointWatch);

        let report = target
            .pipeline()
            .sync(Manifest::of_upstream(upstream))
            .await?;
        debug!(
            cluster = %target.name(),
            upstream = upstream_name,
            writes = report.writes(),
            "Projected endpoints"
        );
        Ok(())
    }
}

impl From<SyncError> for ProjectionError {
    fn from(error: SyncError) -> Self {
        Self::Sync(AggregateError::from(error))
    }
}
