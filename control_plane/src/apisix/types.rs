use getset::{CopyGetters, Getters, Setters};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt::{Debug, Display, Formatter};
use strum::{AsRefStr, Display as StrumDisplay, EnumIter};
use typed_builder::TypedBuilder;

pub type Plugins = BTreeMap<String, Value>;

/// Identifier handed out by the remote control plane once an object exists there.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "Option<String>", into = "Option<String>")]
pub enum RemoteId {
    #[default]
    Unassigned,
    Assigned(String),
}

impl RemoteId {
    pub fn assigned<S: Into<String>>(id: S) -> Self {
        Self::Assigned(id.into())
    }

    pub fn is_unassigned(&self) -> bool {
        matches!(self, Self::Unassigned)
    }

    pub fn as_assigned(&self) -> Option<&str> {
        match self {
            Self::Assigned(id) => Some(id),
            Self::Unassigned => None,
        }
    }
}

impl From<Option<String>> for RemoteId {
    fn from(id: Option<String>) -> Self {
        match id {
            Some(id) if !id.is_empty() => Self::Assigned(id),
            _ => Self::Unassigned,
        }
    }
}

impl From<RemoteId> for Option<String> {
    fn from(id: RemoteId) -> Self {
        match id {
            RemoteId::Assigned(id) => Some(id),
            RemoteId::Unassigned => None,
        }
    }
}

impl Display for RemoteId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Assigned(id) => f.write_str(id),
            Self::Unassigned => f.write_str("<unassigned>"),
        }
    }
}

/// The producer that last authoritatively wrote an upstream or service.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, StrumDisplay, AsRefStr,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum SourceKind {
    /// Derived from a core Kubernetes Service.
    #[default]
    KubernetesService,
    /// Derived from a dedicated, human-authored custom resource.
    Crd,
    /// Written by the Endpoints/EndpointSlice projection.
    EndpointWatch,
}

impl SourceKind {
    pub fn is_durable(self) -> bool {
        matches!(self, Self::Crd)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, StrumDisplay, EnumIter)]
#[strum(serialize_all = "lowercase")]
pub enum ResourceKind {
    Route,
    Service,
    Upstream,
    Ssl,
}

impl ResourceKind {
    /// Collection segment of the admin API path.
    pub fn collection(self) -> &'static str {
        match self {
            Self::Route => "routes",
            Self::Service => "services",
            Self::Upstream => "upstreams",
            Self::Ssl => "ssls",
        }
    }
}

#[derive(
    Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, TypedBuilder, Getters, Setters,
)]
pub struct Metadata {
    #[getset(get = "pub", set = "pub")]
    #[serde(default, skip_serializing_if = "RemoteId::is_unassigned")]
    #[builder(default)]
    id: RemoteId,

    #[getset(get = "pub")]
    #[builder(setter(into))]
    full_name: String,

    #[getset(get = "pub")]
    #[builder(setter(into))]
    name: String,

    #[getset(get = "pub", set = "pub")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[builder(default, setter(strip_option, into))]
    group: Option<String>,

    #[getset(get = "pub", set = "pub")]
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    #[builder(default)]
    labels: BTreeMap<String, String>,
}

/// Identity of an object within one control plane: its group and full name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Getters)]
#[getset(get = "pub")]
pub struct Identity {
    group: Option<String>,
    full_name: String,
}

impl Identity {
    pub fn new<S: Into<String>>(group: Option<&str>, full_name: S) -> Self {
        Self {
            group: group.map(ToString::to_string),
            full_name: full_name.into(),
        }
    }
}

impl From<&str> for Identity {
    fn from(full_name: &str) -> Self {
        Self::new(None, full_name)
    }
}

impl From<String> for Identity {
    fn from(full_name: String) -> Self {
        Self::new(None, full_name)
    }
}

impl Display for Identity {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match &self.group {
            Some(group) => write!(f, "{group}/{}", self.full_name),
            None => f.write_str(&self.full_name),
        }
    }
}

pub trait ApisixResource:
    Clone + Debug + PartialEq + Serialize + DeserializeOwned + Send + Sync + 'static
{
    const KIND: ResourceKind;

    fn metadata(&self) -> &Metadata;

    fn metadata_mut(&mut self) -> &mut Metadata;

    fn full_name(&self) -> &str {
        self.metadata().full_name()
    }

    fn name(&self) -> &str {
        self.metadata().name()
    }

    fn group(&self) -> Option<&str> {
        self.metadata().group().as_deref()
    }

    fn identity(&self) -> Identity {
        Identity::new(self.group(), self.full_name())
    }

    fn id(&self) -> &RemoteId {
        self.metadata().id()
    }

    fn set_id(&mut self, id: RemoteId) {
        self.metadata_mut().set_id(id);
    }
}

macro_rules! apisix_resource {
    ($type:ty, $kind:expr) => {
        impl ApisixResource for $type {
            const KIND: ResourceKind = $kind;

            fn metadata(&self) -> &Metadata {
                &self.metadata
            }

            fn metadata_mut(&mut self) -> &mut Metadata {
                &mut self.metadata
            }
        }
    };
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, StrumDisplay)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum LoadBalancer {
    #[default]
    Roundrobin,
    Chash,
    Ewma,
    LeastConn,
}

#[derive(
    Debug,
    Clone,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    TypedBuilder,
    Getters,
    CopyGetters,
)]
pub struct Node {
    #[getset(get = "pub")]
    #[builder(setter(into))]
    host: String,

    #[getset(get_copy = "pub")]
    port: u16,

    #[getset(get_copy = "pub")]
    #[builder(default = 100)]
    weight: u32,
}

#[derive(
    Debug, Clone, PartialEq, Serialize, Deserialize, TypedBuilder, Getters, CopyGetters, Setters,
)]
pub struct Upstream {
    #[getset(get = "pub")]
    #[serde(flatten)]
    metadata: Metadata,

    #[getset(get_copy = "pub", set = "pub")]
    #[serde(rename = "type", default)]
    #[builder(default)]
    load_balancer: LoadBalancer,

    #[getset(get = "pub", set = "pub")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[builder(default, setter(strip_option, into))]
    hash_on: Option<String>,

    #[getset(get = "pub", set = "pub")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[builder(default, setter(strip_option, into))]
    key: Option<String>,

    #[getset(get = "pub", set = "pub")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[builder(default, setter(strip_option))]
    checks: Option<Value>,

    #[getset(get_copy = "pub", set = "pub")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[builder(default, setter(strip_option))]
    retries: Option<u32>,

    #[getset(get = "pub", set = "pub")]
    #[serde(default)]
    #[builder(default)]
    nodes: Vec<Node>,

    #[getset(get_copy = "pub", set = "pub")]
    #[serde(default)]
    #[builder(default)]
    source: SourceKind,
}

apisix_resource!(Upstream, ResourceKind::Upstream);

impl Upstream {
    /// Canonical name of the upstream generated for a Kubernetes Service port.
    pub fn compose_name(namespace: &str, service: &str, port: i32) -> String {
        format!("{namespace}_{service}_{port}")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TypedBuilder, Getters, CopyGetters, Setters)]
pub struct Service {
    #[getset(get = "pub")]
    #[serde(flatten)]
    metadata: Metadata,

    /// Full name of the upstream this service depends on.
    #[getset(get = "pub")]
    #[builder(setter(into))]
    upstream_name: String,

    #[getset(get = "pub", set = "pub")]
    #[serde(default, skip_serializing_if = "RemoteId::is_unassigned")]
    #[builder(default)]
    upstream_id: RemoteId,

    #[getset(get = "pub", set = "pub")]
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    #[builder(default)]
    plugins: Plugins,

    #[getset(get_copy = "pub", set = "pub")]
    #[serde(default)]
    #[builder(default)]
    source: SourceKind,
}

apisix_resource!(Service, ResourceKind::Service);

impl Service {
    /// The upstream this service depends on, in the service's own group.
    pub fn upstream_identity(&self) -> Identity {
        Identity::new(self.group(), self.upstream_name.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TypedBuilder, Getters, CopyGetters, Setters)]
pub struct Route {
    #[getset(get = "pub")]
    #[serde(flatten)]
    metadata: Metadata,

    /// Full name of the service this route depends on.
    #[getset(get = "pub")]
    #[builder(setter(into))]
    service_name: String,

    #[getset(get = "pub", set = "pub")]
    #[serde(default, skip_serializing_if = "RemoteId::is_unassigned")]
    #[builder(default)]
    service_id: RemoteId,

    #[getset(get = "pub", set = "pub")]
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    #[builder(default)]
    hosts: Vec<String>,

    #[getset(get = "pub", set = "pub")]
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    #[builder(default)]
    uris: Vec<String>,

    #[getset(get_copy = "pub", set = "pub")]
    #[serde(default)]
    #[builder(default)]
    priority: i32,

    #[getset(get = "pub", set = "pub")]
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    #[builder(default)]
    plugins: Plugins,
}

apisix_resource!(Route, ResourceKind::Route);

impl Route {
    /// The service this route depends on, in the route's own group.
    pub fn service_identity(&self) -> Identity {
        Identity::new(self.group(), self.service_name.as_str())
    }
}

#[derive(Clone, PartialEq, Serialize, Deserialize, TypedBuilder, Getters, Setters)]
pub struct Ssl {
    #[getset(get = "pub")]
    #[serde(flatten)]
    metadata: Metadata,

    #[getset(get = "pub", set = "pub")]
    #[builder(default)]
    snis: Vec<String>,

    #[getset(get = "pub", set = "pub")]
    #[builder(setter(into))]
    cert: String,

    #[getset(get = "pub", set = "pub")]
    #[builder(setter(into))]
    key: String,

    #[getset(get = "pub", set = "pub")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[builder(default, setter(strip_option, into))]
    client_ca: Option<String>,
}

apisix_resource!(Ssl, ResourceKind::Ssl);

impl Ssl {
    /// Full name of the certificate derived from the resource at `namespace/name`.
    pub fn compose_name(namespace: &str, name: &str) -> String {
        format!("{namespace}_{name}")
    }
}

impl Debug for Ssl {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ssl")
            .field("metadata", &self.metadata)
            .field("snis", &self.snis)
            .field("cert_len", &self.cert.len())
            .field("key", &"<redacted>")
            .finish_non_exhaustive()
    }
}
