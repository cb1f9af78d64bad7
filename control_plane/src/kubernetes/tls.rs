use kube::CustomResource;
use serde::{Deserialize, Serialize};

/// Certificate served by APISIX for a set of hosts, backed by a TLS Secret.
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, PartialEq)]
#[kube(
    group = "apisix.apache.org",
    version = "v2",
    kind = "ApisixTls",
    plural = "apisixtlses",
    namespaced,
    schema = "disabled"
)]
#[serde(rename_all = "camelCase")]
pub struct ApisixTlsSpec {
    pub hosts: Vec<String>,

    pub secret: SecretReference,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client: Option<ClientTls>,
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SecretReference {
    pub name: String,

    pub namespace: String,
}

/// Mutual TLS settings; the referenced Secret carries the CA in `ca.crt`.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ClientTls {
    pub ca_secret: SecretReference,
}
