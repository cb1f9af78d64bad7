use crate::apisix::{ApisixResource, Route, Service, Ssl, Upstream};
use crate::cluster::{Cluster, ClusterError, ResourceClient};
use async_trait::async_trait;
use getset::{CopyGetters, Getters};
use reqwest::{Client, Method, RequestBuilder, StatusCode};
use serde::Deserialize;
use serde_json::{Map, Value};
use std::fmt::{Debug, Formatter};
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument, warn};
use typed_builder::TypedBuilder;
use url::Url;

const API_KEY_HEADER: &str = "X-API-KEY";
const MAX_ID_LENGTH: usize = 64;
const HASH_SUFFIX_LENGTH: usize = 8;

/// Body fields that the admin API has no slot for and that travel as labels instead.
const LABELED_FIELDS: [(&str, &str); 4] = [
    ("group", "ingress.group"),
    ("source", "ingress.source"),
    ("upstream_name", "ingress.upstream"),
    ("service_name", "ingress.service"),
];

#[derive(Clone, TypedBuilder, Getters, CopyGetters)]
pub struct AdminApiConfig {
    #[getset(get = "pub")]
    base_url: Url,

    #[getset(get = "pub")]
    #[builder(setter(into))]
    admin_key: String,

    #[getset(get_copy = "pub")]
    #[builder(default = Duration::from_secs(10))]
    timeout: Duration,
}

impl Debug for AdminApiConfig {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdminApiConfig")
            .field("base_url", &self.base_url.as_str())
            .field("admin_key", &"<redacted>")
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// Identifier used for an object the admin API has not assigned one to yet.
///
/// Characters outside `[a-zA-Z0-9-_.]` become `-`. Names longer than the admin API
/// accepts are truncated and suffixed with a hash of the full name so that distinct
/// names keep distinct identifiers.
pub fn derive_id(full_name: &str) -> String {
    let sanitized: String = full_name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '-'
            }
        })
        .collect();

    if sanitized.len() <= MAX_ID_LENGTH {
        return sanitized;
    }

    let prefix = &sanitized[..MAX_ID_LENGTH - HASH_SUFFIX_LENGTH - 1];
    format!("{prefix}-{:08x}", fnv1a(full_name.as_bytes()))
}

fn fnv1a(bytes: &[u8]) -> u32 {
    bytes.iter().fold(0x811c_9dc5_u32, |hash, byte| {
        (hash ^ u32::from(*byte)).wrapping_mul(0x0100_0193)
    })
}

#[derive(Debug, Deserialize)]
struct Item {
    #[serde(default)]
    key: String,
    value: Value,
}

#[derive(Debug, Deserialize)]
struct Listing {
    #[serde(default)]
    list: Vec<Item>,
}

fn encode<T: ApisixResource>(object: &T) -> Result<Value, ClusterError> {
    let Value::Object(mut body) = serde_json::to_value(object)
        .map_err(|err| ClusterError::Validation(format!("unable to encode {}: {err}", T::KIND)))?
    else {
        return Err(ClusterError::Validation(format!(
            "{} did not encode to an object",
            T::KIND
        )));
    };

    body.remove("id");
    if let Some(name) = body.remove("name") {
        body.insert("desc".to_string(), name);
    }
    if let Some(full_name) = body.remove("full_name") {
        body.insert("name".to_string(), full_name);
    }
    if let Some(ca) = body.remove("client_ca") {
        body.insert("client".to_string(), serde_json::json!({ "ca": ca }));
    }

    let mut labels = match body.remove("labels") {
        Some(Value::Object(labels)) => labels,
        _ => Map::new(),
    };
    for (field, label) in LABELED_FIELDS {
        if let Some(value) = body.remove(field) {
            labels.insert(label.to_string(), value);
        }
    }
    if !labels.is_empty() {
        body.insert("labels".to_string(), Value::Object(labels));
    }

    Ok(Value::Object(body))
}

fn decode<T: ApisixResource>(item: Item) -> Result<T, ClusterError> {
    let Value::Object(mut body) = item.value else {
        return Err(ClusterError::Validation(format!(
            "{} {} is not an object",
            T::KIND,
            item.key
        )));
    };

    if !body.contains_key("id") {
        if let Some(id) = item.key.rsplit('/').next().filter(|id| !id.is_empty()) {
            body.insert("id".to_string(), Value::String(id.to_string()));
        }
    }

    let full_name = body.remove("name");
    let name = body.remove("desc").or_else(|| full_name.clone());
    if let Some(full_name) = full_name {
        body.insert("full_name".to_string(), full_name);
    }
    if let Some(name) = name {
        body.insert("name".to_string(), name);
    }
    if let Some(Value::Object(mut client)) = body.remove("client") {
        if let Some(ca) = client.remove("ca") {
            body.insert("client_ca".to_string(), ca);
        }
    }

    if let Some(Value::Object(mut labels)) = body.remove("labels") {
        for (field, label) in LABELED_FIELDS {
            if let Some(value) = labels.remove(label) {
                body.insert(field.to_string(), value);
            }
        }
        if !labels.is_empty() {
            body.insert("labels".to_string(), Value::Object(labels));
        }
    }

    serde_json::from_value(Value::Object(body))
        .map_err(|err| ClusterError::Validation(format!("unable to decode {}: {err}", T::KIND)))
}

struct AdminApiClient<T> {
    http: Client,
    config: Arc<AdminApiConfig>,
    _kind: PhantomData<fn() -> T>,
}

impl<T: ApisixResource> AdminApiClient<T> {
    fn new(http: Client, config: Arc<AdminApiConfig>) -> Self {
        Self {
            http,
            config,
            _kind: PhantomData,
        }
    }

    fn url(&self, id: Option<&str>) -> Result<Url, ClusterError> {
        let mut url = self.config.base_url.clone();
        {
            let mut segments = url.path_segments_mut().map_err(|()| {
                ClusterError::Validation(format!(
                    "admin API URL {} cannot be a base",
                    self.config.base_url
                ))
            })?;
            segments
                .pop_if_empty()
                .extend(["apisix", "admin", T::KIND.collection()]);
            if let Some(id) = id {
                segments.push(id);
            }
        }
        Ok(url)
    }

    fn request(&self, method: Method, id: Option<&str>) -> Result<RequestBuilder, ClusterError> {
        Ok(self
            .http
            .request(method, self.url(id)?)
            .header(API_KEY_HEADER, self.config.admin_key.as_str()))
    }

    async fn send(&self, request: RequestBuilder, name: &str) -> Result<Value, ClusterError> {
        let response = request
            .send()
            .await
            .map_err(|err| ClusterError::Transient(err.to_string()))?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Err(ClusterError::not_found(T::KIND, name));
        }

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            debug!(kind = %T::KIND, name, %status, %body, "Admin API request failed");
            return Err(if status.is_client_error() {
                ClusterError::Validation(format!("{status}: {body}"))
            } else {
                ClusterError::Transient(format!("{status}: {body}"))
            });
        }

        response
            .json()
            .await
            .map_err(|err| ClusterError::Transient(err.to_string()))
    }

    async fn put(&self, id: &str, object: &T) -> Result<T, ClusterError> {
        let body = encode(object)?;
        let value = self
            .send(
                self.request(Method::PUT, Some(id))?.json(&body),
                object.full_name(),
            )
            .await?;
        let item = Item::deserialize(value)
            .map_err(|err| ClusterError::Validation(format!("unexpected response: {err}")))?;
        decode(item)
    }
}

#[async_trait]
impl<T: ApisixResource> ResourceClient<T> for AdminApiClient<T> {
    #[instrument(skip(self), fields(kind = %T::KIND))]
    async fn get(&self, full_name: &str) -> Result<T, ClusterError> {
        let id = derive_id(full_name);
        let value = self
            .send(self.request(Method::GET, Some(&id))?, full_name)
            .await?;
        let item = Item::deserialize(value)
            .map_err(|err| ClusterError::Validation(format!("unexpected response: {err}")))?;
        decode(item)
    }

    #[instrument(skip(self), fields(kind = %T::KIND))]
    async fn list(&self) -> Result<Vec<T>, ClusterError> {
        let value = self
            .send(self.request(Method::GET, None)?, T::KIND.collection())
            .await?;
        let listing = Listing::deserialize(value)
            .map_err(|err| ClusterError::Validation(format!("unexpected response: {err}")))?;

        Ok(listing
            .list
            .into_iter()
            .filter_map(|item| {
                let key = item.key.clone();
                decode(item)
                    .inspect_err(|err| warn!(kind = %T::KIND, %key, %err, "Skipping object"))
                    .ok()
            })
            .collect())
    }

    async fn create(&self, object: &T) -> Result<T, ClusterError> {
        let id = derive_id(object.full_name());
        self.put(&id, object).await
    }

    async fn update(&self, object: &T) -> Result<T, ClusterError> {
        let id = object
            .id()
            .as_assigned()
            .ok_or_else(|| ClusterError::not_found(T::KIND, object.full_name()))?;
        self.put(id, object).await
    }

    async fn delete(&self, object: &T) -> Result<(), ClusterError> {
        let id = object
            .id()
            .as_assigned()
            .map_or_else(|| derive_id(object.full_name()), ToString::to_string);
        self.send(self.request(Method::DELETE, Some(&id))?, object.full_name())
            .await
            .map(|_| ())
    }
}

/// [`Cluster`] backed by the APISIX admin API.
pub struct AdminApiCluster {
    name: String,
    routes: AdminApiClient<Route>,
    services: AdminApiClient<Service>,
    upstreams: AdminApiClient<Upstream>,
    ssls: AdminApiClient<Ssl>,
}

impl AdminApiCluster {
    pub fn new<S: Into<String>>(name: S, config: AdminApiConfig) -> Result<Self, ClusterError> {
        let http = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|err| ClusterError::Validation(format!("invalid HTTP client: {err}")))?;
        let config = Arc::new(config);

        Ok(Self {
            name: name.into(),
            routes: AdminApiClient::new(http.clone(), config.clone()),
            services: AdminApiClient::new(http.clone(), config.clone()),
            upstreams: AdminApiClient::new(http.clone(), config.clone()),
            ssls: AdminApiClient::new(http, config),
        })
    }
}

impl Cluster for AdminApiCluster {
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::apisix::{LoadBalancer, Metadata, Node, RemoteId, SourceKind};
    use assertables::assert_ok;
    use rstest::rstest;
    use serde_json::json;

    #[rstest]
    #[case("default_httpbin_80", "default_httpbin_80")]
    #[case("default/httpbin:80", "default-httpbin-80")]
    #[case("a.b-c_d", "a.b-c_d")]
    fn test_derive_id(#[case] full_name: &str, #[case] expected: &str) {
        assert_eq!(derive_id(full_name), expected);
    }

    #[test]
    fn test_derive_id_truncates_long_names() {
        let first = derive_id(&"a".repeat(100));
        let second = derive_id(&format!("{}b", "a".repeat(99)));

        assert_eq!(first.len(), MAX_ID_LENGTH);
        assert_ne!(first, second);
    }

    #[test]
    fn test_encode_moves_bookkeeping_into_labels() {
        let upstream = Upstream::builder()
            .metadata(
                Metadata::builder()
                    .id(RemoteId::assigned("1"))
                    .full_name("default_httpbin_80")
                    .name("httpbin")
                    .group("apisix")
                    .build(),
            )
            .load_balancer(LoadBalancer::Chash)
            .nodes(vec![Node::builder().host("10.0.0.1").port(80).build()])
            .source(SourceKind::Crd)
            .build();

        let body = assert_ok!(encode(&upstream));

        assert_eq!(
            body,
            json!({
                "name": "default_httpbin_80",
                "desc": "httpbin",
                "type": "chash",
                "nodes": [{"host": "10.0.0.1", "port": 80, "weight": 100}],
                "labels": {"ingress.group": "apisix", "ingress.source": "crd"}
            })
        );
    }

    #[test]
    fn test_decode_restores_encoded_object() {
        let service = Service::builder()
            .metadata(
                Metadata::builder()
                    .id(RemoteId::assigned("default_httpbin"))
                    .full_name("default_httpbin")
                    .name("httpbin")
                    .build(),
            )
            .upstream_name("default_httpbin_80")
            .upstream_id(RemoteId::assigned("default_httpbin_80"))
            .build();

        let body = assert_ok!(encode(&service));
        let item = Item {
            key: "/apisix/services/default_httpbin".to_string(),
            value: body,
        };

        assert_eq!(assert_ok!(decode::<Service>(item)), service);
    }

    #[test]
    fn test_url_includes_collection_and_id() {
        let config = AdminApiConfig::builder()
            .base_url(assert_ok!(Url::parse("http://apisix-admin:9180/")))
            .admin_key("key")
            .build();
        let client = AdminApiClient::<Route>::new(Client::new(), Arc::new(config));

        let url = assert_ok!(client.url(Some("r1")));

        assert_eq!(url.as_str(), "http://apisix-admin:9180/apisix/admin/routes/r1");
    }
}
