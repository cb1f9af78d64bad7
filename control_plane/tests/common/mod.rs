//! Fixtures shared by the integration tests

#![allow(dead_code)]

use apisix_ingress_control_plane::apisix::{
    LoadBalancer, Manifest, Metadata, Node, Route, Service, SourceKind, Upstream,
};
use apisix_ingress_control_plane::cluster::{Call, MemoryCluster, Operation};
use apisix_ingress_control_plane::{MirrorStore, Pipeline};
use std::sync::Arc;

pub fn metadata(full_name: &str) -> Metadata {
    Metadata::builder().full_name(full_name).name(full_name).build()
}

pub fn node(host: &str) -> Node {
    Node::builder().host(host).port(8080).build()
}

pub fn upstream(full_name: &str, hosts: &[&str]) -> Upstream {
    Upstream::builder()
        .metadata(metadata(full_name))
        .nodes(hosts.iter().map(|host| node(host)).collect())
        .build()
}

pub fn crd_upstream(full_name: &str, load_balancer: LoadBalancer, hosts: &[&str]) -> Upstream {
    Upstream::builder()
        .metadata(metadata(full_name))
        .load_balancer(load_balancer)
        .hash_on("header")
        .key("x-user")
        .nodes(hosts.iter().map(|host| node(host)).collect())
        .source(SourceKind::Crd)
        .build()
}

pub fn service(full_name: &str, upstream: &str) -> Service {
    Service::builder()
        .metadata(metadata(full_name))
        .upstream_name(upstream)
        .build()
}

pub fn route(full_name: &str, service: &str, uri: &str) -> Route {
    Route::builder()
        .metadata(metadata(full_name))
        .service_name(service)
        .uris(vec![uri.to_string()])
        .build()
}

/// Upstream `u`, service `s` on it and route `r` on the service.
pub fn chain() -> Manifest {
    Manifest::builder()
        .upstreams(vec![upstream("u", &["10.0.0.1"])])
        .services(vec![service("s", "u")])
        .routes(vec![route("r", "s", "/")])
        .build()
}

pub fn pipeline(cluster: &Arc<MemoryCluster>) -> Pipeline {
    Pipeline::new(cluster.clone(), Arc::new(MirrorStore::new()), 8)
}

/// `(operation, name)` of every successful call, in order.
pub fn trace(cluster: &MemoryCluster) -> Vec<(Operation, String)> {
    cluster
        .calls()
        .into_iter()
        .filter(Call::succeeded)
        .map(|call| (call.operation(), call.name().clone()))
        .collect()
}

pub fn position(trace: &[(Operation, String)], name: &str) -> Option<usize> {
    trace.iter().position(|(_, called)| called == name)
}
