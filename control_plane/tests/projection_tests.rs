//! Endpoint projection and certificate delivery through the queue workers

mod common;

use apisix_ingress_control_plane::apisix::{LoadBalancer, Node, Ssl, Upstream};
use apisix_ingress_control_plane::cluster::{Cluster, MemoryCluster};
use apisix_ingress_control_plane::controllers::{
    CertificateController, CertificateKey, EndpointsController, SecretController, run_queue_worker,
};
use apisix_ingress_control_plane::endpoints::{
    ChangeKind, EndpointChange, EndpointProjector, SERVICE_NAME_LABEL,
};
use apisix_ingress_control_plane::kubernetes::objects::ObjectKey;
use apisix_ingress_control_plane::kubernetes::tls::{ApisixTls, ApisixTlsSpec, SecretReference};
use apisix_ingress_control_plane::secrets::{CERT_FIELD, KEY_FIELD, SecretIndex};
use apisix_ingress_control_plane::{Options, Target};
use apisix_ingress_core::workqueue::RetryQueue;
use common::*;
use dashmap::DashMap;
use k8s_openapi::ByteString;
use k8s_openapi::api::core::v1::{
    EndpointAddress, EndpointPort as EndpointsPort, EndpointSubset, Endpoints, Secret, Service,
    ServicePort, ServiceSpec,
};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use k8s_openapi::api::discovery::v1::{Endpoint, EndpointConditions, EndpointPort, EndpointSlice};
use kube::api::ObjectMeta;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use test_log::test;

fn slice(name: &str, addresses: &[&str], ready: bool) -> EndpointSlice {
    EndpointSlice {
        metadata: ObjectMeta {
            namespace: Some("prod".to_string()),
            name: Some(name.to_string()),
            labels: Some(BTreeMap::from([(
                SERVICE_NAME_LABEL.to_string(),
                "web".to_string(),
            )])),
            ..Default::default()
        },
        address_type: "IPv4".to_string(),
        endpoints: addresses
            .iter()
            .map(|address| Endpoint {
                addresses: vec![(*address).to_string()],
                conditions: Some(EndpointConditions {
                    ready: Some(ready),
                    ..Default::default()
                }),
                ..Default::default()
            })
            .collect(),
        ports: Some(vec![EndpointPort {
            port: Some(8080),
            ..Default::default()
        }]),
    }
}

fn services(cached: Vec<Service>) -> Arc<DashMap<ObjectKey, Arc<Service>>> {
    Arc::new(
        cached
            .into_iter()
            .map(|service| {
                let key = ObjectKey::new(
                    service.metadata.namespace.clone().unwrap_or_default(),
                    service.metadata.name.clone().unwrap_or_default(),
                );
                (key, Arc::new(service))
            })
            .collect(),
    )
}

fn target(cluster: &Arc<MemoryCluster>) -> Target {
    Target::builder()
        .name(cluster.name().to_string())
        .pipeline(Arc::new(pipeline(cluster)))
        .build()
}

async fn settle<K>(queue: &RetryQueue<K>)
where
    K: Clone + std::fmt::Debug + Eq + std::hash::Hash + Send + Sync + 'static,
{
    for _ in 0..100 {
        if queue.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    tokio::time::sleep(Duration::from_millis(50)).await;
}

#[test(tokio::test)]
async fn test_slices_of_a_service_are_combined() {
    let cluster = Arc::new(MemoryCluster::new("primary"));
    let name = Upstream::compose_name("prod", "web", 8080);
    cluster.seed(crd_upstream(&name, LoadBalancer::Chash, &["10.0.0.1"]));
    let projector = Arc::new(
        EndpointProjector::builder()
            .targets(vec![target(&cluster)])
            .services(services(Vec::new()))
            .build(),
    );
    let queue = RetryQueue::new("endpoints", Options::default().backoff_policy());
    let controller = Arc::new(EndpointsController::new(projector, queue.clone()));
    let worker = tokio::spawn(run_queue_worker(controller.clone(), queue.clone()));

    controller.enqueue(EndpointChange::slice(
        ChangeKind::Add,
        slice("web-a", &["10.1.0.1"], true),
    ));
    settle(&queue).await;
    controller.enqueue(EndpointChange::slice(
        ChangeKind::Add,
        slice("web-b", &["10.1.0.2", "10.1.0.3"], false),
    ));
    controller.enqueue(EndpointChange::slice(
        ChangeKind::Add,
        slice("web-c", &["10.1.0.4"], true),
    ));
    settle(&queue).await;
    queue.shut_down();
    let _ = worker.await;

    let remote = cluster.object::<Upstream>(&name);
    let remote = remote.as_ref();
    assert_eq!(remote.map(Upstream::load_balancer), Some(LoadBalancer::Chash));
    assert_eq!(
        remote.map(|upstream| upstream.nodes().clone()),
        Some(vec![node("10.1.0.1"), node("10.1.0.4")])
    );
}

#[test(tokio::test)]
async fn test_endpoints_reach_the_upstream_of_the_service_port() {
    let cluster = Arc::new(MemoryCluster::new("primary"));
    let name = Upstream::compose_name("prod", "web", 80);
    cluster.seed(upstream(&name, &["10.0.0.1"]));
    let web = Service {
        metadata: ObjectMeta {
            namespace: Some("prod".to_string()),
            name: Some("web".to_string()),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            ports: Some(vec![ServicePort {
                name: Some("http".to_string()),
                port: 80,
                target_port: Some(IntOrString::Int(8080)),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    };
    let projector = EndpointProjector::builder()
        .targets(vec![target(&cluster)])
        .services(services(vec![web]))
        .build();

    let endpoints = Endpoints {
        metadata: ObjectMeta {
            namespace: Some("prod".to_string()),
            name: Some("web".to_string()),
            ..Default::default()
        },
        subsets: Some(vec![EndpointSubset {
            addresses: Some(vec![EndpointAddress {
                ip: "10.9.9.9".to_string(),
                ..Default::default()
            }]),
            ports: Some(vec![EndpointsPort {
                name: Some("http".to_string()),
                port: 8080,
                ..Default::default()
            }]),
            ..Default::default()
        }]),
    };
    assert!(projector.apply(&EndpointChange::endpoints(ChangeKind::Update, endpoints)).await.is_ok());

    assert_eq!(
        cluster.object::<Upstream>(&name).map(|upstream| upstream.nodes().clone()),
        Some(vec![node("10.9.9.9")])
    );
}

#[test(tokio::test)]
async fn test_endpoints_without_an_upstream_are_ignored() {
    let cluster = Arc::new(MemoryCluster::new("primary"));
    let projector = EndpointProjector::builder()
        .targets(vec![target(&cluster)])
        .services(services(Vec::new()))
        .build();

    let change = EndpointChange::slice(ChangeKind::Add, slice("web-a", &["10.1.0.1"], true));
    let result = projector.apply(&change).await;

    assert!(result.is_ok());
    assert!(cluster.calls().is_empty());
}

#[test(tokio::test)]
async fn test_deleted_slice_empties_the_upstream() {
    let cluster = Arc::new(MemoryCluster::new("primary"));
    let name = Upstream::compose_name("prod", "web", 8080);
    cluster.seed(upstream(&name, &["10.0.0.1"]));
    let projector = EndpointProjector::builder()
        .targets(vec![target(&cluster)])
        .services(services(Vec::new()))
        .build();

    let added = slice("web-a", &["10.1.0.1"], true);
    assert!(projector.apply(&EndpointChange::slice(ChangeKind::Add, added.clone())).await.is_ok());
    assert!(projector.apply(&EndpointChange::slice(ChangeKind::Delete, added)).await.is_ok());

    assert_eq!(
        cluster.object::<Upstream>(&name).map(|upstream| upstream.nodes().clone()),
        Some(Vec::<Node>::new())
    );
}

fn secret(cert: &str) -> Secret {
    Secret {
        metadata: ObjectMeta {
            namespace: Some("prod".to_string()),
            name: Some("site-tls".to_string()),
            ..Default::default()
        },
        data: Some(
            [(CERT_FIELD, cert), (KEY_FIELD, "KEY")]
                .into_iter()
                .map(|(field, value)| (field.to_string(), ByteString(value.as_bytes().to_vec())))
                .collect(),
        ),
        ..Default::default()
    }
}

fn tls() -> ApisixTls {
    let mut tls = ApisixTls::new(
        "site",
        ApisixTlsSpec {
            hosts: vec!["example.com".to_string()],
            secret: SecretReference {
                name: "site-tls".to_string(),
                namespace: "prod".to_string(),
            },
            client: None,
        },
    );
    tls.metadata.namespace = Some("prod".to_string());
    tls.metadata.generation = Some(1);
    tls
}

#[test(tokio::test)]
async fn test_late_secret_and_rotation_reach_the_cluster() {
    let cluster = Arc::new(MemoryCluster::new("primary"));
    let owners: Arc<DashMap<ObjectKey, Arc<ApisixTls>>> = Arc::new(DashMap::new());
    let secrets: Arc<DashMap<ObjectKey, Arc<Secret>>> = Arc::new(DashMap::new());
    let index = Arc::new(SecretIndex::new());
    let policy = Options::default().backoff_policy();
    let certificate_queue = RetryQueue::new("certificates", policy);
    let secret_queue = RetryQueue::new("secrets", policy);

    let certificates = Arc::new(CertificateController::new(
        owners.clone(),
        secrets.clone(),
        index.clone(),
        vec![target(&cluster)],
        certificate_queue.clone(),
    ));
    let secret_controller = Arc::new(SecretController::new(
        index,
        owners.clone(),
        vec![target(&cluster)],
        secret_queue.clone(),
        certificate_queue.clone(),
    ));
    let workers = [
        tokio::spawn(run_queue_worker(certificates.clone(), certificate_queue.clone())),
        tokio::spawn(run_queue_worker(secret_controller.clone(), secret_queue.clone())),
    ];

    let owner = tls();
    owners.insert(ObjectKey::new("prod", "site"), Arc::new(owner.clone()));
    certificates.enqueue(ChangeKind::Add, &owner);
    settle(&certificate_queue).await;
    assert!(cluster.object::<Ssl>("prod_site").is_none());

    secrets.insert(ObjectKey::new("prod", "site-tls"), Arc::new(secret("V1")));
    secret_controller.enqueue(ChangeKind::Add, secret("V1"));
    settle(&secret_queue).await;
    settle(&certificate_queue).await;
    assert_eq!(
        cluster.object::<Ssl>("prod_site").map(|ssl| ssl.cert().clone()),
        Some("V1".to_string())
    );

    secrets.insert(ObjectKey::new("prod", "site-tls"), Arc::new(secret("V2")));
    secret_controller.enqueue(ChangeKind::Update, secret("V2"));
    settle(&secret_queue).await;
    assert_eq!(
        cluster.object::<Ssl>("prod_site").map(|ssl| ssl.cert().clone()),
        Some("V2".to_string())
    );

    owners.remove(&ObjectKey::new("prod", "site"));
    certificate_queue.add(CertificateKey::new(ObjectKey::new("prod", "site"), None));
    settle(&certificate_queue).await;
    assert!(cluster.object::<Ssl>("prod_site").is_none());

    certificate_queue.shut_down();
    secret_queue.shut_down();
    for worker in workers {
        let _ = worker.await;
    }
}
