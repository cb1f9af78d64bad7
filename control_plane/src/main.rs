use anyhow::Context;
use apisix_ingress_control_plane::cli::Cli;
use apisix_ingress_control_plane::cluster::{
    AdminApiCluster, AdminApiConfig, Cluster, MemoryCluster,
};
use apisix_ingress_control_plane::controllers::{
    CertificateController, EndpointsController, Reconciler, SecretController, run_queue_worker,
};
use apisix_ingress_control_plane::endpoints::{ChangeKind, EndpointChange, EndpointProjector};
use apisix_ingress_control_plane::kubernetes::tls::ApisixTls;
use apisix_ingress_control_plane::kubernetes::{spawn_resync, spawn_watch};
use apisix_ingress_control_plane::secrets::SecretIndex;
use apisix_ingress_control_plane::{MirrorStore, Options, Pipeline, Target};
use apisix_ingress_core::crypto::init_crypto;
use apisix_ingress_core::instrumentation::init_instrumentation;
use apisix_ingress_core::task::Builder as TaskBuilder;
use apisix_ingress_core::workqueue::RetryQueue;
use clap::Parser;
use k8s_openapi::api::core::v1::{Endpoints, Secret, Service};
use k8s_openapi::api::discovery::v1::EndpointSlice;
use kube::runtime::reflector;
use kube::{Api, Client};
use std::sync::Arc;
use thiserror::Error;
use tracing::{error, info};

#[derive(Debug, Error)]
pub enum MainError {
    #[error("Failed to build targets: {0:#}")]
    Targets(#[from] anyhow::Error),
    #[error("Failed to create Kubernetes client: {0}")]
    Kubernetes(#[from] kube::Error),
}

fn build_targets(args: &Cli, options: &Options) -> anyhow::Result<Vec<Target>> {
    args.admin_targets()
        .iter()
        .map(|admin| {
            let cluster: Arc<dyn Cluster> = if args.dry_run() {
                info!(cluster = %admin.name(), "Dry run, writing to memory");
                Arc::new(MemoryCluster::new(admin.name().clone()))
            } else {
                let config = AdminApiConfig::builder()
                    .base_url(admin.url().clone())
                    .admin_key(args.admin_key().clone())
                    .timeout(args.admin_timeout())
                    .build();
                let cluster = AdminApiCluster::new(admin.name().clone(), config)
                    .with_context(|| format!("admin API target {}", admin.name()))?;
                Arc::new(cluster)
            };
            let pipeline = Pipeline::new(
                cluster,
                Arc::new(MirrorStore::new()),
                options.queue_capacity(),
            );
            Ok(Target::builder()
                .name(admin.name().clone())
                .pipeline(Arc::new(pipeline))
                .build())
        })
        .collect()
}

fn spawn_workers<R: Reconciler>(
    task_builder: &TaskBuilder,
    name: &'static str,
    options: &Options,
    reconciler: Arc<R>,
    queue: &RetryQueue<R::Key>,
) {
    for _ in 0..options.workers_per_controller().max(1) {
        task_builder
            .new_task(name)
            .spawn(run_queue_worker(reconciler.clone(), queue.clone()));
    }

    let queue = queue.clone();
    task_builder
        .new_task(name)
        .spawn_on_shutdown(async move { queue.shut_down() });
}

fn spawn_controllers(
    task_builder: &TaskBuilder,
    client: Client,
    targets: Vec<Target>,
    options: &Options,
) {
    let resync = options.resync_period();

    let (tls_reader, tls_writer) = reflector::store::<ApisixTls>();
    let (secret_reader, secret_writer) = reflector::store::<Secret>();
    let (endpoints_reader, endpoints_writer) = reflector::store::<Endpoints>();
    let (slice_reader, slice_writer) = reflector::store::<EndpointSlice>();
    let (service_reader, service_writer) = reflector::store::<Service>();

    let index = Arc::new(SecretIndex::new());
    let certificate_queue = RetryQueue::new("certificates", options.backoff_policy());
    let certificates = Arc::new(CertificateController::new(
        Arc::new(tls_reader.clone()),
        Arc::new(secret_reader.clone()),
        index.clone(),
        targets.clone(),
        certificate_queue.clone(),
    ));
    let secrets = Arc::new(SecretController::new(
        index,
        Arc::new(tls_reader.clone()),
        targets.clone(),
        RetryQueue::new("secrets", options.backoff_policy()),
        certificate_queue,
    ));
    let projector = EndpointProjector::builder()
        .targets(targets)
        .default_weight(options.default_weight())
        .services(Arc::new(service_reader))
        .build();
    let endpoints = Arc::new(EndpointsController::new(
        Arc::new(projector),
        RetryQueue::new("endpoints", options.backoff_policy()),
    ));

    let on_tls = {
        let certificates = certificates.clone();
        move |kind, tls: ApisixTls| certificates.enqueue(kind, &tls)
    };
    spawn_watch(
        task_builder.new_task("apisix_tls_watch"),
        Api::all(client.clone()),
        tls_writer,
        on_tls.clone(),
    );
    spawn_resync(task_builder.new_task("apisix_tls_resync"), tls_reader, resync, on_tls);

    let on_secret = {
        let secrets = secrets.clone();
        move |kind, secret| secrets.enqueue(kind, secret)
    };
    spawn_watch(
        task_builder.new_task("secret_watch"),
        Api::all(client.clone()),
        secret_writer,
        on_secret.clone(),
    );
    spawn_resync(task_builder.new_task("secret_resync"), secret_reader, resync, on_secret);

    spawn_watch(
        task_builder.new_task("service_watch"),
        Api::all(client.clone()),
        service_writer,
        |_, _| {},
    );

    let on_endpoints = {
        let endpoints = endpoints.clone();
        move |kind: ChangeKind, object| endpoints.enqueue(EndpointChange::endpoints(kind, object))
    };
    spawn_watch(
        task_builder.new_task("endpoints_watch"),
        Api::all(client.clone()),
        endpoints_writer,
        on_endpoints.clone(),
    );
    spawn_resync(task_builder.new_task("endpoints_resync"), endpoints_reader, resync, on_endpoints);

    let on_slice = {
        let endpoints = endpoints.clone();
        move |kind: ChangeKind, object| endpoints.enqueue(EndpointChange::slice(kind, object))
    };
    spawn_watch(
        task_builder.new_task("endpoint_slice_watch"),
        Api::all(client),
        slice_writer,
        on_slice.clone(),
    );
    spawn_resync(task_builder.new_task("endpoint_slice_resync"), slice_reader, resync, on_slice);

    let certificate_queue = certificates.queue().clone();
    spawn_workers(task_builder, "certificates_worker", options, certificates, &certificate_queue);
    let secret_queue = secrets.queue().clone();
    spawn_workers(task_builder, "secrets_worker", options, secrets, &secret_queue);
    let endpoints_queue = endpoints.queue().clone();
    spawn_workers(task_builder, "endpoints_worker", options, endpoints, &endpoints_queue);
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<(), MainError> {
    let args = Cli::parse();
    let options = args.options();

    init_crypto();
    init_instrumentation(args.log_format().into());

    let task_builder = TaskBuilder::default();

    let targets = build_targets(&args, &options)
        .inspect_err(|err| error!("Failed to build targets: {:#}", err))?;
    let client = Client::try_default()
        .await
        .inspect_err(|err| error!("Failed to create Kubernetes client: {}", err))?;

    spawn_controllers(&task_builder, client, targets, &options);

    {
        let shutdown = task_builder.shutdown_token();
        task_builder.new_task("signal").spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => info!("Interrupted, shutting down"),
                Err(err) => {
                    error!("Unable to listen for interrupts: {}", err);
                    return;
                }
            }
            shutdown.cancel();
        });
    }

    task_builder.join_all().await;

    Ok(())
}
