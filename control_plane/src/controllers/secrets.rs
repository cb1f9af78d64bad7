use super::Reconciler;
use super::certificates::CertificateKey;
use crate::endpoints::ChangeKind;
use crate::errors::AggregateError;
use crate::kubernetes::Lister;
use crate::kubernetes::objects::ObjectKey;
use crate::kubernetes::tls::ApisixTls;
use crate::pipeline::Target;
use crate::secrets::{CertificateError, SecretIndex, deliver};
use apisix_ingress_core::workqueue::RetryQueue;
use async_trait::async_trait;
use dashmap::DashMap;
use k8s_openapi::api::core::v1::Secret;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Re-delivers the certificates fed by a Secret whenever it changes.
pub struct SecretController {
    index: Arc<SecretIndex>,
    owners: Arc<dyn Lister<ApisixTls>>,
    targets: Vec<Target>,
    pending: DashMap<ObjectKey, (ChangeKind, Secret)>,
    queue: RetryQueue<ObjectKey>,
    /// Owners waiting for a Secret are handed back to the certificate queue.
    certificates: RetryQueue<CertificateKey>,
}

impl SecretController {
    pub fn new(
        index: Arc<SecretIndex>,
        owners: Arc<dyn Lister<ApisixTls>>,
        targets: Vec<Target>,
        queue: RetryQueue<ObjectKey>,
        certificates: RetryQueue<CertificateKey>,
    ) -> Self {
        Self {
            index,
            owners,
            targets,
            pending: DashMap::new(),
            queue,
            certificates,
        }
    }

    pub fn queue(&self) -> &RetryQueue<ObjectKey> {
        &self.queue
    }

    pub fn enqueue(&self, kind: ChangeKind, secret: Secret) {
        let key = match ObjectKey::for_object(&secret) {
            Ok(key) => key,
            Err(err) => {
                warn!(%err, %kind, "Ignoring Secret change");
                return;
            }
        };

        if kind != ChangeKind::Delete {
            for owner in self.index.take_waiting(&key) {
                info!(secret = %key, %owner, "Secret arrived, reconciling certificate");
                self.certificates.add(CertificateKey::new(owner, None));
            }
        }

        self.pending.insert(key.clone(), (kind, secret));
        self.queue.add(key);
    }
}

#[async_trait]
impl Reconciler for SecretController {
    type Key = ObjectKey;
    type Error = CertificateError;

    async fn reconcile(&self, key: &ObjectKey) -> Result<(), CertificateError> {
        let Some((kind, secret)) = self.pending.remove(key).map(|(_, change)| change) else {
            debug!(secret = %key, "No pending change");
            return Ok(());
        };

        let updates = match self.index.on_secret(kind, &secret, self.owners.as_ref()) {
            Ok(updates) => updates,
            Err(err) => {
                self.pending.entry(key.clone()).or_insert((kind, secret));
                return Err(err);
            }
        };

        let mut errors = AggregateError::new();
        for update in &updates {
            if let Err(err) = deliver(&self.targets, update).await {
                errors.extend(err);
            }
        }

        if !errors.is_empty() {
            // The index already holds the refreshed material; replaying the
            // change delivers it again.
            self.pending.entry(key.clone()).or_insert((kind, secret));
        }
        errors.into_result(()).map_err(CertificateError::from)
    }

    fn is_retryable(error: &CertificateError) -> bool {
        error.is_retryable()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::apisix::Ssl;
    use crate::cluster::MemoryCluster;
    use crate::kubernetes::tls::{ApisixTlsSpec, SecretReference};
    use crate::mirror::MirrorStore;
    use crate::pipeline::Pipeline;
    use crate::secrets::{CERT_FIELD, KEY_FIELD, SecretRole, translate};
    use apisix_ingress_core::workqueue::BackoffPolicy;
    use assertables::assert_ok;
    use k8s_openapi::ByteString;
    use kube::api::ObjectMeta;

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

    fn owner() -> ApisixTls {
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
        tls
    }

    fn controller(cluster: Arc<MemoryCluster>, index: Arc<SecretIndex>) -> SecretController {
        let pipeline = Arc::new(Pipeline::new(cluster, Arc::new(MirrorStore::new()), 8));
        let owners = DashMap::new();
        owners.insert(ObjectKey::new("prod", "site"), Arc::new(owner()));
        SecretController::new(
            index,
            Arc::new(owners),
            vec![Target::builder().name("primary").pipeline(pipeline).build()],
            RetryQueue::new("secrets", BackoffPolicy::default()),
            RetryQueue::new("certificates", BackoffPolicy::default()),
        )
    }

    #[test_log::test(tokio::test)]
    async fn test_rotation_updates_the_remote_certificate() {
        let cluster = Arc::new(MemoryCluster::new("primary"));
        let index = Arc::new(SecretIndex::new());
        let ssl = assert_ok!(translate(&owner(), &secret("OLD"), None));
        index.register(
            ObjectKey::new("prod", "site-tls"),
            ssl.clone(),
            ObjectKey::new("prod", "site"),
            SecretRole::Certificate,
        );
        cluster.seed(ssl);
        let controller = controller(cluster.clone(), index);

        controller.enqueue(ChangeKind::Update, secret("NEW"));
        assert_ok!(controller.reconcile(&ObjectKey::new("prod", "site-tls")).await);

        let remote = cluster.object::<Ssl>("prod_site");
        assert_eq!(remote.map(|ssl| ssl.cert().clone()), Some("NEW".to_string()));
    }

    #[test_log::test(tokio::test)]
    async fn test_arrival_requeues_waiting_owners() {
        let cluster = Arc::new(MemoryCluster::new("primary"));
        let index = Arc::new(SecretIndex::new());
        index.wait_for(ObjectKey::new("prod", "site-tls"), ObjectKey::new("prod", "site"));
        let controller = controller(cluster, index);

        controller.enqueue(ChangeKind::Add, secret("CERT"));

        assert_eq!(controller.certificates.len(), 1);
        assert_eq!(controller.queue().len(), 1);
    }
}
