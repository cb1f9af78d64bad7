use super::{GenerationTracker, Reconciler};
use crate::apisix::{Metadata, Ssl};
use crate::endpoints::ChangeKind;
use crate::errors::AggregateError;
use crate::kubernetes::Lister;
use crate::kubernetes::objects::ObjectKey;
use crate::kubernetes::tls::ApisixTls;
use crate::pipeline::Target;
use crate::secrets::{
    CertificateError, CertificateOperation, CertificateUpdate, SecretIndex, SecretRole, deliver,
    reference_key, translate,
};
use apisix_ingress_core::workqueue::RetryQueue;
use async_trait::async_trait;
use getset::{CopyGetters, Getters};
use k8s_openapi::api::core::v1::Secret;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// An ApisixTls to reconcile, with the generation observed when it was queued.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Getters, CopyGetters)]
pub struct CertificateKey {
    #[getset(get = "pub")]
    owner: ObjectKey,

    #[getset(get_copy = "pub")]
    generation: Option<i64>,
}

impl CertificateKey {
    pub fn new(owner: ObjectKey, generation: Option<i64>) -> Self {
        Self { owner, generation }
    }
}

/// Translates ApisixTls objects into certificates and keeps the Secret index
/// pointing at the Secrets they reference.
pub struct CertificateController {
    certificates: Arc<dyn Lister<ApisixTls>>,
    secrets: Arc<dyn Lister<Secret>>,
    index: Arc<SecretIndex>,
    targets: Vec<Target>,
    generations: GenerationTracker<ObjectKey>,
    queue: RetryQueue<CertificateKey>,
}

impl CertificateController {
    pub fn new(
        certificates: Arc<dyn Lister<ApisixTls>>,
        secrets: Arc<dyn Lister<Secret>>,
        index: Arc<SecretIndex>,
        targets: Vec<Target>,
        queue: RetryQueue<CertificateKey>,
    ) -> Self {
        Self {
            certificates,
            secrets,
            index,
            targets,
            generations: GenerationTracker::new(),
            queue,
        }
    }

    pub fn queue(&self) -> &RetryQueue<CertificateKey> {
        &self.queue
    }

    pub fn enqueue(&self, kind: ChangeKind, tls: &ApisixTls) {
        let owner = match ObjectKey::for_object(tls) {
            Ok(owner) => owner,
            Err(err) => {
                warn!(%err, %kind, "Ignoring ApisixTls change");
                return;
            }
        };
        let generation = match kind {
            ChangeKind::Delete => None,
            ChangeKind::Add | ChangeKind::Update => tls.metadata.generation,
        };
        self.queue.add(CertificateKey::new(owner, generation));
    }

    async fn upsert(&self, owner: &ObjectKey, tls: &ApisixTls) -> Result<(), CertificateError> {
        let secret_key = reference_key(tls, &tls.spec.secret);
        let Some(secret) = self.secrets.get(&secret_key) else {
            info!(%owner, secret = %secret_key, "Secret not found, waiting for it");
            self.index.wait_for(secret_key, owner.clone());
            return Ok(());
        };

        let ca = match &tls.spec.client {
            Some(client) => {
                let ca_key = reference_key(tls, &client.ca_secret);
                let Some(ca) = self.secrets.get(&ca_key) else {
                    info!(%owner, secret = %ca_key, "CA Secret not found, waiting for it");
                    self.index.wait_for(ca_key, owner.clone());
                    return Ok(());
                };
                Some((ca_key, ca))
            }
            None => None,
        };

        let ssl = translate(tls, &secret, ca.as_ref().map(|(_, ca)| &**ca))?;

        // References may have moved to other Secrets since the last generation.
        self.index.unregister_owner(owner);
        self.index
            .register(secret_key, ssl.clone(), owner.clone(), SecretRole::Certificate);
        if let Some((ca_key, _)) = ca {
            self.index
                .register(ca_key, ssl.clone(), owner.clone(), SecretRole::ClientCa);
        }

        let update = CertificateUpdate::new(
            ssl,
            owner.clone(),
            CertificateOperation::Upsert,
            tls.metadata.generation,
        );
        deliver(&self.targets, &update).await?;
        Ok(())
    }

    async fn delete(&self, owner: &ObjectKey) -> Result<(), CertificateError> {
        let mut removed = self.index.unregister_owner(owner);
        if removed.is_empty() {
            // Nothing indexed, e.g. after a restart; remove by name.
            let full_name = Ssl::compose_name(owner.namespace_or_default(), owner.name());
            removed.push(
                Ssl::builder()
                    .metadata(
                        Metadata::builder()
                            .full_name(full_name)
                            .name(owner.name().clone())
                            .build(),
                    )
                    .cert(String::new())
                    .key(String::new())
                    .build(),
            );
        }

        let mut errors = AggregateError::new();
        for ssl in removed {
            let update = CertificateUpdate::new(ssl, owner.clone(), CertificateOperation::Delete, None);
            if let Err(err) = deliver(&self.targets, &update).await {
                errors.extend(err);
            }
        }
        errors.into_result(())?;
        Ok(())
    }
}

#[async_trait]
impl Reconciler for CertificateController {
    type Key = CertificateKey;
    type Error = CertificateError;

    #[instrument(skip_all, fields(owner = %key.owner, generation = ?key.generation))]
    async fn reconcile(&self, key: &CertificateKey) -> Result<(), CertificateError> {
        if self.generations.is_stale(&key.owner, key.generation) {
            return Ok(());
        }

        match self.certificates.get(&key.owner) {
            Some(tls) => {
                self.upsert(&key.owner, &tls).await?;
                self.generations
                    .record(key.owner.clone(), tls.metadata.generation);
            }
            None => {
                debug!("ApisixTls gone, removing its certificates");
                self.delete(&key.owner).await?;
                self.generations.forget(&key.owner);
            }
        }
        Ok(())
    }

    fn is_retryable(error: &CertificateError) -> bool {
        error.is_retryable()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::{Call, MemoryCluster, Operation};
    use crate::kubernetes::tls::{ApisixTlsSpec, SecretReference};
    use crate::mirror::MirrorStore;
    use crate::pipeline::Pipeline;
    use crate::secrets::{CERT_FIELD, KEY_FIELD};
    use apisix_ingress_core::workqueue::BackoffPolicy;
    use assertables::assert_ok;
    use dashmap::DashMap;
    use k8s_openapi::ByteString;
    use kube::api::ObjectMeta;

    struct Fixture {
        cluster: Arc<MemoryCluster>,
        owners: Arc<DashMap<ObjectKey, Arc<ApisixTls>>>,
        secrets: Arc<DashMap<ObjectKey, Arc<Secret>>>,
        index: Arc<SecretIndex>,
        controller: CertificateController,
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

    fn owner(generation: i64, hosts: &[&str]) -> ApisixTls {
        let mut tls = ApisixTls::new(
            "site",
            ApisixTlsSpec {
                hosts: hosts.iter().map(ToString::to_string).collect(),
                secret: SecretReference {
                    name: "site-tls".to_string(),
                    namespace: String::new(),
                },
                client: None,
            },
        );
        tls.metadata.namespace = Some("prod".to_string());
        tls.metadata.generation = Some(generation);
        tls
    }

    fn fixture() -> Fixture {
        let cluster = Arc::new(MemoryCluster::new("primary"));
        let owners: Arc<DashMap<ObjectKey, Arc<ApisixTls>>> = Arc::new(DashMap::new());
        let secrets: Arc<DashMap<ObjectKey, Arc<Secret>>> = Arc::new(DashMap::new());
        let index = Arc::new(SecretIndex::new());
        let pipeline = Arc::new(Pipeline::new(cluster.clone(), Arc::new(MirrorStore::new()), 8));
        let controller = CertificateController::new(
            owners.clone(),
            secrets.clone(),
            index.clone(),
            vec![Target::builder().name("primary").pipeline(pipeline).build()],
            RetryQueue::new("certificates", BackoffPolicy::default()),
        );
        Fixture {
            cluster,
            owners,
            secrets,
            index,
            controller,
        }
    }

    fn site() -> ObjectKey {
        ObjectKey::new("prod", "site")
    }

    #[test_log::test(tokio::test)]
    async fn test_certificate_is_created_and_indexed() {
        let fixture = fixture();
        fixture.owners.insert(site(), Arc::new(owner(1, &["example.com"])));
        fixture
            .secrets
            .insert(ObjectKey::new("prod", "site-tls"), Arc::new(secret("CERT")));

        assert_ok!(fixture.controller.reconcile(&CertificateKey::new(site(), Some(1))).await);

        let ssl = fixture.cluster.object::<Ssl>("prod_site");
        assert_eq!(ssl.map(|ssl| ssl.snis().clone()), Some(vec!["example.com".to_string()]));
        assert_eq!(fixture.index.certificates(&ObjectKey::new("prod", "site-tls")).len(), 1);
    }

    #[test_log::test(tokio::test)]
    async fn test_stale_generation_is_dropped() {
        let fixture = fixture();
        fixture.owners.insert(site(), Arc::new(owner(2, &["new.example.com"])));
        fixture
            .secrets
            .insert(ObjectKey::new("prod", "site-tls"), Arc::new(secret("CERT")));

        assert_ok!(fixture.controller.reconcile(&CertificateKey::new(site(), Some(2))).await);
        fixture.cluster.clear_calls();
        assert_ok!(fixture.controller.reconcile(&CertificateKey::new(site(), Some(1))).await);

        assert!(fixture.cluster.calls().is_empty());
    }

    #[test_log::test(tokio::test)]
    async fn test_missing_secret_waits() {
        let fixture = fixture();
        fixture.owners.insert(site(), Arc::new(owner(1, &["example.com"])));

        assert_ok!(fixture.controller.reconcile(&CertificateKey::new(site(), Some(1))).await);

        assert!(fixture.cluster.calls().is_empty());
        assert_eq!(
            fixture.index.take_waiting(&ObjectKey::new("prod", "site-tls")),
            vec![site()]
        );
    }

    #[test_log::test(tokio::test)]
    async fn test_deleted_owner_removes_certificate() {
        let fixture = fixture();
        fixture.owners.insert(site(), Arc::new(owner(1, &["example.com"])));
        fixture
            .secrets
            .insert(ObjectKey::new("prod", "site-tls"), Arc::new(secret("CERT")));
        assert_ok!(fixture.controller.reconcile(&CertificateKey::new(site(), Some(1))).await);

        fixture.owners.remove(&site());
        assert_ok!(fixture.controller.reconcile(&CertificateKey::new(site(), None)).await);

        assert_eq!(fixture.cluster.object::<Ssl>("prod_site"), None);
        assert!(fixture.index.is_empty());
        let deletes = fixture
            .cluster
            .calls_for("prod_site")
            .into_iter()
            .filter(|call: &Call| call.operation() == Operation::Delete)
            .count();
        assert_eq!(deletes, 1);
    }
}
