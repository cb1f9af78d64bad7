//! Secret-to-certificate index: which certificates a Secret feeds, so that
//! rotating the Secret re-syncs them.

use crate::apisix::{ApisixResource, Manifest, Metadata, Ssl};
use crate::endpoints::ChangeKind;
use crate::errors::AggregateError;
use crate::kubernetes::Lister;
use crate::kubernetes::objects::{ObjectKey, ObjectKeyError};
use crate::kubernetes::tls::{ApisixTls, SecretReference};
use crate::pipeline::Target;
use dashmap::DashMap;
use getset::{CopyGetters, Getters};
use k8s_openapi::api::core::v1::Secret;
use kube::ResourceExt;
use std::collections::BTreeSet;
use strum::Display;
use thiserror::Error;
use tracing::{debug, instrument, warn};

pub const CERT_FIELD: &str = "tls.crt";
pub const KEY_FIELD: &str = "tls.key";
pub const CA_FIELD: &str = "ca.crt";

#[derive(Debug, Error)]
pub enum CertificateError {
    #[error(transparent)]
    Key(#[from] ObjectKeyError),
    #[error("Secret {secret} has no {field}")]
    MissingField { secret: ObjectKey, field: &'static str },
    #[error("{field} of Secret {secret} is not valid UTF-8")]
    InvalidField { secret: ObjectKey, field: &'static str },
    #[error(transparent)]
    Sync(#[from] AggregateError),
}

impl CertificateError {
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Key(_) | Self::MissingField { .. } | Self::InvalidField { .. } => false,
            Self::Sync(errors) => errors.is_retryable(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "lowercase")]
pub enum CertificateOperation {
    Upsert,
    Delete,
}

#[derive(Debug, Clone, PartialEq, Getters, CopyGetters)]
pub struct CertificateUpdate {
    #[getset(get = "pub")]
    ssl: Ssl,

    #[getset(get = "pub")]
    owner: ObjectKey,

    #[getset(get_copy = "pub")]
    operation: CertificateOperation,

    /// Observed generation of the owner, when the update came from the owner itself.
    #[getset(get_copy = "pub")]
    generation: Option<i64>,
}

impl CertificateUpdate {
    pub fn new(
        ssl: Ssl,
        owner: ObjectKey,
        operation: CertificateOperation,
        generation: Option<i64>,
    ) -> Self {
        Self {
            ssl,
            owner,
            operation,
            generation,
        }
    }
}

/// Whether the Secret holds the certificate itself or only the client CA.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SecretRole {
    Certificate,
    ClientCa,
}

#[derive(Debug, Clone)]
struct IndexEntry {
    ssl: Ssl,
    owner: ObjectKey,
}

fn read_field(
    secret: &Secret,
    key: &ObjectKey,
    field: &'static str,
) -> Result<Option<String>, CertificateError> {
    if let Some(value) = secret.string_data.as_ref().and_then(|data| data.get(field)) {
        return Ok(Some(value.clone()));
    }

    secret
        .data
        .as_ref()
        .and_then(|data| data.get(field))
        .map(|bytes| {
            String::from_utf8(bytes.0.clone()).map_err(|_| CertificateError::InvalidField {
                secret: key.clone(),
                field,
            })
        })
        .transpose()
}

fn require_field(
    secret: &Secret,
    key: &ObjectKey,
    field: &'static str,
) -> Result<String, CertificateError> {
    read_field(secret, key, field)?.ok_or_else(|| CertificateError::MissingField {
        secret: key.clone(),
        field,
    })
}

fn refresh(ssl: &mut Ssl, role: SecretRole, secret: &Secret) -> Result<(), CertificateError> {
    let key = ObjectKey::for_object(secret)?;
    match role {
        SecretRole::Certificate => {
            ssl.set_cert(require_field(secret, &key, CERT_FIELD)?);
            ssl.set_key(require_field(secret, &key, KEY_FIELD)?);
            if let Some(ca) = read_field(secret, &key, CA_FIELD)? {
                ssl.set_client_ca(Some(ca));
            }
        }
        SecretRole::ClientCa => {
            ssl.set_client_ca(Some(require_field(secret, &key, CA_FIELD)?));
        }
    }
    Ok(())
}

/// Certificate described by `tls`, with its material read from `secret` and the
/// optional client CA from `ca`.
pub fn translate(
    tls: &ApisixTls,
    secret: &Secret,
    ca: Option<&Secret>,
) -> Result<Ssl, CertificateError> {
    let owner = ObjectKey::for_object(tls)?;
    let metadata = Metadata::builder()
        .full_name(Ssl::compose_name(owner.namespace_or_default(), owner.name()))
        .name(owner.name().clone())
        .build();

    let mut ssl = Ssl::builder()
        .metadata(metadata)
        .snis(tls.spec.hosts.clone())
        .cert(String::new())
        .key(String::new())
        .build();
    refresh(&mut ssl, SecretRole::Certificate, secret)?;
    if let Some(ca) = ca {
        refresh(&mut ssl, SecretRole::ClientCa, ca)?;
    }
    Ok(ssl)
}

/// Concurrent map from a Secret to the certificates derived from it.
#[derive(Debug, Default)]
pub struct SecretIndex {
    certificates: DashMap<String, IndexEntry>,
    by_secret: DashMap<ObjectKey, BTreeSet<(String, SecretRole)>>,
    /// Owners whose Secret did not exist yet when they were reconciled.
    waiting: DashMap<ObjectKey, BTreeSet<ObjectKey>>,
}

impl SecretIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, secret: ObjectKey, ssl: Ssl, owner: ObjectKey, role: SecretRole) {
        debug!(%secret, ssl = ssl.full_name(), %owner, ?role, "Indexing certificate");
        let full_name = ssl.full_name().to_string();
        self.certificates
            .insert(full_name.clone(), IndexEntry { ssl, owner });
        self.by_secret
            .entry(secret)
            .or_default()
            .insert((full_name, role));
    }

    fn forget(&self, full_names: &BTreeSet<String>) {
        for full_name in full_names {
            self.certificates.remove(full_name);
        }
        self.by_secret.retain(|_, references| {
            references.retain(|(full_name, _)| !full_names.contains(full_name));
            !references.is_empty()
        });
    }

    /// Drops every certificate derived for `owner`, returning them.
    pub fn unregister_owner(&self, owner: &ObjectKey) -> Vec<Ssl> {
        let removed = self
            .certificates
            .iter()
            .filter(|entry| &entry.owner == owner)
            .map(|entry| entry.ssl.clone())
            .collect::<Vec<_>>();
        self.forget(
            &removed
                .iter()
                .map(|ssl| ssl.full_name().to_string())
                .collect(),
        );
        removed
    }

    pub fn certificates(&self, secret: &ObjectKey) -> Vec<Ssl> {
        self.references(secret)
            .into_iter()
            .map(|(full_name, _)| full_name)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .filter_map(|full_name| self.certificates.get(&full_name).map(|entry| entry.ssl.clone()))
            .collect()
    }

    fn references(&self, secret: &ObjectKey) -> BTreeSet<(String, SecretRole)> {
        self.by_secret
            .get(secret)
            .map(|references| references.clone())
            .unwrap_or_default()
    }

    pub fn wait_for(&self, secret: ObjectKey, owner: ObjectKey) {
        debug!(%secret, %owner, "Waiting for Secret");
        self.waiting.entry(secret).or_default().insert(owner);
    }

    /// Owners that were waiting for `secret`, which stop waiting.
    pub fn take_waiting(&self, secret: &ObjectKey) -> Vec<ObjectKey> {
        self.waiting
            .remove(secret)
            .map(|(_, owners)| owners.into_iter().collect())
            .unwrap_or_default()
    }

    /// Number of Secrets feeding at least one certificate.
    pub fn len(&self) -> usize {
        self.by_secret.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_secret.is_empty()
    }

    /// Certificate updates implied by a Secret change. A deleted Secret only
    /// deletes certificates whose owner is gone as well.
    #[instrument(skip_all, fields(kind = %kind))]
    pub fn on_secret(
        &self,
        kind: ChangeKind,
        secret: &Secret,
        owners: &dyn Lister<ApisixTls>,
    ) -> Result<Vec<CertificateUpdate>, CertificateError> {
        let key = ObjectKey::for_object(secret)?;
        let references = self.references(&key);
        if references.is_empty() {
            debug!(secret = %key, "Secret feeds no certificate");
            return Ok(Vec::new());
        }
        let full_names = references
            .iter()
            .map(|(full_name, _)| full_name.clone())
            .collect::<BTreeSet<_>>();

        match kind {
            ChangeKind::Add | ChangeKind::Update => {
                for (full_name, role) in &references {
                    if let Some(mut entry) = self.certificates.get_mut(full_name) {
                        refresh(&mut entry.ssl, *role, secret)?;
                    }
                }
                Ok(full_names
                    .iter()
                    .filter_map(|full_name| self.certificates.get(full_name))
                    .map(|entry| {
                        CertificateUpdate::new(
                            entry.ssl.clone(),
                            entry.owner.clone(),
                            CertificateOperation::Upsert,
                            None,
                        )
                    })
                    .collect())
            }
            ChangeKind::Delete => {
                let orphaned = full_names
                    .iter()
                    .filter_map(|full_name| self.certificates.get(full_name))
                    .filter(|entry| {
                        let exists = owners.exists(&entry.owner);
                        if exists {
                            debug!(
                                secret = %key,
                                owner = %entry.owner,
                                "Owner still exists, keeping certificate"
                            );
                        }
                        !exists
                    })
                    .map(|entry| {
                        CertificateUpdate::new(
                            entry.ssl.clone(),
                            entry.owner.clone(),
                            CertificateOperation::Delete,
                            None,
                        )
                    })
                    .collect::<Vec<_>>();
                self.forget(
                    &orphaned
                        .iter()
                        .map(|update| update.ssl.full_name().to_string())
                        .collect(),
                );
                Ok(orphaned)
            }
        }
    }
}

/// Writes a certificate update to every target.
#[instrument(skip_all, fields(ssl = update.ssl.full_name(), operation = %update.operation))]
pub async fn deliver(targets: &[Target], update: &CertificateUpdate) -> Result<(), AggregateError> {
    let mut errors = AggregateError::new();
    for target in targets {
        let manifest = Manifest::of_ssl(update.ssl.clone());
        let result = match update.operation {
            CertificateOperation::Upsert => target.pipeline().sync(manifest).await,
            CertificateOperation::Delete => target.pipeline().remove(manifest).await,
        };
        if let Err(err) = result {
            warn!(cluster = %target.name(), %err, "Unable to deliver certificate");
            errors.extend(err);
        }
    }
    errors.into_result(())
}

/// Key of a Secret referenced by `tls`, defaulting to the namespace of `tls`.
pub fn reference_key(tls: &ApisixTls, reference: &SecretReference) -> ObjectKey {
    let namespace = if reference.namespace.is_empty() {
        tls.namespace().unwrap_or_default()
    } else {
        reference.namespace.clone()
    };
    ObjectKey::new(namespace, reference.name.clone())
}
