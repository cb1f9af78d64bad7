use getset::Getters;
use kube::{Resource, ResourceExt};
use std::fmt::{Display, Formatter, Write};
use thiserror::Error;
use typed_builder::TypedBuilder;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ObjectKeyError {
    #[error("Object is missing a name")]
    MissingName,
}

/// Namespaced identity of a Kubernetes object, used as a work-queue key.
#[derive(TypedBuilder, Getters, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey {
    #[getset(get = "pub")]
    #[builder(default, setter(strip_option, into))]
    namespace: Option<String>,

    #[getset(get = "pub")]
    #[builder(setter(into))]
    name: String,
}

impl Display for ObjectKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        if let Some(namespace) = self.namespace() {
            f.write_str(namespace)?;
            f.write_char('/')?;
        }
        f.write_str(self.name())
    }
}

impl ObjectKey {
    pub fn new<N: Into<String>, S: Into<String>>(namespace: N, name: S) -> Self {
        Self::builder().namespace(namespace).name(name).build()
    }

    pub fn for_object<K: Resource>(object: &K) -> Result<Self, ObjectKeyError> {
        let name = object
            .meta()
            .name
            .clone()
            .ok_or(ObjectKeyError::MissingName)?;

        Ok(Self {
            namespace: object.namespace(),
            name,
        })
    }

    /// Namespace, or the empty string for cluster-scoped objects.
    pub fn namespace_or_default(&self) -> &str {
        self.namespace.as_deref().unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assertables::{assert_err, assert_ok};
    use k8s_openapi::api::core::v1::Secret;
    use kube::api::ObjectMeta;

    #[test]
    fn test_for_object() {
        let secret = Secret {
            metadata: ObjectMeta {
                namespace: Some("prod".to_string()),
                name: Some("site-tls".to_string()),
                ..Default::default()
            },
            ..Default::default()
        };

        let key = assert_ok!(ObjectKey::for_object(&secret));
        assert_eq!(key, ObjectKey::new("prod", "site-tls"));
        assert_eq!(key.to_string(), "prod/site-tls");
    }

    #[test]
    fn test_for_object_requires_name() {
        assert_err!(ObjectKey::for_object(&Secret::default()));
    }
}
