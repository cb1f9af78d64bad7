use crate::apisix::ResourceKind;
use crate::cluster::ClusterError;
use crate::diff::DiffError;
use crate::mirror::StoreError;
use itertools::Itertools;
use std::fmt::{Display, Formatter};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("failed to write {kind} {name}: {source}")]
    Remote {
        kind: ResourceKind,
        name: String,
        #[source]
        source: ClusterError,
    },
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Diff(#[from] DiffError),
    #[error("pipeline stopped before {kind} {name} was solved")]
    Cancelled { kind: ResourceKind, name: String },
}

impl SyncError {
    pub fn remote<S: Into<String>>(kind: ResourceKind, name: S, source: ClusterError) -> Self {
        Self::Remote {
            kind,
            name: name.into(),
            source,
        }
    }

    pub fn cancelled<S: Into<String>>(kind: ResourceKind, name: S) -> Self {
        Self::Cancelled {
            kind,
            name: name.into(),
        }
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Remote { source, .. } => source.is_retryable(),
            Self::Cancelled { .. } => true,
            Self::Store(_) | Self::Diff(_) => false,
        }
    }
}

/// Every failure of one pass or batch; successes are kept regardless.
#[derive(Debug, Default)]
pub struct AggregateError(Vec<SyncError>);

impl AggregateError {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, error: SyncError) {
        self.0.push(error);
    }

    pub fn extend(&mut self, other: AggregateError) {
        self.0.extend(other.0);
    }

    pub fn errors(&self) -> &[SyncError] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_retryable(&self) -> bool {
        self.0.iter().any(SyncError::is_retryable)
    }

    /// `Ok` when nothing failed.
    pub fn into_result<T>(self, value: T) -> Result<T, Self> {
        if self.is_empty() { Ok(value) } else { Err(self) }
    }
}

impl Display for AggregateError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.iter().join("; "))
    }
}

impl std::error::Error for AggregateError {}

impl From<SyncError> for AggregateError {
    fn from(error: SyncError) -> Self {
        Self(vec![error])
    }
}
