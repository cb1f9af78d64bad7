use crate::apisix::{ApisixResource, Route, Service, SourceKind, Ssl, Upstream};
use strum::Display;

/// How much of an incoming write is applied over an observed object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "snake_case")]
pub enum Precedence {
    Full,
    NodesOnly,
    Suppress,
}

/// Rule table between the writer of an incoming object and the recorded owner of
/// the observed one.
pub fn decide(incoming: SourceKind, observed: SourceKind) -> Precedence {
    use SourceKind::{Crd, EndpointWatch, KubernetesService};

    match (incoming, observed) {
        (Crd, _) => Precedence::Full,
        (EndpointWatch, Crd) => Precedence::NodesOnly,
        (KubernetesService, Crd) => Precedence::Suppress,
        (EndpointWatch | KubernetesService, EndpointWatch | KubernetesService) => Precedence::Full,
    }
}

/// Merge of an incoming object with the observed remote one.
pub trait Arbitrated: ApisixResource {
    /// `None` when the write is suppressed entirely.
    fn arbitrate(incoming: Self, observed: &Self) -> Option<Self>;
}

impl Arbitrated for Upstream {
    fn arbitrate(incoming: Self, observed: &Self) -> Option<Self> {
        match decide(incoming.source(), observed.source()) {
            Precedence::Full => Some(incoming),
            Precedence::NodesOnly => {
                let mut merged = observed.clone();
                merged.set_nodes(incoming.nodes().clone());
                Some(merged)
            }
            Precedence::Suppress => None,
        }
    }
}

impl Arbitrated for Service {
    fn arbitrate(incoming: Self, observed: &Self) -> Option<Self> {
        match decide(incoming.source(), observed.source()) {
            Precedence::Full => Some(incoming),
            Precedence::NodesOnly | Precedence::Suppress => None,
        }
    }
}

impl Arbitrated for Route {
    fn arbitrate(incoming: Self, _observed: &Self) -> Option<Self> {
        Some(incoming)
    }
}

impl Arbitrated for Ssl {
    fn arbitrate(incoming: Self, _observed: &Self) -> Option<Self> {
        Some(incoming)
    }
}
