use crate::apisix::{Route, Service, Ssl, Upstream};
use getset::Getters;
use typed_builder::TypedBuilder;

/// A consistent set of objects that is reconciled as one unit.
#[derive(Debug, Clone, Default, PartialEq, TypedBuilder, Getters)]
pub struct Manifest {
    #[getset(get = "pub")]
    #[builder(default)]
    routes: Vec<Route>,

    #[getset(get = "pub")]
    #[builder(default)]
    services: Vec<Service>,

    #[getset(get = "pub")]
    #[builder(default)]
    upstreams: Vec<Upstream>,

    #[getset(get = "pub")]
    #[builder(default)]
    ssls: Vec<Ssl>,
}

impl Manifest {
    pub fn of_upstream(upstream: Upstream) -> Self {
        Self::builder().upstreams(vec![upstream]).build()
    }

    pub fn of_ssl(ssl: Ssl) -> Self {
        Self::builder().ssls(vec![ssl]).build()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
            && self.services.is_empty()
            && self.upstreams.is_empty()
            && self.ssls.is_empty()
    }

    pub fn len(&self) -> usize {
        self.routes.len() + self.services.len() + self.upstreams.len() + self.ssls.len()
    }

    pub fn into_parts(self) -> (Vec<Route>, Vec<Service>, Vec<Upstream>, Vec<Ssl>) {
        (self.routes, self.services, self.upstreams, self.ssls)
    }
}
