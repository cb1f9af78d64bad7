use crate::apisix::{ApisixResource, Identity, ResourceKind};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use strum::Display;
use tokio::sync::oneshot;
use tracing::trace;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[strum(serialize_all = "lowercase")]
pub enum SyncState {
    Created,
    Updated,
    Unchanged,
    /// The write lost arbitration and the observed object was kept.
    Suppressed,
    /// Not part of the manifest, found in the mirror or the remote instead.
    Resolved,
    Removed,
}

/// Completion of an object's remote write, carrying its durable remote identifier.
#[derive(Debug, Clone)]
pub struct Event<T> {
    pub kind: ResourceKind,
    pub state: SyncState,
    pub object: T,
}

impl<T: ApisixResource> Event<T> {
    pub fn new(state: SyncState, object: T) -> Self {
        Self {
            kind: T::KIND,
            state,
            object,
        }
    }
}

type Mailboxes<T> = HashMap<Identity, Vec<oneshot::Sender<Event<T>>>>;

/// Pass-scoped publish/subscribe keyed by dependency identity. Every subscriber
/// owns a single-slot mailbox.
pub(crate) struct EventHub<T> {
    subscribers: Mutex<Mailboxes<T>>,
}

impl<T: ApisixResource> EventHub<T> {
    pub(crate) fn new() -> Self {
        Self {
            subscribers: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Mailboxes<T>> {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn subscribe(&self, identity: Identity) -> oneshot::Receiver<Event<T>> {
        let (tx, rx) = oneshot::channel();
        self.lock().entry(identity).or_default().push(tx);
        rx
    }

    /// Identities with subscribers still waiting for an event.
    pub(crate) fn pending(&self) -> Vec<Identity> {
        let mut identities: Vec<Identity> = self.lock().keys().cloned().collect();
        identities.sort();
        identities
    }

    pub(crate) fn publish(&self, event: &Event<T>) -> usize {
        self.publish_to(&event.object.identity(), event)
    }

    /// Delivers `event` to the subscribers of `identity`, which may differ from the
    /// object's own identity when the reference was resolved by short name.
    pub(crate) fn publish_to(&self, identity: &Identity, event: &Event<T>) -> usize {
        let subscribers = self.lock().remove(identity).unwrap_or_default();
        let delivered = subscribers
            .into_iter()
            .map(|subscriber| subscriber.send(event.clone()).is_ok())
            .filter(|delivered| *delivered)
            .count();
        trace!(
            kind = %event.kind,
            %identity,
            state = %event.state,
            delivered,
            "Published event"
        );
        delivered
    }

    /// Drops every remaining mailbox so the waiting subscribers stop.
    pub(crate) fn close(&self) {
        let stalled = std::mem::take(&mut *self.lock());
        for identity in stalled.keys() {
            trace!(kind = %T::KIND, %identity, "Dependency was not solved in this pass");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::apisix::{Metadata, Upstream};
    use assertables::{assert_err, assert_ok};

    fn upstream(full_name: &str) -> Upstream {
        Upstream::builder()
            .metadata(Metadata::builder().full_name(full_name).name(full_name).build())
            .build()
    }

    #[tokio::test]
    async fn test_publish_reaches_every_subscriber_of_the_name() {
        let hub = EventHub::<Upstream>::new();
        let first = hub.subscribe("a".into());
        let second = hub.subscribe("a".into());
        let other = hub.subscribe("b".into());

        let delivered = hub.publish(&Event::new(SyncState::Created, upstream("a")));

        assert_eq!(delivered, 2);
        assert_eq!(assert_ok!(first.await).object.full_name(), "a");
        assert_eq!(assert_ok!(second.await).state, SyncState::Created);
        assert_eq!(hub.pending(), vec![Identity::from("b")]);

        hub.close();
        assert_err!(other.await);
    }

    #[tokio::test]
    async fn test_publish_to_a_reference_name() {
        let hub = EventHub::<Upstream>::new();
        let waiting = hub.subscribe("web".into());

        let delivered = hub.publish_to(
            &Identity::from("web"),
            &Event::new(SyncState::Resolved, upstream("prod_web_80")),
        );

        assert_eq!(delivered, 1);
        assert_eq!(assert_ok!(waiting.await).object.full_name(), "prod_web_80");
        assert!(hub.pending().is_empty());
    }
}
