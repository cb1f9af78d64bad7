//! A de-duplicating work queue with per-item exponential backoff.
//!
//! Controllers push object keys into a [`RetryQueue`] and a single worker
//! pulls them back out. Failed items are re-added through
//! [`RetryQueue::add_rate_limited`], which delays every retry twice as long as
//! the previous one and drops the item once the retry ceiling is reached.

use crate::instrumentation::METER;
use dashmap::{DashMap, DashSet};
use getset::CopyGetters;
use opentelemetry::KeyValue;
use opentelemetry::metrics::Counter;
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::{Arc, LazyLock};
use std::time::Duration;
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};
use typed_builder::TypedBuilder;

static DROPPED_ITEMS: LazyLock<Counter<u64>> = LazyLock::new(|| {
    METER
        .u64_counter("workqueue_dropped_items")
        .with_description("Number of items dropped after exhausting their retries")
        .build()
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, TypedBuilder, CopyGetters)]
pub struct BackoffPolicy {
    #[getset(get_copy = "pub")]
    #[builder(default = Duration::from_millis(5))]
    base_delay: Duration,

    #[getset(get_copy = "pub")]
    #[builder(default = Duration::from_secs(1000))]
    max_delay: Duration,

    #[getset(get_copy = "pub")]
    #[builder(default = 10)]
    max_retries: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl BackoffPolicy {
    /// Delay before retry number `attempt` (1-based): base, 2 x base, 4 x base, ... capped.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.base_delay
            .checked_mul(1u32 << exponent)
            .map_or(self.max_delay, |delay| delay.min(self.max_delay))
    }
}

pub struct RetryQueue<K> {
    inner: Arc<Inner<K>>,
}

impl<K> Clone for RetryQueue<K> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

struct Inner<K> {
    name: &'static str,
    policy: BackoffPolicy,
    tx: mpsc::UnboundedSender<K>,
    rx: Mutex<mpsc::UnboundedReceiver<K>>,
    queued: DashSet<K>,
    attempts: DashMap<K, u32>,
    shutdown: CancellationToken,
}

impl<K> RetryQueue<K>
where
    K: Clone + Debug + Eq + Hash + Send + Sync + 'static,
{
    pub fn new(name: &'static str, policy: BackoffPolicy) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(Inner {
                name,
                policy,
                tx,
                rx: Mutex::new(rx),
                queued: DashSet::new(),
                attempts: DashMap::new(),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    pub fn name(&self) -> &'static str {
        self.inner.name
    }

    /// Enqueues `key` unless it is already waiting to be processed.
    pub fn add(&self, key: K) {
        if self.inner.shutdown.is_cancelled() {
            trace!(queue = self.inner.name, ?key, "Queue shut down, ignoring key");
            return;
        }

        if !self.inner.queued.insert(key.clone()) {
            trace!(queue = self.inner.name, ?key, "Key already queued");
            return;
        }

        if self.inner.tx.send(key).is_err() {
            debug!(queue = self.inner.name, "Queue receiver closed");
        }
    }

    pub fn add_after(&self, key: K, delay: Duration) {
        let queue = self.clone();
        let shutdown = self.inner.shutdown.clone();
        tokio::spawn(async move {
            tokio::select! {
                () = tokio::time::sleep(delay) => queue.add(key),
                () = shutdown.cancelled() => {}
            }
        });
    }

    /// Re-adds `key` after its backoff delay. Returns `false` when the key has
    /// exhausted its retries and was dropped instead.
    pub fn add_rate_limited(&self, key: K) -> bool {
        let attempt = {
            let mut attempts = self.inner.attempts.entry(key.clone()).or_insert(0);
            *attempts += 1;
            *attempts
        };

        if attempt > self.inner.policy.max_retries() {
            warn!(
                queue = self.inner.name,
                ?key,
                attempts = attempt - 1,
                "Dropping key after exhausting retries"
            );
            DROPPED_ITEMS.add(1, &[KeyValue::new("queue", self.inner.name)]);
            self.forget(&key);
            return false;
        }

        let delay = self.inner.policy.delay_for(attempt);
        debug!(
            queue = self.inner.name,
            ?key,
            attempt,
            delay_ms = delay.as_millis(),
            "Scheduling retry"
        );
        self.add_after(key, delay);
        true
    }

    /// Clears the retry history of `key`, typically after it was processed successfully.
    pub fn forget(&self, key: &K) {
        self.inner.attempts.remove(key);
    }

    pub fn attempts(&self, key: &K) -> u32 {
        self.inner.attempts.get(key).map_or(0, |attempts| *attempts)
    }

    pub fn len(&self) -> usize {
        self.inner.queued.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.queued.is_empty()
    }

    /// Waits for the next key. Returns `None` once the queue was shut down.
    pub async fn get(&self) -> Option<K> {
        let mut rx = self.inner.rx.lock().await;
        let key = tokio::select! {
            biased;
            () = self.inner.shutdown.cancelled() => None,
            key = rx.recv() => key,
        }?;
        self.inner.queued.remove(&key);
        Some(key)
    }

    pub fn shut_down(&self) {
        debug!(queue = self.inner.name, "Shutting down queue");
        self.inner.shutdown.cancel();
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }
}
