use apisix_ingress_core::workqueue::BackoffPolicy;
use getset::CopyGetters;
use std::time::Duration;

#[derive(Debug, CopyGetters, PartialEq, Eq, Clone, Copy)]
pub struct Options {
    /// Capacity of each per-kind sync queue.
    #[getset(get_copy = "pub")]
    queue_capacity: usize,

    #[getset(get_copy = "pub")]
    max_retries: u32,

    #[getset(get_copy = "pub")]
    base_backoff: Duration,

    #[getset(get_copy = "pub")]
    max_backoff: Duration,

    /// Weight of nodes projected from endpoints.
    #[getset(get_copy = "pub")]
    default_weight: u32,

    #[getset(get_copy = "pub")]
    workers_per_controller: usize,

    /// How often every cached object is queued again.
    #[getset(get_copy = "pub")]
    resync_period: Duration,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            queue_capacity: 64,
            max_retries: 10,
            base_backoff: Duration::from_millis(5),
            max_backoff: Duration::from_secs(1000),
            default_weight: 100,
            workers_per_controller: 1,
            resync_period: Duration::from_secs(6 * 60 * 60),
        }
    }
}

impl Options {
    pub fn with_resync_period(self, resync_period: Duration) -> Self {
        Self {
            resync_period,
            ..self
        }
    }

    pub fn backoff_policy(&self) -> BackoffPolicy {
        BackoffPolicy::builder()
            .base_delay(self.base_backoff)
            .max_delay(self.max_backoff)
            .max_retries(self.max_retries)
            .build()
    }
}
