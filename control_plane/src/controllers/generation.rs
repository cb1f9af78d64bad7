use dashmap::DashMap;
use std::fmt::Debug;
use std::hash::Hash;
use tracing::debug;

/// Last `metadata.generation` processed per key, for dropping work that a newer
/// change has already superseded.
#[derive(Debug)]
pub struct GenerationTracker<K: Eq + Hash> {
    processed: DashMap<K, i64>,
}

impl<K: Eq + Hash> Default for GenerationTracker<K> {
    fn default() -> Self {
        Self {
            processed: DashMap::new(),
        }
    }
}

impl<K: Clone + Debug + Eq + Hash> GenerationTracker<K> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `generation` is older than the one last processed for `key`.
    /// Objects without a generation are never stale.
    pub fn is_stale(&self, key: &K, generation: Option<i64>) -> bool {
        let Some(generation) = generation else {
            return false;
        };
        let stale = self
            .processed
            .get(key)
            .is_some_and(|processed| generation < *processed);
        if stale {
            debug!(?key, generation, "Dropping stale generation");
        }
        stale
    }

    pub fn record(&self, key: K, generation: Option<i64>) {
        if let Some(generation) = generation {
            self.processed
                .entry(key)
                .and_modify(|processed| *processed = (*processed).max(generation))
                .or_insert(generation);
        }
    }

    pub fn forget(&self, key: &K) {
        self.processed.remove(key);
    }

    pub fn last(&self, key: &K) -> Option<i64> {
        self.processed.get(key).map(|processed| *processed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(None, Some(1), false)]
    #[case(Some(3), None, false)]
    #[case(Some(3), Some(2), true)]
    #[case(Some(3), Some(3), false)]
    #[case(Some(3), Some(4), false)]
    fn test_is_stale(
        #[case] processed: Option<i64>,
        #[case] incoming: Option<i64>,
        #[case] expected: bool,
    ) {
        let tracker = GenerationTracker::new();
        tracker.record("key", processed);

        assert_eq!(tracker.is_stale(&"key", incoming), expected);
    }

    #[test]
    fn test_record_keeps_highest_generation() {
        let tracker = GenerationTracker::new();
        tracker.record("key", Some(5));
        tracker.record("key", Some(4));

        assert_eq!(tracker.last(&"key"), Some(5));

        tracker.forget(&"key");
        assert_eq!(tracker.last(&"key"), None);
    }
}
