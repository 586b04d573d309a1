//! Bounded set of already-processed correlation ids
//!
//! Redelivered envelopes keep their correlation id. An activation records the
//! id of every envelope its handler processed successfully and drops later
//! arrivals of the same id and event type. The set is an LRU so it stays
//! bounded; ids older than its capacity are forgotten.

use std::num::NonZeroUsize;

use lru::LruCache;

use crate::types::CorrelationId;

type Key = (CorrelationId, String);

pub struct SeenCorrelations {
    seen: LruCache<Key, ()>,
}

impl SeenCorrelations {
    pub const DEFAULT_CAPACITY: usize = 4096;

    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            seen: LruCache::new(capacity),
        }
    }

    /// Has this envelope been processed already?
    pub fn contains(&mut self, key: &Key) -> bool {
        // `get` refreshes recency so hot ids stay remembered
        self.seen.get(key).is_some()
    }

    /// Remember a processed envelope
    pub fn record(&mut self, key: Key) {
        self.seen.put(key, ());
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

impl Default for SeenCorrelations {
    fn default() -> Self {
        Self::new(Self::DEFAULT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_arrival_is_seen() {
        let mut seen = SeenCorrelations::default();
        let key = (CorrelationId::new(), "Tick".to_string());

        assert!(!seen.contains(&key));
        seen.record(key.clone());
        assert!(seen.contains(&key));

        let other_type = (key.0, "Tock".to_string());
        assert!(!seen.contains(&other_type));
    }

    #[test]
    fn test_capacity_bounds_memory() {
        let mut seen = SeenCorrelations::new(2);
        let keys: Vec<_> = (0..3)
            .map(|_| (CorrelationId::new(), "Tick".to_string()))
            .collect();
        for key in &keys {
            seen.record(key.clone());
        }

        assert_eq!(seen.len(), 2);
        assert!(!seen.contains(&keys[0]));
        assert!(seen.contains(&keys[2]));
    }

    #[test]
    fn test_zero_capacity_still_works() {
        let mut seen = SeenCorrelations::new(0);
        let key = (CorrelationId::new(), "Tick".to_string());
        seen.record(key.clone());
        assert!(seen.contains(&key));
    }
}
