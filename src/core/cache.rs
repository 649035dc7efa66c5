use std::collections::{HashMap, VecDeque};
use std::hash::Hash;

pub const DEFAULT_CACHE_CAPACITY: usize = 100;

/// Fixed-capacity map that evicts in insertion order.
///
/// This approximates LRU: reads do not refresh an entry, and replacing the
/// value of an existing key keeps its original position.
#[derive(Debug)]
pub struct BoundedCache<K, V> {
    capacity: usize,
    entries: HashMap<K, V>,
    order: VecDeque<K>,
}

impl<K, V> BoundedCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            entries: HashMap::with_capacity(capacity),
            order: VecDeque::with_capacity(capacity),
        }
    }

    pub fn get(&self, key: &K) -> Option<V> {
        self.entries.get(key).cloned()
    }

    pub fn contains(&self, key: &K) -> bool {
        self.entries.contains_key(key)
    }

    /// Inserts `value`, returning the key evicted to make room, if any.
    pub fn set(&mut self, key: K, value: V) -> Option<K> {
        if let Some(existing) = self.entries.get_mut(&key) {
            *existing = value;
            return None;
        }

        let mut evicted = None;
        if self.entries.len() >= self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.entries.remove(&oldest);
                evicted = Some(oldest);
            }
        }

        self.order.push_back(key.clone());
        self.entries.insert(key, value);
        evicted
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_after_set() {
        let mut cache = BoundedCache::new(3);
        cache.set("a", 1);
        assert_eq!(cache.get(&"a"), Some(1));
        assert_eq!(cache.get(&"b"), None);
    }

    #[test]
    fn test_overflow_evicts_earliest_inserted() {
        let mut cache = BoundedCache::new(2);
        assert_eq!(cache.set("a", 1), None);
        assert_eq!(cache.set("b", 2), None);
        // Reading does not refresh recency.
        assert_eq!(cache.get(&"a"), Some(1));

        assert_eq!(cache.set("c", 3), Some("a"));
        assert!(!cache.contains(&"a"));
        assert_eq!(cache.get(&"b"), Some(2));
        assert_eq!(cache.get(&"c"), Some(3));
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_replacing_a_key_keeps_its_position() {
        let mut cache = BoundedCache::new(2);
        cache.set("a", 1);
        cache.set("b", 2);
        assert_eq!(cache.set("a", 10), None);
        assert_eq!(cache.get(&"a"), Some(10));

        assert_eq!(cache.set("c", 3), Some("a"));
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_never_exceeds_capacity() {
        let mut cache = BoundedCache::new(DEFAULT_CACHE_CAPACITY);
        for i in 0..250 {
            cache.set(i, i * 2);
            assert!(cache.len() <= DEFAULT_CACHE_CAPACITY);
        }
        assert!(!cache.contains(&149));
        assert!(cache.contains(&150));
        assert!(cache.contains(&249));
    }

    #[test]
    fn test_zero_capacity_is_clamped() {
        let mut cache = BoundedCache::new(0);
        assert_eq!(cache.set(1, "x"), None);
        assert_eq!(cache.set(2, "y"), Some(1));
        assert_eq!(cache.len(), 1);
    }
}
