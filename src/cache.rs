//! Frequency-aware LRU cache.
//!
//! Backs both the block cache (keyed by table number and block offset) and
//! the open-table cache (keyed by file number). Eviction walks the queue in
//! insertion order and gives each entry a second chance per recorded access,
//! so a hot block survives a scan of cold ones.

use std::collections::{HashMap, VecDeque};
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Accesses beyond this stop increasing an entry's survival budget.
const MAX_FREQUENCY: u8 = 3;

type EvictedFn<K, V> = Box<dyn Fn(&K, &V) + Send>;

struct Entry<V> {
    value: V,
    freq: u8,
}

pub struct Cache<K, V>
where
    K: Eq + Hash + Clone + Debug,
    V: Clone,
{
    capacity: usize,
    entries: HashMap<K, Entry<V>>,
    /// Eviction scan order; stale keys are skipped lazily.
    queue: VecDeque<K>,
    evicted_fn: Option<EvictedFn<K, V>>,
    stats: Stats,
}

impl<K, V> Cache<K, V>
where
    K: Eq + Hash + Clone + Debug,
    V: Clone,
{
    pub fn new(capacity: usize, evicted_fn: Option<EvictedFn<K, V>>) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: HashMap::new(),
            queue: VecDeque::new(),
            evicted_fn,
            stats: Stats::new(),
        }
    }

    /// Returns a clone of the cached value and records the access.
    pub fn get(&mut self, key: &K) -> Option<V> {
        match self.entries.get_mut(key) {
            Some(entry) => {
                entry.freq = (entry.freq + 1).min(MAX_FREQUENCY);
                self.stats.hit();
                Some(entry.value.clone())
            }
            None => {
                self.stats.miss();
                None
            }
        }
    }

    /// Inserts or replaces an entry, evicting as needed to stay in budget.
    pub fn insert(&mut self, key: K, value: V) {
        if let Some(entry) = self.entries.get_mut(&key) {
            entry.value = value;
            entry.freq = (entry.freq + 1).min(MAX_FREQUENCY);
            return;
        }
        while self.entries.len() >= self.capacity {
            self.evict_one();
        }
        self.entries.insert(key.clone(), Entry { value, freq: 0 });
        self.queue.push_back(key);
    }

    /// Removes an entry without treating it as an eviction.
    pub fn remove(&mut self, key: &K) -> Option<V> {
        self.entries.remove(key).map(|e| e.value)
    }

    /// Drops every entry, invoking the eviction callback for each.
    pub fn purge(&mut self) {
        for (key, entry) in self.entries.drain() {
            if let Some(evicted_fn) = &self.evicted_fn {
                evicted_fn(&key, &entry.value);
            }
        }
        self.queue.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// (hits, misses) since creation.
    pub fn stats(&self) -> (usize, usize) {
        self.stats.get()
    }

    fn evict_one(&mut self) {
        while let Some(key) = self.queue.pop_front() {
            let Some(entry) = self.entries.get_mut(&key) else {
                // Stale queue slot for a removed entry.
                continue;
            };
            if entry.freq > 0 {
                entry.freq -= 1;
                self.queue.push_back(key);
                continue;
            }
            let entry = self.entries.remove(&key).expect("entry present");
            if let Some(evicted_fn) = &self.evicted_fn {
                evicted_fn(&key, &entry.value);
            }
            return;
        }
    }
}

struct Stats {
    hits: AtomicUsize,
    misses: AtomicUsize,
}

impl Stats {
    fn new() -> Self {
        Stats {
            hits: AtomicUsize::new(0),
            misses: AtomicUsize::new(0),
        }
    }

    fn hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    fn miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    fn get(&self) -> (usize, usize) {
        (
            self.hits.load(Ordering::Relaxed),
            self.misses.load(Ordering::Relaxed),
        )
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;

    #[test]
    fn test_insert_and_get() {
        let mut cache = Cache::new(2, None);
        cache.insert("apple", "red");
        cache.insert("banana", "yellow");

        assert_eq!(cache.get(&"apple"), Some("red"));
        assert_eq!(cache.get(&"banana"), Some("yellow"));
        assert_eq!(cache.get(&"pear"), None);
    }

    #[test]
    fn test_eviction_prefers_cold_entries() {
        let mut cache = Cache::new(3, None);
        cache.insert(1, 1);
        cache.insert(2, 2);
        cache.insert(3, 3);

        // Heat up 1; inserting 4 should push out a cold entry instead.
        cache.get(&1);
        cache.get(&1);
        cache.insert(4, 4);

        assert_eq!(cache.get(&1), Some(1));
        assert_eq!(cache.len(), 3);
    }

    #[test]
    fn test_capacity_is_bounded() {
        let mut cache = Cache::new(4, None);
        for i in 0..100 {
            cache.insert(i, i);
        }
        assert_eq!(cache.len(), 4);
        // The most recent insert always survives its own insertion.
        assert_eq!(cache.get(&99), Some(99));
    }

    #[test]
    fn test_eviction_callback_fires() {
        let evicted = Arc::new(Mutex::new(Vec::new()));
        let hook = {
            let evicted = Arc::clone(&evicted);
            Box::new(move |k: &i32, v: &i32| evicted.lock().unwrap().push((*k, *v)))
        };
        let mut cache = Cache::new(2, Some(hook));

        cache.insert(1, 10);
        cache.insert(2, 20);
        cache.insert(3, 30);

        assert_eq!(*evicted.lock().unwrap(), vec![(1, 10)]);
    }

    #[test]
    fn test_remove_skips_callback_and_purge_fires_it() {
        let evicted = Arc::new(Mutex::new(Vec::new()));
        let hook = {
            let evicted = Arc::clone(&evicted);
            Box::new(move |k: &i32, _: &i32| evicted.lock().unwrap().push(*k))
        };
        let mut cache = Cache::new(4, Some(hook));
        cache.insert(1, 1);
        cache.insert(2, 2);

        assert_eq!(cache.remove(&1), Some(1));
        assert!(evicted.lock().unwrap().is_empty());

        cache.purge();
        assert_eq!(*evicted.lock().unwrap(), vec![2]);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_replace_updates_value() {
        let mut cache = Cache::new(2, None);
        cache.insert("k", 1);
        cache.insert("k", 2);
        assert_eq!(cache.get(&"k"), Some(2));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_hit_ratio_stats() {
        let mut cache = Cache::new(8, None);
        for i in 0..5 {
            cache.insert(i, i);
        }
        for i in 0..5 {
            assert_eq!(cache.get(&i), Some(i));
        }
        cache.get(&99);
        assert_eq!(cache.stats(), (5, 1));
    }
}
