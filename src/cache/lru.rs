//! Generic capacity-bounded cache for shared handles.
//!
//! A sharded LRU keyed cache whose values are cheap clones (`Arc`s in
//! practice). Eviction only drops the cache's own clone: whatever resources
//! the value owns are released when the last outstanding clone goes away,
//! which is how evicting a handle defers its close past any live iterator.
//!
//! [`LruCache::get_or_try_insert_with`] gives atomic get-or-create
//! semantics: concurrent misses for one key perform exactly one successful
//! initialization, with every other caller waiting for it and sharing the
//! result.

use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use crate::Result;

/// Statistics for cache operations.
#[derive(Debug, Default)]
pub struct CacheStats {
    /// Number of cache hits.
    pub hits: AtomicU64,
    /// Number of cache misses.
    pub misses: AtomicU64,
    /// Number of insertions.
    pub inserts: AtomicU64,
    /// Number of capacity evictions.
    pub evictions: AtomicU64,
}

impl CacheStats {
    /// Get hit rate (0.0 to 1.0).
    pub fn hit_rate(&self) -> f64 {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64
        }
    }
}

/// Tracks one in-flight initialization so concurrent misses can wait on it.
struct InitGuard {
    done: Mutex<bool>,
    cond: Condvar,
}

impl InitGuard {
    fn new() -> Self {
        Self {
            done: Mutex::new(false),
            cond: Condvar::new(),
        }
    }

    fn wait(&self) {
        let mut done = self.done.lock();
        while !*done {
            self.cond.wait(&mut done);
        }
    }

    fn finish(&self) {
        let mut done = self.done.lock();
        *done = true;
        self.cond.notify_all();
    }
}

/// A node in the LRU linked list.
struct LruNode<K, V> {
    key: K,
    value: V,
    prev: Option<usize>,
    next: Option<usize>,
}

/// A single shard: an LRU list plus the in-flight initializations for keys
/// hashing here.
struct LruShard<K, V> {
    capacity: usize,
    /// Map from key to node index.
    map: HashMap<K, usize>,
    /// Node storage (indices instead of pointers).
    nodes: Vec<Option<LruNode<K, V>>>,
    /// Free list of node indices.
    free_list: Vec<usize>,
    /// Head of LRU list (most recently used).
    head: Option<usize>,
    /// Tail of LRU list (least recently used).
    tail: Option<usize>,
    /// Keys currently being initialized. Never counted against capacity and
    /// never eligible for eviction.
    pending: HashMap<K, Arc<InitGuard>>,
}

impl<K: Hash + Eq + Clone, V: Clone> LruShard<K, V> {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            map: HashMap::with_capacity(capacity),
            nodes: Vec::with_capacity(capacity),
            free_list: Vec::new(),
            head: None,
            tail: None,
            pending: HashMap::new(),
        }
    }

    fn get(&mut self, key: &K) -> Option<V> {
        if let Some(&idx) = self.map.get(key) {
            self.move_to_front(idx);
            self.nodes[idx].as_ref().map(|n| n.value.clone())
        } else {
            None
        }
    }

    fn insert(&mut self, key: K, value: V) -> bool {
        if let Some(&idx) = self.map.get(&key) {
            if let Some(ref mut node) = self.nodes[idx] {
                node.value = value;
            }
            self.move_to_front(idx);
            return false; // No eviction
        }

        let evicted = if self.map.len() >= self.capacity {
            self.evict_lru();
            true
        } else {
            false
        };

        let idx = self.allocate_node();
        self.nodes[idx] = Some(LruNode {
            key: key.clone(),
            value,
            prev: None,
            next: self.head,
        });

        if let Some(head_idx) = self.head {
            if let Some(ref mut head_node) = self.nodes[head_idx] {
                head_node.prev = Some(idx);
            }
        }

        self.head = Some(idx);
        if self.tail.is_none() {
            self.tail = Some(idx);
        }

        self.map.insert(key, idx);
        evicted
    }

    fn remove(&mut self, key: &K) -> Option<V> {
        if let Some(idx) = self.map.remove(key) {
            let value = self.unlink_node(idx);
            self.free_list.push(idx);
            value
        } else {
            None
        }
    }

    fn len(&self) -> usize {
        self.map.len()
    }

    fn allocate_node(&mut self) -> usize {
        if let Some(idx) = self.free_list.pop() {
            idx
        } else {
            let idx = self.nodes.len();
            self.nodes.push(None);
            idx
        }
    }

    fn move_to_front(&mut self, idx: usize) {
        if self.head == Some(idx) {
            return;
        }

        let (prev, next) = {
            let node = self.nodes[idx].as_ref().unwrap();
            (node.prev, node.next)
        };

        if let Some(prev_idx) = prev {
            if let Some(ref mut prev_node) = self.nodes[prev_idx] {
                prev_node.next = next;
            }
        }

        if let Some(next_idx) = next {
            if let Some(ref mut next_node) = self.nodes[next_idx] {
                next_node.prev = prev;
            }
        }

        if self.tail == Some(idx) {
            self.tail = prev;
        }

        if let Some(ref mut node) = self.nodes[idx] {
            node.prev = None;
            node.next = self.head;
        }

        if let Some(head_idx) = self.head {
            if let Some(ref mut head_node) = self.nodes[head_idx] {
                head_node.prev = Some(idx);
            }
        }

        self.head = Some(idx);
    }

    fn evict_lru(&mut self) {
        if let Some(tail_idx) = self.tail {
            let key = self.nodes[tail_idx].as_ref().unwrap().key.clone();
            self.map.remove(&key);
            self.unlink_node(tail_idx);
            self.free_list.push(tail_idx);
        }
    }

    fn unlink_node(&mut self, idx: usize) -> Option<V> {
        let (prev, next, value) = {
            let node = self.nodes[idx].take()?;
            (node.prev, node.next, node.value)
        };

        if let Some(prev_idx) = prev {
            if let Some(ref mut prev_node) = self.nodes[prev_idx] {
                prev_node.next = next;
            }
        } else {
            self.head = next;
        }

        if let Some(next_idx) = next {
            if let Some(ref mut next_node) = self.nodes[next_idx] {
                next_node.prev = prev;
            }
        } else {
            self.tail = prev;
        }

        Some(value)
    }
}

/// Number of shards for the cache.
const NUM_SHARDS: usize = 16;

/// A sharded LRU cache for concurrent access.
///
/// The cache is divided into shards to reduce lock contention; capacity is
/// divided among them.
pub struct LruCache<K, V> {
    shards: Vec<Mutex<LruShard<K, V>>>,
    stats: Arc<CacheStats>,
}

impl<K: Hash + Eq + Clone, V: Clone> LruCache<K, V> {
    /// Create a new cache with the given capacity.
    pub fn new(capacity: usize) -> Self {
        let shard_capacity = capacity.div_ceil(NUM_SHARDS);
        let shards = (0..NUM_SHARDS)
            .map(|_| Mutex::new(LruShard::new(shard_capacity)))
            .collect();

        Self {
            shards,
            stats: Arc::new(CacheStats::default()),
        }
    }

    /// Get a value from the cache.
    pub fn get(&self, key: &K) -> Option<V> {
        let shard_idx = self.shard_index(key);
        let mut shard = self.shards[shard_idx].lock();
        let result = shard.get(key);

        if result.is_some() {
            self.stats.hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.stats.misses.fetch_add(1, Ordering::Relaxed);
        }

        result
    }

    /// Insert a value into the cache.
    ///
    /// Returns true if an entry was evicted.
    pub fn insert(&self, key: K, value: V) -> bool {
        let shard_idx = self.shard_index(&key);
        let mut shard = self.shards[shard_idx].lock();
        let evicted = shard.insert(key, value);

        self.stats.inserts.fetch_add(1, Ordering::Relaxed);
        if evicted {
            self.stats.evictions.fetch_add(1, Ordering::Relaxed);
        }

        evicted
    }

    /// Get the value for `key`, initializing it with `init` on a miss.
    ///
    /// Concurrent callers missing on the same key block until the single
    /// in-flight `init` finishes, then share its value. If `init` fails,
    /// nothing is inserted and one of the waiters takes over the
    /// initialization.
    pub fn get_or_try_insert_with<F>(&self, key: K, init: F) -> Result<V>
    where
        F: FnOnce() -> Result<V>,
    {
        let shard_idx = self.shard_index(&key);
        let guard = loop {
            let mut shard = self.shards[shard_idx].lock();
            if let Some(v) = shard.get(&key) {
                self.stats.hits.fetch_add(1, Ordering::Relaxed);
                return Ok(v);
            }
            if let Some(pending) = shard.pending.get(&key) {
                let pending = Arc::clone(pending);
                drop(shard);
                pending.wait();
                continue;
            }
            let guard = Arc::new(InitGuard::new());
            shard.pending.insert(key.clone(), Arc::clone(&guard));
            break guard;
        };

        self.stats.misses.fetch_add(1, Ordering::Relaxed);
        let initialized = init();

        let mut shard = self.shards[shard_idx].lock();
        shard.pending.remove(&key);
        let result = match initialized {
            Ok(v) => {
                let evicted = shard.insert(key, v.clone());
                self.stats.inserts.fetch_add(1, Ordering::Relaxed);
                if evicted {
                    self.stats.evictions.fetch_add(1, Ordering::Relaxed);
                }
                Ok(v)
            }
            Err(e) => Err(e),
        };
        drop(shard);
        guard.finish();
        result
    }

    /// Remove a value from the cache, returning the cache's clone of it.
    pub fn remove(&self, key: &K) -> Option<V> {
        let shard_idx = self.shard_index(key);
        let mut shard = self.shards[shard_idx].lock();
        shard.remove(key)
    }

    /// Get the total number of entries across all shards.
    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.lock().len()).sum()
    }

    /// Check if the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Get cache statistics.
    pub fn stats(&self) -> Arc<CacheStats> {
        Arc::clone(&self.stats)
    }

    fn shard_index(&self, key: &K) -> usize {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        key.hash(&mut hasher);
        hasher.finish() as usize % NUM_SHARDS
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Barrier;

    #[test]
    fn test_lru_cache_basic() {
        let cache: LruCache<String, i32> = LruCache::new(10);

        cache.insert("a".to_string(), 1);
        cache.insert("b".to_string(), 2);

        assert_eq!(cache.get(&"a".to_string()), Some(1));
        assert_eq!(cache.get(&"b".to_string()), Some(2));
        assert_eq!(cache.get(&"c".to_string()), None);
    }

    #[test]
    fn test_lru_cache_update() {
        let cache: LruCache<String, i32> = LruCache::new(10);

        cache.insert("key".to_string(), 1);
        cache.insert("key".to_string(), 2);
        assert_eq!(cache.get(&"key".to_string()), Some(2));
    }

    #[test]
    fn test_lru_cache_remove() {
        let cache: LruCache<String, i32> = LruCache::new(10);

        cache.insert("key".to_string(), 1);
        assert_eq!(cache.remove(&"key".to_string()), Some(1));
        assert_eq!(cache.get(&"key".to_string()), None);
        assert_eq!(cache.remove(&"key".to_string()), None);
    }

    #[test]
    fn test_lru_shard_evicts_least_recently_used() {
        let mut shard: LruShard<i32, i32> = LruShard::new(3);

        shard.insert(1, 10);
        shard.insert(2, 20);
        shard.insert(3, 30);

        // Touch 1 so it is recently used.
        shard.get(&1);

        // Insert 4: 2 is the least recently used and goes.
        shard.insert(4, 40);

        assert_eq!(shard.get(&1), Some(10));
        assert_eq!(shard.get(&2), None);
        assert_eq!(shard.get(&3), Some(30));
        assert_eq!(shard.get(&4), Some(40));
    }

    #[test]
    fn test_get_or_try_insert_with_hit_skips_init() {
        let cache: LruCache<i32, i32> = LruCache::new(10);
        cache.insert(1, 10);

        let v = cache
            .get_or_try_insert_with(1, || panic!("init must not run on a hit"))
            .unwrap();
        assert_eq!(v, 10);
    }

    #[test]
    fn test_get_or_try_insert_with_failure_inserts_nothing() {
        let cache: LruCache<i32, i32> = LruCache::new(10);

        let err = cache
            .get_or_try_insert_with(1, || Err(Error::Io("boom".into())))
            .unwrap_err();
        assert!(matches!(err, Error::Io(_)));
        assert!(cache.is_empty());

        // A later call runs its own init.
        let v = cache.get_or_try_insert_with(1, || Ok(42)).unwrap();
        assert_eq!(v, 42);
    }

    #[test]
    fn test_concurrent_misses_single_init() {
        let cache: Arc<LruCache<i32, i32>> = Arc::new(LruCache::new(10));
        let inits = AtomicUsize::new(0);
        let barrier = Barrier::new(8);

        std::thread::scope(|s| {
            for _ in 0..8 {
                let cache = Arc::clone(&cache);
                let inits = &inits;
                let barrier = &barrier;
                s.spawn(move || {
                    barrier.wait();
                    let v = cache
                        .get_or_try_insert_with(7, || {
                            inits.fetch_add(1, Ordering::SeqCst);
                            // Hold the window open so the others pile up.
                            std::thread::sleep(std::time::Duration::from_millis(20));
                            Ok(700)
                        })
                        .unwrap();
                    assert_eq!(v, 700);
                });
            }
        });

        assert_eq!(inits.load(Ordering::SeqCst), 1);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_stats_counts() {
        let cache: LruCache<i32, i32> = LruCache::new(10);

        cache.get_or_try_insert_with(1, || Ok(1)).unwrap();
        cache.get_or_try_insert_with(1, || Ok(1)).unwrap();
        cache.get(&2);

        let stats = cache.stats();
        assert_eq!(stats.hits.load(Ordering::Relaxed), 1);
        assert_eq!(stats.misses.load(Ordering::Relaxed), 2);
        assert_eq!(stats.inserts.load(Ordering::Relaxed), 1);
        assert_eq!(stats.hit_rate(), 1.0 / 3.0);
    }

    #[test]
    fn test_eviction_drops_only_cache_clone() {
        let cache: LruCache<i32, Arc<String>> = LruCache::new(1);

        let first = cache
            .get_or_try_insert_with(1, || Ok(Arc::new("one".to_string())))
            .unwrap();

        // Fill well past capacity so every shard that sees key 1 again has
        // cycled; the clone we hold stays usable regardless.
        for k in 2..40 {
            cache
                .get_or_try_insert_with(k, || Ok(Arc::new(k.to_string())))
                .unwrap();
        }

        assert_eq!(first.as_str(), "one");
    }
}
