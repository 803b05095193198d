//! Bounded get-or-compute cache
//!
//! Least-recently-used entries are evicted once `capacity` is reached. A
//! capacity of zero disables caching entirely (every lookup computes).

use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::hash::Hash;

#[derive(Debug)]
struct CacheInner<K, V> {
    entries: HashMap<K, (V, u64)>,
    recency: BTreeMap<u64, K>,
    tick: u64,
    hits: u64,
    misses: u64,
}

/// Thread-safe cache with an explicit size bound
#[derive(Debug)]
pub struct BoundedCache<K, V> {
    capacity: usize,
    inner: Mutex<CacheInner<K, V>>,
}

/// Hit/miss counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CacheStats {
    /// Lookups served from the cache
    pub hits: u64,
    /// Lookups that had to compute
    pub misses: u64,
}

impl<K, V> BoundedCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    /// Create a cache holding at most `capacity` entries
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            inner: Mutex::new(CacheInner {
                entries: HashMap::new(),
                recency: BTreeMap::new(),
                tick: 0,
                hits: 0,
                misses: 0,
            }),
        }
    }

    /// Maximum number of entries
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Return the cached value or compute, cache, and return it
    ///
    /// `compute` runs outside the lock; a failed computation is not cached.
    pub fn get_or_try_insert_with<E>(
        &self,
        key: &K,
        compute: impl FnOnce() -> Result<V, E>,
    ) -> Result<V, E> {
        if let Some(value) = self.get(key) {
            return Ok(value);
        }

        self.inner.lock().misses += 1;
        let value = compute()?;
        self.insert(key.clone(), value.clone());
        Ok(value)
    }

    /// Look up a value, marking it most recently used
    pub fn get(&self, key: &K) -> Option<V> {
        let mut inner = self.inner.lock();
        inner.tick += 1;
        let tick = inner.tick;

        let (value, old_tick) = match inner.entries.get_mut(key) {
            Some((value, last_used)) => {
                let old = *last_used;
                *last_used = tick;
                (value.clone(), old)
            }
            None => return None,
        };
        inner.recency.remove(&old_tick);
        inner.recency.insert(tick, key.clone());
        inner.hits += 1;
        Some(value)
    }

    /// Insert a value, evicting the least recently used entry if full
    pub fn insert(&self, key: K, value: V) {
        if self.capacity == 0 {
            return;
        }

        let mut inner = self.inner.lock();
        inner.tick += 1;
        let tick = inner.tick;

        if let Some((_, old_tick)) = inner.entries.insert(key.clone(), (value, tick)) {
            inner.recency.remove(&old_tick);
        }
        inner.recency.insert(tick, key);

        while inner.entries.len() > self.capacity {
            let Some((_, oldest)) = inner.recency.pop_first() else {
                break;
            };
            inner.entries.remove(&oldest);
        }
    }

    /// Whether `key` is cached (does not affect recency)
    pub fn contains(&self, key: &K) -> bool {
        self.inner.lock().entries.contains_key(key)
    }

    /// Number of cached entries
    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    /// Whether the cache is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every entry
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.entries.clear();
        inner.recency.clear();
    }

    /// Hit/miss counters
    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.lock();
        CacheStats {
            hits: inner.hits,
            misses: inner.misses,
        }
    }
}
