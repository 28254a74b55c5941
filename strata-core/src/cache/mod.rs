//! Decode cache
//!
//! A process-wide, weight-bounded cache of fully decoded sample files keyed
//! by `(label, file name)`. Each file unit talks to it through a
//! [`FileCache`] handle bound to its own key.
//!
//! After `invalidate(key)` returns, `get(key)` yields `None` until the next
//! `put(key, ..)`.

use crate::Sample;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

/// Fully decoded contents of one file
pub type Decoded = Arc<[Sample]>;

/// Cache key: encoded label plus file name
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey {
    pub label: String,
    pub file: String,
}

impl CacheKey {
    pub fn new(label: impl Into<String>, file: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            file: file.into(),
        }
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.label, self.file)
    }
}

/// Shared decode cache
pub trait DecodeCache: Send + Sync {
    fn get(&self, key: &CacheKey) -> Option<Decoded>;

    fn put(&self, key: CacheKey, samples: Decoded);

    fn invalidate(&self, key: &CacheKey);

    /// Drop every entry
    fn clear(&self);

    /// Total weight currently held, in records
    fn weight(&self) -> usize;
}

/// Cache that never holds anything, for low-memory deployments
#[derive(Debug, Default)]
pub struct NoopCache;

impl DecodeCache for NoopCache {
    fn get(&self, _key: &CacheKey) -> Option<Decoded> {
        None
    }

    fn put(&self, _key: CacheKey, _samples: Decoded) {}

    fn invalidate(&self, _key: &CacheKey) {}

    fn clear(&self) {}

    fn weight(&self) -> usize {
        0
    }
}

struct Entry {
    samples: Decoded,
    tick: u64,
}

#[derive(Default)]
struct LruState {
    entries: HashMap<CacheKey, Entry>,
    /// Access tick -> key, oldest first
    order: BTreeMap<u64, CacheKey>,
    weight: usize,
    next_tick: u64,
}

impl LruState {
    fn touch(&mut self) -> u64 {
        self.next_tick += 1;
        self.next_tick
    }

    fn remove(&mut self, key: &CacheKey) {
        if let Some(entry) = self.entries.remove(key) {
            self.order.remove(&entry.tick);
            self.weight -= entry.samples.len();
        }
    }

    fn evict_oldest(&mut self) -> bool {
        let Some((_, key)) = self.order.pop_first() else {
            return false;
        };
        if let Some(entry) = self.entries.remove(&key) {
            self.weight -= entry.samples.len();
        }
        true
    }
}

/// Least-recently-used cache bounded by total record count
pub struct LruDecodeCache {
    capacity: usize,
    state: Mutex<LruState>,
}

impl LruDecodeCache {
    /// Create a cache holding at most `capacity` records
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            state: Mutex::new(LruState::default()),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of cached files
    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for LruDecodeCache {
    fn default() -> Self {
        Self::new(crate::config::DEFAULT_CACHE_CAPACITY)
    }
}

impl fmt::Debug for LruDecodeCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("LruDecodeCache")
            .field("capacity", &self.capacity)
            .field("entries", &state.entries.len())
            .field("weight", &state.weight)
            .finish()
    }
}

impl DecodeCache for LruDecodeCache {
    fn get(&self, key: &CacheKey) -> Option<Decoded> {
        let mut state = self.state.lock();
        let tick = state.touch();
        let entry = state.entries.get_mut(key)?;
        let old = std::mem::replace(&mut entry.tick, tick);
        let samples = entry.samples.clone();
        state.order.remove(&old);
        state.order.insert(tick, key.clone());
        Some(samples)
    }

    fn put(&self, key: CacheKey, samples: Decoded) {
        let mut state = self.state.lock();
        state.remove(&key);
        let size = samples.len();
        if size > self.capacity {
            return;
        }
        while state.weight + size > self.capacity {
            if !state.evict_oldest() {
                break;
            }
        }
        let tick = state.touch();
        state.order.insert(tick, key.clone());
        state.weight += size;
        state.entries.insert(key, Entry { samples, tick });
    }

    fn invalidate(&self, key: &CacheKey) {
        self.state.lock().remove(key);
    }

    fn clear(&self) {
        let mut state = self.state.lock();
        state.entries.clear();
        state.order.clear();
        state.weight = 0;
    }

    fn weight(&self) -> usize {
        self.state.lock().weight
    }
}

/// A file unit's view of the shared cache
#[derive(Clone)]
pub struct FileCache {
    key: CacheKey,
    backing: Arc<dyn DecodeCache>,
}

impl FileCache {
    pub fn new(key: CacheKey, backing: Arc<dyn DecodeCache>) -> Self {
        Self { key, backing }
    }

    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    pub fn get(&self) -> Option<Decoded> {
        self.backing.get(&self.key)
    }

    pub fn put(&self, samples: Decoded) {
        self.backing.put(self.key.clone(), samples);
    }

    pub fn invalidate(&self) {
        self.backing.invalidate(&self.key);
    }
}

impl fmt::Debug for FileCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileCache").field("key", &self.key).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn samples(n: usize) -> Decoded {
        (0..n).map(|i| Sample::good(i as i64, i as f64)).collect()
    }

    fn key(file: &str) -> CacheKey {
        CacheKey::new("label", file)
    }

    #[test]
    fn test_put_get_invalidate() {
        let cache = LruDecodeCache::new(100);
        assert!(cache.get(&key("a")).is_none());

        cache.put(key("a"), samples(10));
        assert_eq!(cache.get(&key("a")).unwrap().len(), 10);
        assert_eq!(cache.weight(), 10);

        cache.invalidate(&key("a"));
        assert!(cache.get(&key("a")).is_none());
        assert_eq!(cache.weight(), 0);
    }

    #[test]
    fn test_replace_updates_weight() {
        let cache = LruDecodeCache::new(100);
        cache.put(key("a"), samples(10));
        cache.put(key("a"), samples(30));
        assert_eq!(cache.weight(), 30);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_lru_eviction() {
        let cache = LruDecodeCache::new(25);
        cache.put(key("a"), samples(10));
        cache.put(key("b"), samples(10));
        // touch a so b becomes the oldest
        assert!(cache.get(&key("a")).is_some());
        cache.put(key("c"), samples(10));

        assert!(cache.get(&key("a")).is_some());
        assert!(cache.get(&key("b")).is_none());
        assert!(cache.get(&key("c")).is_some());
        assert_eq!(cache.weight(), 20);
    }

    #[test]
    fn test_oversized_entry_not_cached() {
        let cache = LruDecodeCache::new(5);
        cache.put(key("small"), samples(3));
        cache.put(key("big"), samples(6));
        assert!(cache.get(&key("big")).is_none());
        assert!(cache.get(&key("small")).is_some());
    }

    #[test]
    fn test_clear() {
        let cache = LruDecodeCache::new(100);
        cache.put(key("a"), samples(1));
        cache.put(key("b"), samples(2));
        cache.clear();
        assert!(cache.is_empty());
        assert_eq!(cache.weight(), 0);
    }

    #[test]
    fn test_noop_cache() {
        let cache = NoopCache;
        cache.put(key("a"), samples(3));
        assert!(cache.get(&key("a")).is_none());
        assert_eq!(cache.weight(), 0);
    }

    #[test]
    fn test_file_cache_handle() {
        let shared: Arc<dyn DecodeCache> = Arc::new(LruDecodeCache::new(100));
        let first = FileCache::new(key("c1.slots"), shared.clone());
        let second = FileCache::new(key("c1.slots"), shared.clone());

        first.put(samples(4));
        assert_eq!(second.get().unwrap().len(), 4);
        second.invalidate();
        assert!(first.get().is_none());
    }

    #[test]
    fn test_concurrent_access() {
        let cache = Arc::new(LruDecodeCache::new(1_000));
        let handles: Vec<_> = (0..4)
            .map(|t| {
                let cache = cache.clone();
                thread::spawn(move || {
                    for i in 0..200 {
                        let k = key(&format!("f{}", (t * 7 + i) % 16));
                        cache.put(k.clone(), samples(i % 50));
                        cache.get(&k);
                        if i % 3 == 0 {
                            cache.invalidate(&k);
                        }
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert!(cache.weight() <= 1_000);
    }
}
