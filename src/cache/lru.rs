//! Size-bounded LRU cache for decoded part blocks.
//!
//! Values are shared as `Arc<V>`, so a block handed to a search stays valid
//! after it is evicted.

use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// A value that can be stored in a [`BlockCache`].
pub trait CacheEntry: Send + Sync {
    /// Approximate heap footprint of the value in bytes.
    fn size_bytes(&self) -> usize;
}

/// A unique identifier for a cached block.
///
/// Blocks are addressed by the part that owns them, the offset of the index
/// block they belong to, and a slot inside that index block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey {
    /// Process-unique part id
    pub part_id: u64,
    /// Offset of the index block in `index.bin`
    pub offset: u64,
    /// Position inside the index block
    pub slot: u32,
}

impl CacheKey {
    /// Create a new cache key
    pub fn new(part_id: u64, offset: u64, slot: u32) -> Self {
        Self { part_id, offset, slot }
    }
}

/// Statistics for cache performance monitoring.
#[derive(Debug, Clone, Default)]
pub struct CacheStats {
    /// Total number of cache lookups
    pub lookups: u64,
    /// Number of cache hits
    pub hits: u64,
    /// Number of cache misses
    pub misses: u64,
    /// Number of insertions
    pub insertions: u64,
    /// Number of evictions
    pub evictions: u64,
    /// Number of cached entries
    pub entries: u64,
    /// Bytes held by cached entries
    pub size_bytes: u64,
}

impl CacheStats {
    /// Calculate the cache hit rate (0.0 to 1.0)
    pub fn hit_rate(&self) -> f64 {
        if self.lookups == 0 {
            0.0
        } else {
            self.hits as f64 / self.lookups as f64
        }
    }
}

struct Slot<V> {
    value: Arc<V>,
    size: usize,
    tick: u64,
}

struct State<V> {
    entries: HashMap<CacheKey, Slot<V>>,
    /// Access tick to key; the smallest tick is the least recently used.
    order: BTreeMap<u64, CacheKey>,
    next_tick: u64,
    size: usize,
}

impl<V> State<V> {
    fn bump(&mut self, key: CacheKey) -> Option<Arc<V>> {
        let tick = self.next_tick;
        let slot = self.entries.get_mut(&key)?;
        self.order.remove(&slot.tick);
        slot.tick = tick;
        self.order.insert(tick, key);
        self.next_tick += 1;
        Some(slot.value.clone())
    }

    fn remove(&mut self, key: &CacheKey) -> bool {
        match self.entries.remove(key) {
            Some(slot) => {
                self.order.remove(&slot.tick);
                self.size -= slot.size;
                true
            }
            None => false,
        }
    }
}

/// Thread-safe LRU cache bounded by the total size of its values.
///
/// A capacity of 0 disables caching.
pub struct BlockCache<V> {
    capacity: usize,
    state: Mutex<State<V>>,
    lookups: AtomicU64,
    misses: AtomicU64,
    insertions: AtomicU64,
    evictions: AtomicU64,
}

impl<V> std::fmt::Debug for BlockCache<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockCache")
            .field("capacity", &self.capacity)
            .field("size", &self.size())
            .field("len", &self.len())
            .finish()
    }
}

impl<V: CacheEntry> BlockCache<V> {
    /// Create a new BlockCache holding at most `capacity` bytes.
    ///
    /// # Examples
    ///
    /// ```
    /// use mergeset::cache::BlockCache;
    /// use mergeset::part::InmemoryBlock;
    ///
    /// // Create a 8MB cache
    /// let cache: BlockCache<InmemoryBlock> = BlockCache::new(8 * 1024 * 1024);
    /// assert!(cache.is_empty());
    /// ```
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            state: Mutex::new(State {
                entries: HashMap::new(),
                order: BTreeMap::new(),
                next_tick: 0,
                size: 0,
            }),
            lookups: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            insertions: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    /// Get a block from the cache and mark it as recently used.
    pub fn get(&self, key: &CacheKey) -> Option<Arc<V>> {
        self.lookups.fetch_add(1, Ordering::Relaxed);
        let value = if self.capacity == 0 { None } else { self.state.lock().bump(*key) };
        if value.is_none() {
            self.misses.fetch_add(1, Ordering::Relaxed);
        }
        value
    }

    /// Insert a block, evicting least recently used blocks to make room.
    ///
    /// Values bigger than the whole capacity are not cached.
    pub fn insert(&self, key: CacheKey, value: Arc<V>) {
        let size = value.size_bytes();
        if self.capacity == 0 || size > self.capacity {
            return;
        }

        let mut state = self.state.lock();
        state.remove(&key);
        let mut evicted = 0;
        while state.size + size > self.capacity {
            let Some((_, lru)) = state.order.pop_first() else {
                break;
            };
            if let Some(slot) = state.entries.remove(&lru) {
                state.size -= slot.size;
                evicted += 1;
            }
        }
        let tick = state.next_tick;
        state.next_tick += 1;
        state.order.insert(tick, key);
        state.entries.insert(key, Slot { value, size, tick });
        state.size += size;
        drop(state);

        self.insertions.fetch_add(1, Ordering::Relaxed);
        if evicted > 0 {
            self.evictions.fetch_add(evicted, Ordering::Relaxed);
        }
    }

    /// Drops every block that belongs to `part_id`.
    pub fn remove_part(&self, part_id: u64) {
        let mut state = self.state.lock();
        let keys: Vec<CacheKey> =
            state.entries.keys().filter(|k| k.part_id == part_id).copied().collect();
        for key in &keys {
            state.remove(key);
        }
    }

    /// Get current cache statistics.
    pub fn stats(&self) -> CacheStats {
        let lookups = self.lookups.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let state = self.state.lock();
        CacheStats {
            lookups,
            hits: lookups.saturating_sub(misses),
            misses,
            insertions: self.insertions.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            entries: state.entries.len() as u64,
            size_bytes: state.size as u64,
        }
    }
}

impl<V> BlockCache<V> {
    /// Get the current size of cached data in bytes.
    pub fn size(&self) -> usize {
        self.state.lock().size
    }

    /// Get the number of entries in the cache.
    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    /// Check if the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq)]
    struct Blob(usize);

    impl CacheEntry for Blob {
        fn size_bytes(&self) -> usize {
            self.0
        }
    }

    fn blob(n: usize) -> Arc<Blob> {
        Arc::new(Blob(n))
    }

    #[test]
    fn test_cache_basic_operations() {
        let cache = BlockCache::new(1024);
        let key1 = CacheKey::new(1, 0, 0);

        assert!(cache.get(&key1).is_none());

        cache.insert(key1, blob(4));
        assert_eq!(cache.get(&key1).as_deref(), Some(&Blob(4)));

        let stats = cache.stats();
        assert_eq!(stats.lookups, 2);
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.insertions, 1);
        assert_eq!(stats.entries, 1);
        assert_eq!(stats.size_bytes, 4);
    }

    #[test]
    fn test_cache_lru_eviction() {
        let cache = BlockCache::new(12);
        let keys: Vec<_> = (1..=4).map(|i| CacheKey::new(i, 0, 0)).collect();

        for key in &keys[..3] {
            cache.insert(*key, blob(4));
        }
        assert_eq!(cache.len(), 3);
        assert_eq!(cache.size(), 12);

        cache.insert(keys[3], blob(4));
        assert_eq!(cache.len(), 3);
        assert!(cache.get(&keys[0]).is_none());
        assert!(cache.get(&keys[1]).is_some());
        assert!(cache.get(&keys[3]).is_some());
        assert_eq!(cache.stats().evictions, 1);
    }

    #[test]
    fn test_cache_get_updates_lru() {
        let cache = BlockCache::new(12);
        let keys: Vec<_> = (1..=4).map(|i| CacheKey::new(i, 0, 0)).collect();
        for key in &keys[..3] {
            cache.insert(*key, blob(4));
        }

        assert!(cache.get(&keys[0]).is_some());
        cache.insert(keys[3], blob(4));

        assert!(cache.get(&keys[0]).is_some());
        assert!(cache.get(&keys[1]).is_none());
        assert!(cache.get(&keys[2]).is_some());
    }

    #[test]
    fn test_cache_update_existing_key() {
        let cache = BlockCache::new(1024);
        let key = CacheKey::new(1, 0, 0);

        cache.insert(key, blob(4));
        cache.insert(key, blob(5));
        assert_eq!(cache.get(&key).as_deref(), Some(&Blob(5)));
        assert_eq!(cache.size(), 5);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_remove_part() {
        let cache = BlockCache::new(1024);
        cache.insert(CacheKey::new(1, 0, 0), blob(4));
        cache.insert(CacheKey::new(1, 64, 3), blob(4));
        cache.insert(CacheKey::new(2, 0, 0), blob(4));

        cache.remove_part(1);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.size(), 4);
        assert!(cache.get(&CacheKey::new(2, 0, 0)).is_some());
    }

    #[test]
    fn test_cache_disabled_when_capacity_zero() {
        let cache = BlockCache::new(0);
        let key = CacheKey::new(1, 0, 0);
        cache.insert(key, blob(4));
        assert!(cache.get(&key).is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_cache_large_value_not_cached() {
        let cache = BlockCache::new(10);
        let key = CacheKey::new(1, 0, 0);
        cache.insert(key, blob(100));
        assert!(cache.get(&key).is_none());
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn test_evicted_value_stays_valid() {
        let cache = BlockCache::new(4);
        let key = CacheKey::new(1, 0, 0);
        cache.insert(key, blob(4));
        let held = cache.get(&key).unwrap();
        cache.insert(CacheKey::new(2, 0, 0), blob(4));
        assert!(cache.get(&key).is_none());
        assert_eq!(*held, Blob(4));
    }

    #[test]
    fn test_cache_concurrent_access() {
        let cache = Arc::new(BlockCache::new(64 * 1024));
        let handles: Vec<_> = (0..4u64)
            .map(|t| {
                let cache = Arc::clone(&cache);
                std::thread::spawn(move || {
                    for i in 0..500u64 {
                        let key = CacheKey::new(t, i, 0);
                        cache.insert(key, blob(16));
                        cache.get(&key);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert!(cache.size() <= 64 * 1024);
        assert_eq!(cache.stats().lookups, 2000);
    }
}
