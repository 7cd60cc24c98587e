//! Caches for decoded index blocks and data blocks.
//!
//! Tables may share one [`BlockCaches`] so that several tables in a process
//! compete for the same memory budget.

mod lru;

pub use lru::{BlockCache, CacheEntry, CacheKey, CacheStats};

use crate::part::{IndexBlock, InmemoryBlock};
use std::sync::atomic::{AtomicU64, Ordering};

impl CacheEntry for InmemoryBlock {
    fn size_bytes(&self) -> usize {
        InmemoryBlock::size_bytes(self)
    }
}

impl CacheEntry for IndexBlock {
    fn size_bytes(&self) -> usize {
        IndexBlock::size_bytes(self)
    }
}

/// The index block cache and the data block cache used by part searches.
#[derive(Debug)]
pub struct BlockCaches {
    /// Decoded block headers, keyed by index block.
    pub index: BlockCache<IndexBlock>,
    /// Decoded data blocks.
    pub data: BlockCache<InmemoryBlock>,
    next_part_id: AtomicU64,
}

impl BlockCaches {
    /// Creates caches bounded by the given sizes in bytes.
    pub fn new(index_size: usize, data_size: usize) -> Self {
        Self {
            index: BlockCache::new(index_size),
            data: BlockCache::new(data_size),
            next_part_id: AtomicU64::new(1),
        }
    }

    /// Allocates an id unique among parts using these caches.
    pub(crate) fn next_part_id(&self) -> u64 {
        self.next_part_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Evicts every block of a part that is going away.
    pub(crate) fn remove_part(&self, part_id: u64) {
        self.index.remove_part(part_id);
        self.data.remove_part(part_id);
    }
}
