//! Point-in-time table statistics.

use std::sync::atomic::{AtomicU64, Ordering};

/// Counters updated by the table as it runs.
#[derive(Debug, Default)]
pub(crate) struct Counters {
    pub active_merges: AtomicU64,
    pub merges_count: AtomicU64,
    pub items_merged: AtomicU64,
    pub assisted_merges: AtomicU64,
    pub items_added: AtomicU64,
    pub items_added_size_bytes: AtomicU64,
}

/// Decrements `active_merges` when dropped.
pub(crate) struct ActiveMerge<'a>(&'a Counters);

impl Counters {
    pub(crate) fn start_merge(&self) -> ActiveMerge<'_> {
        self.active_merges.fetch_add(1, Ordering::Relaxed);
        self.merges_count.fetch_add(1, Ordering::Relaxed);
        ActiveMerge(self)
    }
}

impl Drop for ActiveMerge<'_> {
    fn drop(&mut self) {
        self.0.active_merges.fetch_sub(1, Ordering::Relaxed);
    }
}

/// A snapshot of table metrics returned by [`Table::metrics`](crate::Table::metrics).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TableMetrics {
    /// Merges running right now.
    pub active_merges: u64,
    /// Merges started since the table was opened.
    pub merges_count: u64,
    /// Items written by merges.
    pub items_merged: u64,
    /// Merges performed by ingesting threads because there were too many parts.
    pub assisted_merges: u64,

    /// Items passed to `add_items`.
    pub items_added: u64,
    /// Total size of the items passed to `add_items`.
    pub items_added_size_bytes: u64,
    /// Items added but not yet searchable.
    pub pending_items: u64,

    /// Number of live parts.
    pub parts_count: u64,
    /// Blocks across live parts.
    pub blocks_count: u64,
    /// Items across live parts.
    pub items_count: u64,
    /// On-disk size of live parts.
    pub size_bytes: u64,
    /// References held to live parts, including open searches.
    pub parts_refcount: u64,

    /// Entries in the index block cache.
    pub index_blocks_cache_size: u64,
    /// Bytes held by the index block cache.
    pub index_blocks_cache_size_bytes: u64,
    /// Index block cache lookups.
    pub index_blocks_cache_requests: u64,
    /// Index block cache lookups that missed.
    pub index_blocks_cache_misses: u64,

    /// Entries in the data block cache.
    pub data_blocks_cache_size: u64,
    /// Bytes held by the data block cache.
    pub data_blocks_cache_size_bytes: u64,
    /// Data block cache lookups.
    pub data_blocks_cache_requests: u64,
    /// Data block cache lookups that missed.
    pub data_blocks_cache_misses: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_active_merge_guard() {
        let c = Counters::default();
        {
            let _a = c.start_merge();
            let _b = c.start_merge();
            assert_eq!(c.active_merges.load(Ordering::Relaxed), 2);
        }
        assert_eq!(c.active_merges.load(Ordering::Relaxed), 0);
        assert_eq!(c.merges_count.load(Ordering::Relaxed), 2);
    }
}
