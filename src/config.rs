//! Configuration options for the mergeset storage engine.

use crate::cache::BlockCaches;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Upper bound for the default number of merge workers.
pub const MAX_DEFAULT_MERGE_WORKERS: usize = 16;

/// Configuration options for opening a table.
#[derive(Debug, Clone)]
pub struct Options {
    /// Create the table directory if it doesn't exist.
    /// Default: true
    pub create_if_missing: bool,

    /// Interval after which pending items become visible to searches.
    /// Default: 1s
    pub flush_interval: Duration,

    /// Number of pending in-memory blocks that triggers a hand-off to the
    /// flush path.
    /// Default: 1024
    pub max_pending_blocks: usize,

    /// Number of background merge workers.
    /// Default: available parallelism, capped at 16
    pub merge_workers: usize,

    /// Part count above which ingestion helps with merging.
    /// Default: 512
    pub max_parts: usize,

    /// Idle time after which a final merge pass runs.
    /// Set to zero to disable final merges.
    /// Default: 30s
    pub final_merge_delay: Duration,

    /// Merge outputs with more items than this bypass the OS page cache.
    /// Default: 8M items
    pub max_cached_part_items: u64,

    /// Compression codec for newly written parts.
    /// Default: CompressionType::Zstd
    pub compression: CompressionType,

    /// Index block cache size (in bytes), used when `caches` is unset.
    /// Default: 32MB
    pub index_block_cache_size: usize,

    /// Data block cache size (in bytes), used when `caches` is unset.
    /// Default: 128MB
    pub data_block_cache_size: usize,

    /// Free disk space below which the table switches to read-only mode.
    /// In read-only mode new items are rejected and merges are paused.
    /// Set to zero to disable the check.
    /// Default: 10MB
    pub min_free_disk_space: u64,

    /// Caches shared with other tables.
    /// Default: None (the table creates its own)
    pub caches: Option<Arc<BlockCaches>>,

    /// Hook applied to every block produced by a merge.
    /// Default: None
    pub prepare_block: Option<PrepareBlock>,

    /// Called after pending items become searchable.
    /// Default: None
    pub flush_callback: Option<FlushCallback>,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            create_if_missing: true,
            flush_interval: Duration::from_secs(1),
            max_pending_blocks: 1024,
            merge_workers: default_merge_workers(),
            max_parts: 512,
            final_merge_delay: Duration::from_secs(30),
            max_cached_part_items: 8 * 1024 * 1024,
            compression: CompressionType::Zstd,
            index_block_cache_size: 32 * 1024 * 1024, // 32MB
            data_block_cache_size: 128 * 1024 * 1024, // 128MB
            min_free_disk_space: 10 * 1024 * 1024, // 10MB
            caches: None,
            prepare_block: None,
            flush_callback: None,
        }
    }
}

fn default_merge_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
        .clamp(1, MAX_DEFAULT_MERGE_WORKERS)
}

/// Compression algorithms supported by mergeset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum CompressionType {
    /// No compression.
    None = 0,

    /// Snappy compression (fast, ignores the compression level).
    #[cfg(feature = "snappy")]
    Snappy = 1,

    /// Zstandard compression with a level picked per merge.
    #[default]
    Zstd = 2,
}

impl CompressionType {
    /// Convert from u8
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(CompressionType::None),
            #[cfg(feature = "snappy")]
            1 => Some(CompressionType::Snappy),
            2 => Some(CompressionType::Zstd),
            _ => None,
        }
    }
}

/// Callback applied to each merged output block.
///
/// It receives the sorted items of the block and returns the items to store
/// instead. The result must be sorted and must stay within the first and last
/// item of the input.
#[derive(Clone)]
pub struct PrepareBlock(Arc<dyn Fn(Vec<Vec<u8>>) -> Vec<Vec<u8>> + Send + Sync>);

impl PrepareBlock {
    /// Wraps a closure as a prepare-block hook.
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(Vec<Vec<u8>>) -> Vec<Vec<u8>> + Send + Sync + 'static,
    {
        Self(Arc::new(f))
    }

    pub(crate) fn apply(&self, items: Vec<Vec<u8>>) -> Vec<Vec<u8>> {
        (self.0)(items)
    }
}

impl fmt::Debug for PrepareBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PrepareBlock(..)")
    }
}

/// Callback invoked when freshly added items become searchable.
#[derive(Clone)]
pub struct FlushCallback(Arc<dyn Fn() + Send + Sync>);

impl FlushCallback {
    /// Wraps a closure as a flush callback.
    pub fn new<F>(f: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        Self(Arc::new(f))
    }

    pub(crate) fn call(&self) {
        (self.0)()
    }
}

impl fmt::Debug for FlushCallback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("FlushCallback(..)")
    }
}

impl Options {
    /// Creates a new Options with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets whether to create the table if it doesn't exist.
    pub fn create_if_missing(mut self, value: bool) -> Self {
        self.create_if_missing = value;
        self
    }

    /// Sets the pending items flush interval.
    pub fn flush_interval(mut self, interval: Duration) -> Self {
        self.flush_interval = interval;
        self
    }

    /// Sets the number of pending blocks that triggers a flush.
    pub fn max_pending_blocks(mut self, n: usize) -> Self {
        self.max_pending_blocks = n;
        self
    }

    /// Sets the number of background merge workers.
    pub fn merge_workers(mut self, n: usize) -> Self {
        self.merge_workers = n;
        self
    }

    /// Sets the part count that triggers assisted merges.
    pub fn max_parts(mut self, n: usize) -> Self {
        self.max_parts = n;
        self
    }

    /// Sets the idle delay before a final merge.
    pub fn final_merge_delay(mut self, delay: Duration) -> Self {
        self.final_merge_delay = delay;
        self
    }

    /// Sets the item count above which merge outputs bypass the page cache.
    pub fn max_cached_part_items(mut self, n: u64) -> Self {
        self.max_cached_part_items = n;
        self
    }

    /// Sets the compression algorithm.
    pub fn compression(mut self, compression: CompressionType) -> Self {
        self.compression = compression;
        self
    }

    /// Sets the index block cache size.
    pub fn index_block_cache_size(mut self, size: usize) -> Self {
        self.index_block_cache_size = size;
        self
    }

    /// Sets the data block cache size.
    pub fn data_block_cache_size(mut self, size: usize) -> Self {
        self.data_block_cache_size = size;
        self
    }

    /// Sets the free disk space below which the table becomes read-only.
    pub fn min_free_disk_space(mut self, bytes: u64) -> Self {
        self.min_free_disk_space = bytes;
        self
    }

    /// Shares the given caches with the table.
    pub fn caches(mut self, caches: Arc<BlockCaches>) -> Self {
        self.caches = Some(caches);
        self
    }

    /// Sets the prepare-block hook.
    pub fn prepare_block(mut self, hook: PrepareBlock) -> Self {
        self.prepare_block = Some(hook);
        self
    }

    /// Sets the flush callback.
    pub fn flush_callback(mut self, callback: FlushCallback) -> Self {
        self.flush_callback = Some(callback);
        self
    }

    /// Validates the options and returns an error if any are invalid.
    pub fn validate(&self) -> crate::Result<()> {
        if self.merge_workers == 0 {
            return Err(crate::Error::invalid_argument("merge_workers must be > 0"));
        }
        if self.flush_interval.is_zero() {
            return Err(crate::Error::invalid_argument("flush_interval must be > 0"));
        }
        if self.max_pending_blocks == 0 {
            return Err(crate::Error::invalid_argument("max_pending_blocks must be > 0"));
        }
        if self.max_parts < 2 {
            return Err(crate::Error::invalid_argument("max_parts must be >= 2"));
        }
        Ok(())
    }
}
