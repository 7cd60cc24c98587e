//! The mergeset table: a directory of immutable sorted parts.
//!
//! Added items are buffered in memory and periodically flushed into new
//! parts. Background workers merge small parts into bigger ones. Every part
//! replacement goes through a transaction file, so a crash at any point
//! leaves a table that reopens to a consistent set of parts.
//!
//! Directory layout:
//!
//! ```text
//! <table>/
//!     flock.lock          exclusive lock held while the table is open
//!     converted.flag      written once existing parts went through prepare_block
//!     txn/                pending transactions
//!     tmp/                merge outputs not yet renamed into place
//!     0000000000000001/   part directories, named by merge index
//!     ...
//! ```

mod metrics;
mod picker;
mod raw_items;
mod search;
mod tasks;
mod txn;

pub use metrics::TableMetrics;
pub use search::TableSearch;

use crate::cache::BlockCaches;
use crate::config::Options;
use crate::encoding::compress_level_for_items;
use crate::error::{Error, Result};
use crate::fs::{self, FileLock};
use crate::merge::{merge_block_streams, StopSignal};
use crate::part::{
    BlockStreamReader, BlockStreamWriter, InmemoryBlock, InmemoryPart, Part, PartHeader,
    MAX_INMEMORY_BLOCK_SIZE,
};
use crossbeam::channel::{self, Sender};
use crossbeam::select;
use metrics::Counters;
use parking_lot::{Mutex, RwLock};
use picker::{PartWrapper, DEFAULT_PARTS_TO_MERGE};
use raw_items::RawItems;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tasks::TaskGroup;
use txn::{Transaction, TXN_DIRNAME};

const TMP_DIRNAME: &str = "tmp";
const SNAPSHOTS_DIRNAME: &str = "snapshots";
const LOCK_FILENAME: &str = "flock.lock";
const CONVERTED_FILENAME: &str = "converted.flag";

/// Raw blocks merged into one in-memory part while flushing.
const BLOCKS_PER_INMEMORY_PART: usize = DEFAULT_PARTS_TO_MERGE;

const MIN_MERGE_BACKOFF: Duration = Duration::from_millis(1);
const MAX_MERGE_BACKOFF: Duration = Duration::from_secs(1);

/// Expected compressed size of an item, used to bound merge outputs by the
/// free disk space.
const BYTES_PER_ITEM: u64 = 4;

/// A sorted, deduplication-free collection of byte strings stored on disk.
///
/// `Table` is safe to share between threads behind an `Arc`. Items become
/// visible to [`search`](Self::search) within
/// [`Options::flush_interval`] after [`add_items`](Self::add_items)
/// returns, or immediately after [`debug_flush`](Self::debug_flush).
///
/// # Example
///
/// ```rust,no_run
/// use mergeset::{Options, Table};
///
/// # fn main() -> Result<(), mergeset::Error> {
/// let table = Table::open("./index", Options::default())?;
/// table.add_items(&["3:1", "1:2", "2:3"])?;
/// table.debug_flush()?;
///
/// let mut ts = table.search();
/// ts.seek(b"2")?;
/// assert!(ts.next_item()?);
/// assert_eq!(ts.item(), b"2:3");
/// table.close()?;
/// # Ok(())
/// # }
/// ```
pub struct Table {
    inner: Arc<TableInner>,

    /// Dropping the sender trips the stop signal of every background task.
    stop_tx: Option<Sender<()>>,
    flusher: Option<JoinHandle<()>>,
    converter: Option<JoinHandle<()>>,
    workers: Vec<JoinHandle<()>>,

    flock: Option<FileLock>,
    closed: bool,
}

/// State shared between the table handle and its background tasks.
struct TableInner {
    path: PathBuf,
    options: Options,
    caches: Arc<BlockCaches>,

    parts: Mutex<Vec<Arc<PartWrapper>>>,
    raw_items: Mutex<RawItems>,

    /// Held for reading while a transaction is applied and for writing while
    /// a snapshot is taken.
    snapshot_lock: RwLock<()>,

    merge_idx: AtomicU64,
    stop: StopSignal,

    /// Set while free disk space is below `min_free_disk_space`.
    read_only: AtomicBool,

    /// Flushes handed off by `add_items`, plus the running periodic flush.
    flush_tasks: Arc<TaskGroup>,
    /// Deletions of replaced parts that hit transient errors.
    removal_tasks: Arc<TaskGroup>,

    counters: Counters,
}

impl std::fmt::Debug for Table {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Table")
            .field("path", &self.inner.path)
            .field("parts", &self.inner.parts.lock().len())
            .field("closed", &self.closed)
            .finish()
    }
}

impl Table {
    /// Opens the table at `path`, creating it if allowed by `options`.
    ///
    /// Transactions left by a previous process are applied before the parts
    /// are loaded.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The directory doesn't exist and `create_if_missing` is false
    /// - Another process or table holds the directory lock
    /// - A transaction or a part can't be read
    pub fn open<P: AsRef<Path>>(path: P, options: Options) -> Result<Self> {
        options.validate()?;
        let start = Instant::now();
        let path = path.as_ref();

        if !path.exists() {
            if !options.create_if_missing {
                return Err(Error::not_found(format!(
                    "table directory does not exist: {}",
                    path.display()
                )));
            }
            std::fs::create_dir_all(path).map_err(|e| Error::io_at(e, "create", path))?;
        }
        let path = path.canonicalize().map_err(|e| Error::io_at(e, "resolve", path))?;

        let lock_path = path.join(LOCK_FILENAME);
        let flock = FileLock::lock(&lock_path).map_err(|e| Error::io_at(e, "lock", &lock_path))?;

        fs::remove_temporary_entries(&path).map_err(|e| Error::io_at(e, "clean up", &path))?;
        let txn_dir = path.join(TXN_DIRNAME);
        fs::mkdir_if_not_exist(&txn_dir).map_err(|e| Error::io_at(e, "create", &txn_dir))?;
        fs::remove_temporary_entries(&txn_dir).map_err(|e| Error::io_at(e, "clean up", &txn_dir))?;

        let removal_tasks = TaskGroup::new();
        let replayed = txn::run_transactions(&path, &removal_tasks)?;
        if replayed > 0 {
            log::info!("applied {} pending transactions in {}", replayed, path.display());
        }

        // Merge outputs that never made it into a transaction.
        let tmp_dir = path.join(TMP_DIRNAME);
        if tmp_dir.exists() {
            fs::remove_dir_all_with_retry(&tmp_dir).map_err(|e| Error::io_at(e, "remove", &tmp_dir))?;
        }
        fs::mkdir_if_not_exist(&tmp_dir).map_err(|e| Error::io_at(e, "create", &tmp_dir))?;
        fs::sync_path(&path).map_err(|e| Error::io_at(e, "sync", &path))?;

        let caches = match &options.caches {
            Some(caches) => Arc::clone(caches),
            None => Arc::new(BlockCaches::new(
                options.index_block_cache_size,
                options.data_block_cache_size,
            )),
        };
        let (pws, max_idx) = open_parts(&path, &caches)?;

        let (stop_tx, stop_rx) = channel::bounded(0);
        let inner = Arc::new(TableInner {
            path,
            options,
            caches,
            parts: Mutex::new(pws),
            raw_items: Mutex::new(RawItems::new()),
            snapshot_lock: RwLock::new(()),
            merge_idx: AtomicU64::new(initial_merge_idx(max_idx)),
            stop: StopSignal::new(stop_rx),
            read_only: AtomicBool::new(false),
            flush_tasks: TaskGroup::new(),
            removal_tasks,
            counters: Counters::default(),
        });

        inner.update_read_only();

        let mut table = Table {
            inner: Arc::clone(&inner),
            stop_tx: Some(stop_tx),
            flusher: None,
            converter: None,
            workers: Vec::new(),
            flock: Some(flock),
            closed: false,
        };
        table.start_background_tasks()?;

        let m = table.metrics();
        log::info!(
            "opened table {} in {:?}: {} parts, {} items, {} bytes",
            inner.path.display(),
            start.elapsed(),
            m.parts_count,
            m.items_count,
            m.size_bytes
        );
        Ok(table)
    }

    fn start_background_tasks(&mut self) -> Result<()> {
        let spawn = |name: String, inner: Arc<TableInner>, f: fn(Arc<TableInner>)| {
            thread::Builder::new()
                .name(name)
                .spawn(move || f(inner))
                .map_err(|e| Error::internal(format!("cannot start background thread: {}", e)))
        };

        self.flusher = Some(spawn("mergeset-flusher".into(), Arc::clone(&self.inner), run_flusher)?);
        for i in 0..self.inner.options.merge_workers {
            let handle = spawn(format!("mergeset-merge-{}", i), Arc::clone(&self.inner), run_merge_worker)?;
            self.workers.push(handle);
        }
        if self.inner.options.prepare_block.is_some()
            && !self.inner.path.join(CONVERTED_FILENAME).exists()
        {
            self.converter =
                Some(spawn("mergeset-convert".into(), Arc::clone(&self.inner), run_conversion)?);
        }
        Ok(())
    }

    /// The table directory.
    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    /// Adds `items` to the table.
    ///
    /// Items are searchable after the next flush. Either all items are added
    /// or none is.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ItemTooLarge`] if any item exceeds
    /// [`MAX_INMEMORY_BLOCK_SIZE`] bytes, and [`Error::ReadOnly`] if the
    /// table is in read-only mode.
    pub fn add_items<I: AsRef<[u8]>>(&self, items: &[I]) -> Result<()> {
        if self.inner.is_read_only() {
            return Err(Error::read_only(format!(
                "cannot add items to {}: free disk space is below {} bytes",
                self.inner.path.display(),
                self.inner.options.min_free_disk_space
            )));
        }
        let items: Vec<&[u8]> = items.iter().map(|item| item.as_ref()).collect();
        if let Some(item) = items.iter().find(|item| item.len() > MAX_INMEMORY_BLOCK_SIZE) {
            return Err(Error::ItemTooLarge { len: item.len(), max: MAX_INMEMORY_BLOCK_SIZE });
        }
        let size: usize = items.iter().map(|item| item.len()).sum();
        self.inner.counters.items_added.fetch_add(items.len() as u64, Ordering::Relaxed);
        self.inner.counters.items_added_size_bytes.fetch_add(size as u64, Ordering::Relaxed);

        let full = self.inner.raw_items.lock().add_items(&items, self.inner.options.max_pending_blocks);
        let Some(blocks) = full else {
            return Ok(());
        };

        // Convert the blocks in the background so ingestion stays fast.
        let inner = Arc::clone(&self.inner);
        let blocks = Arc::new(Mutex::new(Some(blocks)));
        let task_blocks = Arc::clone(&blocks);
        let spawned = self.inner.flush_tasks.spawn("mergeset-flush", move || {
            if let Some(blocks) = task_blocks.lock().take() {
                if let Err(e) = inner.flush_raw_blocks(blocks) {
                    fatal("cannot flush pending items", &e);
                }
            }
        });
        if let Err(e) = spawned {
            log::warn!("cannot start a flush thread ({}); flushing synchronously", e);
            if let Some(blocks) = blocks.lock().take() {
                self.inner.flush_raw_blocks(blocks)?;
            }
        }
        Ok(())
    }

    /// Returns true while the table rejects new items because free disk
    /// space is low.
    ///
    /// The state is refreshed on every flush interval.
    pub fn is_read_only(&self) -> bool {
        self.inner.is_read_only()
    }

    /// Makes every item added so far searchable.
    ///
    /// Intended for tests and maintenance; the background flusher does this
    /// periodically.
    pub fn debug_flush(&self) -> Result<()> {
        self.inner.flush_pending(true)?;
        self.inner.flush_tasks.wait();
        Ok(())
    }

    /// Opens a search over the current parts.
    pub fn search(&self) -> TableSearch {
        let parts = self.inner.parts.lock().iter().map(|pw| Arc::clone(&pw.part)).collect();
        TableSearch::new(parts)
    }

    /// Creates a snapshot of the table at `dst` using hard links.
    ///
    /// Pending items are flushed first. The snapshot can be opened as an
    /// independent table.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] if `dst` is inside the table
    /// directory and [`Error::AlreadyExists`] if `dst` exists.
    pub fn create_snapshot_at<P: AsRef<Path>>(&self, dst: P) -> Result<()> {
        let start = Instant::now();
        let dst = dst.as_ref();
        let dst = if dst.is_absolute() {
            dst.to_path_buf()
        } else {
            std::env::current_dir()?.join(dst)
        };
        if resolve_existing_prefix(&dst).starts_with(&self.inner.path) {
            return Err(Error::invalid_argument(format!(
                "cannot create snapshot {} inside the table directory {}",
                dst.display(),
                self.inner.path.display()
            )));
        }

        self.debug_flush()?;

        // No transaction may run while parts are linked.
        let _guard = self.inner.snapshot_lock.write();
        match fs::mkdir_fail_if_exist(&dst) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                return Err(Error::AlreadyExists(dst.display().to_string()));
            }
            Err(e) => return Err(Error::io_at(e, "create", &dst)),
        }

        let mut parts = 0;
        for name in list_part_dirs(&self.inner.path)? {
            let src = self.inner.path.join(&name);
            let target = dst.join(&name);
            fs::hard_link_files(&src, &target).map_err(|e| Error::io_at(e, "link", &src))?;
            parts += 1;
        }
        fs::sync_path(&dst).map_err(|e| Error::io_at(e, "sync", &dst))?;
        if let Some(parent) = dst.parent() {
            fs::sync_path(parent).map_err(|e| Error::io_at(e, "sync", parent))?;
        }

        log::info!(
            "created snapshot of {} at {} with {} parts in {:?}",
            self.inner.path.display(),
            dst.display(),
            parts,
            start.elapsed()
        );
        Ok(())
    }

    /// Returns the current table metrics.
    pub fn metrics(&self) -> TableMetrics {
        let inner = &self.inner;
        let c = &inner.counters;
        let mut m = TableMetrics {
            active_merges: c.active_merges.load(Ordering::Relaxed),
            merges_count: c.merges_count.load(Ordering::Relaxed),
            items_merged: c.items_merged.load(Ordering::Relaxed),
            assisted_merges: c.assisted_merges.load(Ordering::Relaxed),
            items_added: c.items_added.load(Ordering::Relaxed),
            items_added_size_bytes: c.items_added_size_bytes.load(Ordering::Relaxed),
            pending_items: inner.raw_items.lock().len(),
            ..TableMetrics::default()
        };

        for pw in inner.parts.lock().iter() {
            m.parts_count += 1;
            m.blocks_count += pw.part.blocks_count();
            m.items_count += pw.part.items_count();
            m.size_bytes += pw.part.size();
            m.parts_refcount += Arc::strong_count(&pw.part) as u64;
        }

        let index = inner.caches.index.stats();
        m.index_blocks_cache_size = index.entries as u64;
        m.index_blocks_cache_size_bytes = index.size_bytes as u64;
        m.index_blocks_cache_requests = index.lookups;
        m.index_blocks_cache_misses = index.misses;

        let data = inner.caches.data.stats();
        m.data_blocks_cache_size = data.entries as u64;
        m.data_blocks_cache_size_bytes = data.size_bytes as u64;
        m.data_blocks_cache_requests = data.lookups;
        m.data_blocks_cache_misses = data.misses;
        m
    }

    /// Stops background tasks, flushes pending items and releases the table.
    ///
    /// Dropping the table does the same but can only log errors.
    pub fn close(mut self) -> Result<()> {
        self.shutdown()
    }

    fn shutdown(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        let start = Instant::now();

        drop(self.stop_tx.take());
        let handles = self.flusher.take().into_iter().chain(self.converter.take()).chain(self.workers.drain(..));
        for handle in handles {
            let name = handle.thread().name().unwrap_or("mergeset").to_string();
            if handle.join().is_err() {
                log::error!("background thread {} panicked", name);
            }
        }
        self.inner.flush_tasks.wait();

        let result = self.inner.flush_pending(true);
        self.inner.removal_tasks.wait();
        self.inner.parts.lock().clear();
        self.flock.take();

        match &result {
            Ok(()) => log::info!("closed table {} in {:?}", self.inner.path.display(), start.elapsed()),
            Err(e) => log::error!("cannot flush pending items of {}: {}", self.inner.path.display(), e),
        }
        result
    }
}

impl Drop for Table {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            log::error!("error closing table during drop: {}", e);
        }
    }
}

impl TableInner {
    fn next_merge_idx(&self) -> u64 {
        self.merge_idx.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn is_read_only(&self) -> bool {
        self.read_only.load(Ordering::Relaxed)
    }

    /// Switches read-only mode on or off depending on the free disk space.
    fn update_read_only(&self) {
        let min_free = self.options.min_free_disk_space;
        if min_free == 0 {
            return;
        }
        let free = match fs::free_space(&self.path) {
            Ok(free) => free,
            Err(e) => {
                log::warn!("cannot determine free space of {}: {}", self.path.display(), e);
                return;
            }
        };
        let read_only = free < min_free;
        if self.read_only.swap(read_only, Ordering::Relaxed) == read_only {
            return;
        }
        if read_only {
            log::warn!(
                "switching table {} to read-only mode: free disk space {} bytes is below {} bytes",
                self.path.display(),
                free,
                min_free
            );
        } else {
            log::info!(
                "switching table {} back to read-write mode: free disk space is {} bytes",
                self.path.display(),
                free
            );
        }
    }

    /// Flushes pending raw items if the flush interval passed or `force` is set.
    fn flush_pending(&self, force: bool) -> Result<()> {
        let _guard = self.flush_tasks.enter();
        let blocks = self.raw_items.lock().take_for_flush(self.options.flush_interval, force);
        self.flush_raw_blocks(blocks)
    }

    /// Turns raw blocks into a new on-disk part.
    ///
    /// On-disk parts of a similar size are merged into the new part when the
    /// picker finds it worthwhile.
    fn flush_raw_blocks(&self, blocks: Vec<InmemoryBlock>) -> Result<()> {
        if blocks.is_empty() {
            return Ok(());
        }
        let start = Instant::now();
        let blocks_count = blocks.len();

        let mut chunks = Vec::with_capacity(blocks_count.div_ceil(BLOCKS_PER_INMEMORY_PART));
        let mut blocks = blocks.into_iter().peekable();
        while blocks.peek().is_some() {
            chunks.push(blocks.by_ref().take(BLOCKS_PER_INMEMORY_PART).collect::<Vec<_>>());
        }

        let mps = thread::scope(|s| {
            let handles: Vec<_> =
                chunks.into_iter().map(|chunk| s.spawn(move || self.build_inmemory_part(chunk))).collect();
            handles
                .into_iter()
                .map(|h| h.join().unwrap_or_else(|e| std::panic::resume_unwind(e)))
                .collect::<Result<Vec<_>>>()
        })?;
        let mps: Vec<InmemoryPart> = mps.into_iter().filter(|mp| mp.ph.items_count > 0).collect();
        if mps.is_empty() {
            return Ok(());
        }

        let flushed_items: u64 = mps.iter().map(|mp| mp.ph.items_count).sum();
        let pws = if self.is_read_only() {
            Vec::new()
        } else {
            let max_out_items = self.max_out_items();
            picker::parts_to_merge_with_flush(&self.parts.lock(), flushed_items, max_out_items)
        };
        let written = self.write_flushed_part(&mps, &pws);
        if written.is_err() {
            release_parts(&pws);
        }
        let (name, new_pw) = written?;
        log::debug!(
            "flushed {} raw blocks with {} items and {} on-disk parts into part {} with {} items in {:?}",
            blocks_count,
            flushed_items,
            pws.len(),
            name,
            new_pw.map_or(0, |pw| pw.part.items_count()),
            start.elapsed()
        );

        if let Some(cb) = &self.options.flush_callback {
            cb.call();
        }
        self.assist_merges()
    }

    /// Writes the flushed in-memory parts, plus the on-disk parts `pws`
    /// marked as in merge, into a single new part.
    fn write_flushed_part(
        &self,
        mps: &[InmemoryPart],
        pws: &[Arc<PartWrapper>],
    ) -> Result<(String, Option<Arc<PartWrapper>>)> {
        let _active = (!pws.is_empty()).then(|| self.counters.start_merge());
        let removals = pws
            .iter()
            .map(|pw| part_location(pw).map(|(_, name)| name))
            .collect::<Result<Vec<_>>>()?;

        let idx = self.next_merge_idx();
        let name = part_name(idx);
        let tmp_rel = Path::new(TMP_DIRNAME).join(&name);
        let tmp_path = self.path.join(&tmp_rel);
        let stored = match mps {
            [mp] if pws.is_empty() => mp.store_to_disk(&tmp_path).map(|_| mp.ph.clone()),
            _ => self.merge_flushed_parts(mps, pws, &tmp_path),
        };
        let ph = stored.inspect_err(|_| discard_dir(&tmp_path))?;

        let new_pw = self.commit(idx, &removals, ph, tmp_rel, &name)?;
        Ok((name, new_pw))
    }

    fn build_inmemory_part(&self, mut blocks: Vec<InmemoryBlock>) -> Result<InmemoryPart> {
        let codec = self.options.compression;
        if blocks.len() == 1 {
            if let Some(mut ib) = blocks.pop() {
                return InmemoryPart::from_block(&mut ib, codec);
            }
        }
        let items: u64 = blocks.iter().map(|ib| ib.len() as u64).sum();
        let readers = blocks
            .iter_mut()
            .map(|ib| BlockStreamReader::from_inmemory_block(ib, codec))
            .collect::<Result<Vec<_>>>()?;
        let mut bsw = BlockStreamWriter::new_inmemory(codec, compress_level_for_items(items));
        merge_block_streams(
            &mut bsw,
            readers,
            self.options.prepare_block.as_ref(),
            None,
            &self.counters.items_merged,
        )?;
        bsw.finish_inmemory()
    }

    fn merge_flushed_parts(
        &self,
        mps: &[InmemoryPart],
        pws: &[Arc<PartWrapper>],
        dst: &Path,
    ) -> Result<PartHeader> {
        let mut items: u64 = mps.iter().map(|mp| mp.ph.items_count).sum();
        let mut readers =
            mps.iter().map(BlockStreamReader::from_inmemory_part).collect::<Result<Vec<_>>>()?;
        for pw in pws {
            let (path, _) = part_location(pw)?;
            readers.push(BlockStreamReader::open_file_part(path, true)?);
            items += pw.part.items_count();
        }
        let mut bsw = BlockStreamWriter::create_file_part(
            dst,
            items > self.options.max_cached_part_items,
            self.options.compression,
            compress_level_for_items(items),
        )?;
        merge_block_streams(
            &mut bsw,
            readers,
            self.options.prepare_block.as_ref(),
            None,
            &self.counters.items_merged,
        )?;
        bsw.finish()
    }

    /// Merges parts while there are too many of them.
    fn assist_merges(&self) -> Result<()> {
        loop {
            if self.is_read_only() {
                return Ok(());
            }
            let pws = {
                let parts = self.parts.lock();
                if parts.len() <= self.options.max_parts {
                    return Ok(());
                }
                // Accept smaller batches; the part count must go down.
                parts_to_merge_shrinking(&parts, self.max_out_items())
            };
            if pws.is_empty() {
                return Ok(());
            }
            self.counters.assisted_merges.fetch_add(1, Ordering::Relaxed);
            match self.merge_parts(pws, Some(&self.stop)) {
                Err(e) if e.is_forcibly_stopped() => return Ok(()),
                r => r?,
            }
        }
    }

    /// Upper bound on merge output so concurrent merges fit the free space.
    fn max_out_items(&self) -> u64 {
        let free = fs::free_space(&self.path).unwrap_or_else(|e| {
            log::warn!("cannot determine free space of {}: {}", self.path.display(), e);
            u64::MAX
        });
        free / self.options.merge_workers as u64 / BYTES_PER_ITEM
    }

    /// Picks parts and merges them. Returns false if nothing was worth merging.
    fn merge_existing_parts(&self, is_final: bool) -> Result<bool> {
        if self.is_read_only() {
            return Ok(false);
        }
        let max_out_items = self.max_out_items();
        let pws = {
            let parts = self.parts.lock();
            if is_final {
                parts_to_merge_shrinking(&parts, max_out_items)
            } else {
                picker::parts_to_merge(&parts, DEFAULT_PARTS_TO_MERGE, max_out_items)
            }
        };
        if pws.is_empty() {
            return Ok(false);
        }
        self.merge_parts(pws, Some(&self.stop))?;
        Ok(true)
    }

    /// Merges `pws`, which must be marked as in merge, into a new part.
    fn merge_parts(&self, pws: Vec<Arc<PartWrapper>>, stop: Option<&StopSignal>) -> Result<()> {
        let result = self.merge_parts_internal(&pws, stop);
        if result.is_err() {
            release_parts(&pws);
        }
        result
    }

    fn merge_parts_internal(&self, pws: &[Arc<PartWrapper>], stop: Option<&StopSignal>) -> Result<()> {
        let _active = self.counters.start_merge();
        let start = Instant::now();

        let mut removals = Vec::with_capacity(pws.len());
        let mut readers = Vec::with_capacity(pws.len());
        let mut items = 0;
        for pw in pws {
            let (path, name) = part_location(pw)?;
            removals.push(name);
            readers.push(BlockStreamReader::open_file_part(path, true)?);
            items += pw.part.items_count();
        }

        let idx = self.next_merge_idx();
        let name = part_name(idx);
        let tmp_rel = Path::new(TMP_DIRNAME).join(&name);
        let tmp_path = self.path.join(&tmp_rel);
        let merged = BlockStreamWriter::create_file_part(
            &tmp_path,
            items > self.options.max_cached_part_items,
            self.options.compression,
            compress_level_for_items(items),
        )
        .and_then(|mut bsw| {
            merge_block_streams(
                &mut bsw,
                readers,
                self.options.prepare_block.as_ref(),
                stop,
                &self.counters.items_merged,
            )?;
            bsw.finish()
        });
        let ph = merged.inspect_err(|_| discard_dir(&tmp_path))?;

        let out_items = ph.items_count;
        self.commit(idx, &removals, ph, tmp_rel, &name)?;
        log::info!(
            "merged {} parts with {} items into part {} with {} items in {:?}",
            pws.len(),
            items,
            name,
            out_items,
            start.elapsed()
        );
        Ok(())
    }

    /// Replaces the parts named in `removals` with the part at `tmp_rel`.
    ///
    /// A part without items is discarded and only the removals are applied.
    fn commit(
        &self,
        idx: u64,
        removals: &[PathBuf],
        ph: PartHeader,
        tmp_rel: PathBuf,
        name: &str,
    ) -> Result<Option<Arc<PartWrapper>>> {
        let rename = if ph.items_count > 0 {
            Some((tmp_rel, PathBuf::from(name)))
        } else {
            discard_dir(&self.path.join(&tmp_rel));
            None
        };
        let t = Transaction { remove: removals.to_vec(), rename };
        let has_new_part = t.rename.is_some();
        let txn_path = txn::write_transaction(&self.path, idx, &t)?;

        let _guard = self.snapshot_lock.read();
        txn::run_transaction(&self.path, &txn_path, &self.removal_tasks)?;
        let new_pw = if has_new_part {
            Some(PartWrapper::new(Part::open(&self.path.join(name), Arc::clone(&self.caches))?))
        } else {
            None
        };

        let mut parts = self.parts.lock();
        let before = parts.len();
        parts.retain(|pw| {
            let name = pw.part.path().and_then(Path::file_name);
            !removals.iter().any(|r| name == Some(r.as_os_str()))
        });
        assert_eq!(
            before - parts.len(),
            removals.len(),
            "BUG: some of the merged parts are missing from the parts list"
        );
        if let Some(pw) = &new_pw {
            parts.push(Arc::clone(pw));
        }
        Ok(new_pw)
    }
}

/// Path and directory name of an on-disk part.
fn part_location(pw: &PartWrapper) -> Result<(&Path, PathBuf)> {
    let path = pw.part.path().ok_or_else(|| Error::internal("cannot merge an in-memory part"))?;
    let name = path
        .file_name()
        .ok_or_else(|| Error::internal(format!("part path {} has no file name", path.display())))?;
    Ok((path, PathBuf::from(name)))
}

/// Clears the merge mark of parts whose merge failed.
fn release_parts(pws: &[Arc<PartWrapper>]) {
    for pw in pws {
        pw.in_merge.store(false, Ordering::Release);
    }
}

/// Tries batch sizes from the largest down to 2 until some parts qualify.
fn parts_to_merge_shrinking(parts: &[Arc<PartWrapper>], max_out_items: u64) -> Vec<Arc<PartWrapper>> {
    (2..=DEFAULT_PARTS_TO_MERGE)
        .rev()
        .map(|n| picker::parts_to_merge(parts, n, max_out_items))
        .find(|pws| !pws.is_empty())
        .unwrap_or_default()
}

fn part_name(idx: u64) -> String {
    format!("{:016X}", idx)
}

fn parse_part_name(name: &str) -> Option<u64> {
    if name.len() != 16 {
        return None;
    }
    u64::from_str_radix(name, 16).ok()
}

/// Merge indexes continue from the wall clock so names stay unique even if
/// the table directory was copied around.
fn initial_merge_idx(max_existing: u64) -> u64 {
    let now = SystemTime::now().duration_since(UNIX_EPOCH).map_or(0, |d| d.as_nanos() as u64);
    now.max(max_existing)
}

/// Removes a merge output that won't be used.
fn discard_dir(path: &Path) {
    if path.exists() {
        if let Err(e) = fs::remove_dir_all_with_retry(path) {
            log::error!("cannot remove {}: {}", path.display(), e);
        }
    }
}

/// Logs an error that a background task can't return and aborts.
fn fatal(what: &str, err: &Error) -> ! {
    log::error!("{}: {}", what, err);
    std::process::abort()
}

/// Returns the part directory names in `path`, sorted.
fn list_part_dirs(path: &Path) -> Result<Vec<String>> {
    let mut names = Vec::new();
    for entry in std::fs::read_dir(path).map_err(|e| Error::io_at(e, "read", path))? {
        let entry = entry.map_err(|e| Error::io_at(e, "read", path))?;
        if !entry.file_type().map_err(|e| Error::io_at(e, "stat", &entry.path()))?.is_dir() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        if name == TXN_DIRNAME || name == TMP_DIRNAME || name == SNAPSHOTS_DIRNAME {
            continue;
        }
        if fs::is_scheduled_for_removal(&name) {
            continue;
        }
        names.push(name);
    }
    names.sort();
    Ok(names)
}

/// Opens every part in the table directory. Returns them with the biggest
/// merge index found among their names.
fn open_parts(path: &Path, caches: &Arc<BlockCaches>) -> Result<(Vec<Arc<PartWrapper>>, u64)> {
    let mut pws = Vec::new();
    let mut max_idx = 0;
    for name in list_part_dirs(path)? {
        let part_path = path.join(&name);
        if fs::is_empty_dir(&part_path).map_err(|e| Error::io_at(e, "read", &part_path))? {
            log::info!("removing empty part directory {}", part_path.display());
            std::fs::remove_dir(&part_path).map_err(|e| Error::io_at(e, "remove", &part_path))?;
            continue;
        }
        if let Some(idx) = parse_part_name(&name) {
            max_idx = max_idx.max(idx);
        }
        let part = Part::open(&part_path, Arc::clone(caches))?;
        pws.push(PartWrapper::new(part));
    }
    Ok((pws, max_idx))
}

/// Canonicalizes the longest existing ancestor of `path` and appends the rest.
fn resolve_existing_prefix(path: &Path) -> PathBuf {
    let mut rest = Vec::new();
    let mut cur = path;
    loop {
        if let Ok(canonical) = cur.canonicalize() {
            return rest.iter().rev().fold(canonical, |acc, c| acc.join(c));
        }
        match (cur.parent(), cur.file_name()) {
            (Some(parent), Some(name)) => {
                rest.push(name.to_owned());
                cur = parent;
            }
            _ => return path.to_path_buf(),
        }
    }
}

fn run_flusher(inner: Arc<TableInner>) {
    let ticker = channel::tick(inner.options.flush_interval);
    loop {
        select! {
            recv(inner.stop.receiver()) -> _ => return,
            recv(ticker) -> _ => {
                inner.update_read_only();
                if let Err(e) = inner.flush_pending(false) {
                    fatal("cannot flush pending items", &e);
                }
            }
        }
    }
}

fn run_merge_worker(inner: Arc<TableInner>) {
    let final_merge_delay = inner.options.final_merge_delay;
    let mut backoff = MIN_MERGE_BACKOFF;
    let mut last_merge = Instant::now();
    loop {
        let is_final = !final_merge_delay.is_zero() && last_merge.elapsed() > final_merge_delay;
        match inner.merge_existing_parts(is_final) {
            Ok(true) => {
                last_merge = Instant::now();
                backoff = MIN_MERGE_BACKOFF;
                continue;
            }
            Ok(false) => {
                if is_final {
                    // Nothing left to merge; wait for new parts.
                    last_merge = Instant::now();
                }
            }
            Err(e) if e.is_forcibly_stopped() => return,
            Err(e) => fatal(&format!("cannot merge parts of {}", inner.path.display()), &e),
        }

        backoff = (backoff * 2).min(MAX_MERGE_BACKOFF);
        select! {
            recv(inner.stop.receiver()) -> _ => return,
            default(backoff) => {}
        }
    }
}

/// Runs every existing part through the prepare_block hook once.
fn run_conversion(inner: Arc<TableInner>) {
    let start = Instant::now();
    let pws: Vec<Arc<PartWrapper>> = inner.parts.lock().clone();
    let mut converted = 0;
    for chunk in pws.chunks(DEFAULT_PARTS_TO_MERGE) {
        if inner.is_read_only() {
            log::warn!("stopping conversion of {} in read-only mode; it resumes on the next open", inner.path.display());
            return;
        }
        let batch: Vec<Arc<PartWrapper>> = chunk
            .iter()
            .filter(|pw| {
                pw.in_merge.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire).is_ok()
            })
            .cloned()
            .collect();
        if batch.is_empty() {
            continue;
        }
        let n = batch.len();
        match inner.merge_parts(batch, Some(&inner.stop)) {
            Ok(()) => converted += n,
            Err(e) if e.is_forcibly_stopped() => return,
            Err(e) => fatal(&format!("cannot convert parts of {}", inner.path.display()), &e),
        }
    }

    let flag = inner.path.join(CONVERTED_FILENAME);
    if let Err(e) = fs::write_atomic(&flag, b"") {
        fatal("cannot write conversion marker", &Error::io_at(e, "write", &flag));
    }
    log::info!(
        "converted {} parts of {} in {:?}",
        converted,
        inner.path.display(),
        start.elapsed()
    );
}
