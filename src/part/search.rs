//! Point and range search within a single part.

use crate::cache::CacheKey;
use crate::error::Result;
use crate::part::{IndexBlock, InmemoryBlock, Part};
use std::sync::Arc;

/// Decides from a block's first item whether the decoded block is worth
/// keeping in the data block cache.
pub type CachePredicate = Arc<dyn Fn(&[u8]) -> bool + Send + Sync>;

/// A cursor over the items of one part.
///
/// Call [`seek`](Self::seek) to position the cursor, then
/// [`next_item`](Self::next_item) to step through items in order.
pub struct PartSearch {
    part: Arc<Part>,
    should_cache: Option<CachePredicate>,

    /// Next metaindex row to load.
    mr_idx: usize,
    bhs: Option<Arc<IndexBlock>>,
    /// Next block header of `bhs` to load.
    bh_idx: usize,
    index_block_offset: u64,

    ib: Option<Arc<InmemoryBlock>>,
    /// Next item of `ib` to return.
    ib_item_idx: usize,
    /// Current item of `ib`.
    item_idx: Option<usize>,
    eof: bool,
}

impl std::fmt::Debug for PartSearch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PartSearch")
            .field("part", &self.part)
            .field("mr_idx", &self.mr_idx)
            .field("bh_idx", &self.bh_idx)
            .field("ib_item_idx", &self.ib_item_idx)
            .field("eof", &self.eof)
            .finish()
    }
}

impl PartSearch {
    /// Creates a search over `part`.
    pub fn new(part: Arc<Part>, should_cache: Option<CachePredicate>) -> Self {
        let mut ps = Self {
            part,
            should_cache,
            mr_idx: 0,
            bhs: None,
            bh_idx: 0,
            index_block_offset: 0,
            ib: None,
            ib_item_idx: 0,
            item_idx: None,
            eof: false,
        };
        ps.reset();
        ps
    }

    /// The searched part.
    pub fn part(&self) -> &Arc<Part> {
        &self.part
    }

    fn reset(&mut self) {
        self.mr_idx = 0;
        self.bhs = None;
        self.bh_idx = 0;
        self.ib = None;
        self.ib_item_idx = 0;
        self.item_idx = None;
        self.eof = false;
    }

    /// Positions the cursor so that the next call to
    /// [`next_item`](Self::next_item) returns the first item >= `k`.
    pub fn seek(&mut self, k: &[u8]) -> Result<()> {
        self.item_idx = None;
        if k > self.part.header().last_item.as_slice() {
            self.eof = true;
            return Ok(());
        }
        if self.try_fast_seek(k) {
            return Ok(());
        }

        self.reset();
        if k <= self.part.header().first_item.as_slice() {
            self.next_block()?;
            return Ok(());
        }

        // The item may live in the row before the first row starting at or after k.
        let mrs = self.part.metaindex();
        let n = mrs.partition_point(|mr| mr.first_item.as_slice() < k);
        self.mr_idx = n.saturating_sub(1);
        if !self.next_bhs()? {
            return Ok(());
        }

        let bhs = self.bhs.as_ref().map(|b| b.bhs.as_slice()).unwrap_or_default();
        let n = bhs.partition_point(|bh| bh.first_item.as_slice() < k);
        self.bh_idx = n.saturating_sub(1);
        if !self.next_block()? {
            return Ok(());
        }

        let ib = self.current_block();
        let (idx, len) = (ib.search(k), ib.len());
        self.ib_item_idx = idx;
        if idx < len {
            return Ok(());
        }
        // The first item >= k starts the next block.
        self.next_block()?;
        Ok(())
    }

    /// Serves a seek from the loaded block when the key is known to be in it.
    ///
    /// This covers the common pattern of seeks with increasing keys.
    fn try_fast_seek(&mut self, k: &[u8]) -> bool {
        if self.eof {
            return false;
        }
        let Some(ib) = self.ib.as_deref() else {
            return false;
        };
        let len = ib.len();
        if self.ib_item_idx >= len {
            return false;
        }
        if ib.cmp_item(len - 1, k).is_lt() {
            // The item is in the next blocks.
            return false;
        }
        let lo = self.ib_item_idx.saturating_sub(1);
        if !ib.cmp_item(lo, k).is_lt() {
            // Equal or bigger items may precede the current position.
            return false;
        }
        self.ib_item_idx = ib.search_from(lo, len, k);
        true
    }

    /// Advances to the next item. Returns false once the part is exhausted.
    pub fn next_item(&mut self) -> Result<bool> {
        if self.eof {
            return Ok(false);
        }
        let exhausted = self.ib.as_ref().map_or(true, |ib| self.ib_item_idx >= ib.len());
        if exhausted && !self.next_block()? {
            return Ok(false);
        }
        self.item_idx = Some(self.ib_item_idx);
        self.ib_item_idx += 1;
        Ok(true)
    }

    /// The current item.
    ///
    /// # Panics
    ///
    /// Panics unless the last call to [`next_item`](Self::next_item)
    /// returned true.
    pub fn item(&self) -> &[u8] {
        match self.item_idx {
            Some(i) => self.current_block().item(i),
            None => panic!("BUG: item() called without a successful next_item()"),
        }
    }

    fn current_block(&self) -> &InmemoryBlock {
        match self.ib.as_deref() {
            Some(ib) => ib,
            None => panic!("BUG: no block loaded in part search"),
        }
    }

    fn next_block(&mut self) -> Result<bool> {
        let need_bhs = self.bhs.as_ref().map_or(true, |b| self.bh_idx >= b.bhs.len());
        if need_bhs && !self.next_bhs()? {
            return Ok(false);
        }
        let Some(bhs) = self.bhs.clone() else {
            return Ok(false);
        };
        let slot = self.bh_idx;
        let bh = &bhs.bhs[slot];
        self.bh_idx += 1;

        let caches = self.part.caches();
        let key = CacheKey::new(self.part.id(), self.index_block_offset, slot as u32);
        let ib = match caches.data.get(&key) {
            Some(ib) => ib,
            None => {
                let ib = Arc::new(self.part.read_data_block(bh)?);
                let cache = self.should_cache.as_ref().map_or(true, |f| f(&bh.first_item));
                if cache {
                    caches.data.insert(key, Arc::clone(&ib));
                }
                ib
            }
        };
        self.ib = Some(ib);
        self.ib_item_idx = 0;
        Ok(true)
    }

    fn next_bhs(&mut self) -> Result<bool> {
        let mrs = self.part.metaindex();
        if self.mr_idx >= mrs.len() {
            self.eof = true;
            self.bhs = None;
            self.ib = None;
            return Ok(false);
        }
        let mr = &mrs[self.mr_idx];
        self.mr_idx += 1;

        let caches = self.part.caches();
        let key = CacheKey::new(self.part.id(), mr.index_block_offset, 0);
        let idxb = match caches.index.get(&key) {
            Some(idxb) => idxb,
            None => {
                let idxb = Arc::new(self.part.read_index_block(mr)?);
                caches.index.insert(key, Arc::clone(&idxb));
                idxb
            }
        };
        self.index_block_offset = mr.index_block_offset;
        self.bhs = Some(idxb);
        self.bh_idx = 0;
        Ok(true)
    }
}
