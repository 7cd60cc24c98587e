//! Sorted search over every part of a table.

use crate::error::Result;
use crate::part::search::CachePredicate;
use crate::part::{Part, PartSearch};
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::Arc;

/// Entry in the search heap; the part search always holds a current item.
struct HeapEntry(PartSearch);

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.0.item() == other.0.item()
    }
}

impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reverse ordering for min-heap
        other.0.item().cmp(self.0.item())
    }
}

/// A cursor returning the items of all parts in ascending order.
///
/// The search works on the parts that were live when it was created; it
/// keeps them open until it is dropped, so merges running meanwhile don't
/// affect it. Items added after creation aren't visible.
///
/// # Example
///
/// ```rust,no_run
/// use mergeset::{Options, Table};
///
/// # fn main() -> Result<(), mergeset::Error> {
/// let table = Table::open("./index", Options::default())?;
/// let mut ts = table.search();
/// ts.seek(b"user:")?;
/// while ts.next_item()? && ts.item().starts_with(b"user:") {
///     println!("{:?}", ts.item());
/// }
/// # Ok(())
/// # }
/// ```
pub struct TableSearch {
    /// Part searches without a current item.
    idle: Vec<PartSearch>,
    heap: BinaryHeap<HeapEntry>,
    seeked: bool,
    /// The heap top was returned by the last `next_item` call.
    has_item: bool,
}

impl std::fmt::Debug for TableSearch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TableSearch")
            .field("parts", &self.parts_count())
            .field("active", &self.heap.len())
            .field("seeked", &self.seeked)
            .finish()
    }
}

impl TableSearch {
    pub(crate) fn new(parts: Vec<Arc<Part>>) -> Self {
        Self {
            idle: parts.into_iter().map(|p| PartSearch::new(p, None)).collect(),
            heap: BinaryHeap::new(),
            seeked: false,
            has_item: false,
        }
    }

    /// Caches only the data blocks whose first item satisfies `should_cache`.
    ///
    /// Large scans use this to keep one-off blocks out of the cache. The
    /// search must be positioned again with [`seek`](Self::seek) afterwards.
    pub fn with_cache_predicate(mut self, should_cache: CachePredicate) -> Self {
        self.reclaim();
        self.idle = self
            .idle
            .into_iter()
            .map(|ps| PartSearch::new(Arc::clone(ps.part()), Some(Arc::clone(&should_cache))))
            .collect();
        self.seeked = false;
        self
    }

    /// Number of parts the search covers.
    pub fn parts_count(&self) -> usize {
        self.idle.len() + self.heap.len()
    }

    fn reclaim(&mut self) {
        self.idle.extend(self.heap.drain().map(|e| e.0));
        self.has_item = false;
    }

    /// Positions the search so that [`next_item`](Self::next_item) returns
    /// the first item >= `k`.
    pub fn seek(&mut self, k: &[u8]) -> Result<()> {
        self.reclaim();
        self.seeked = true;
        let mut err = None;
        for mut ps in std::mem::take(&mut self.idle) {
            if err.is_none() {
                match ps.seek(k).and_then(|_| ps.next_item()) {
                    Ok(true) => {
                        self.heap.push(HeapEntry(ps));
                        continue;
                    }
                    Ok(false) => {}
                    Err(e) => err = Some(e),
                }
            }
            self.idle.push(ps);
        }
        match err {
            Some(e) => {
                self.reclaim();
                self.seeked = false;
                Err(e)
            }
            None => Ok(()),
        }
    }

    /// Advances to the next item. Returns false once every part is exhausted.
    ///
    /// # Panics
    ///
    /// Panics if [`seek`](Self::seek) wasn't called first.
    pub fn next_item(&mut self) -> Result<bool> {
        assert!(self.seeked, "BUG: seek() must be called before next_item()");
        if self.has_item {
            self.has_item = false;
            if let Some(HeapEntry(mut ps)) = self.heap.pop() {
                match ps.next_item() {
                    Ok(true) => self.heap.push(HeapEntry(ps)),
                    Ok(false) => self.idle.push(ps),
                    Err(e) => {
                        self.idle.push(ps);
                        return Err(e);
                    }
                }
            }
        }
        if self.heap.is_empty() {
            return Ok(false);
        }
        self.has_item = true;
        Ok(true)
    }

    /// The current item.
    ///
    /// # Panics
    ///
    /// Panics unless the last call to [`next_item`](Self::next_item)
    /// returned true.
    pub fn item(&self) -> &[u8] {
        match self.heap.peek() {
            Some(e) if self.has_item => e.0.item(),
            _ => panic!("BUG: item() called without a successful next_item()"),
        }
    }

    /// Positions the search at the first item starting with `prefix`.
    ///
    /// Returns false if no item has this prefix; the item is then available
    /// through [`item`](Self::item).
    pub fn first_item_with_prefix(&mut self, prefix: &[u8]) -> Result<bool> {
        self.seek(prefix)?;
        if !self.next_item()? {
            return Ok(false);
        }
        Ok(self.item().starts_with(prefix))
    }
}
