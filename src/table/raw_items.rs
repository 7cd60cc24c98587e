//! Buffer of items added but not yet flushed into parts.

use crate::part::InmemoryBlock;
use std::time::{Duration, Instant};

/// Unsorted blocks of recently added items.
#[derive(Debug)]
pub(crate) struct RawItems {
    blocks: Vec<InmemoryBlock>,
    items: u64,
    last_flush: Instant,
}

impl RawItems {
    pub(crate) fn new() -> Self {
        Self { blocks: Vec::new(), items: 0, last_flush: Instant::now() }
    }

    /// Number of buffered items.
    pub(crate) fn len(&self) -> u64 {
        self.items
    }

    /// Appends `items`, each of which must fit an empty block.
    ///
    /// Returns the buffered blocks once `max_blocks` of them have
    /// accumulated; the caller must flush them.
    pub(crate) fn add_items(&mut self, items: &[&[u8]], max_blocks: usize) -> Option<Vec<InmemoryBlock>> {
        for item in items {
            let fits = self.blocks.last_mut().is_some_and(|ib| ib.add(item));
            if !fits {
                let mut ib = InmemoryBlock::new();
                let added = ib.add(item);
                debug_assert!(added, "BUG: item of {} bytes must fit an empty block", item.len());
                self.blocks.push(ib);
            }
            self.items += 1;
        }
        if self.blocks.len() >= max_blocks {
            return Some(self.take());
        }
        None
    }

    /// Takes the buffered blocks if `force` is set or `interval` passed since
    /// the last flush.
    pub(crate) fn take_for_flush(&mut self, interval: Duration, force: bool) -> Vec<InmemoryBlock> {
        if !force && self.last_flush.elapsed() < interval {
            return Vec::new();
        }
        self.take()
    }

    fn take(&mut self) -> Vec<InmemoryBlock> {
        self.last_flush = Instant::now();
        self.items = 0;
        std::mem::take(&mut self.blocks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::part::MAX_INMEMORY_BLOCK_SIZE;

    #[test]
    fn test_blocks_fill_up() {
        let mut ri = RawItems::new();
        let big = vec![b'x'; MAX_INMEMORY_BLOCK_SIZE / 2 + 1];
        assert!(ri.add_items(&[&big], 3).is_none());
        assert!(ri.add_items(&[&big], 3).is_none());
        assert_eq!(ri.len(), 2);

        let blocks = ri.add_items(&[&big, b"small"], 3).unwrap();
        assert_eq!(blocks.len(), 3);
        assert_eq!(blocks.iter().map(|b| b.len()).sum::<usize>(), 4);
        assert_eq!(ri.len(), 0);
    }

    #[test]
    fn test_take_for_flush() {
        let mut ri = RawItems::new();
        assert!(ri.add_items(&[b"a", b"b"], 10).is_none());
        assert!(ri.take_for_flush(Duration::from_secs(3600), false).is_empty());
        let blocks = ri.take_for_flush(Duration::from_secs(3600), true);
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].len(), 2);

        assert!(ri.add_items(&[b"c"], 10).is_none());
        assert_eq!(ri.take_for_flush(Duration::ZERO, false).len(), 1);
    }
}
