//! K-way merge of sorted block streams.
//!
//! The merger keeps a min-heap of readers ordered by their current item. The
//! reader at the top copies items into the output block for as long as they
//! don't exceed the current item of the next reader in the heap.

use crate::config::PrepareBlock;
use crate::error::{Error, Result};
use crate::part::{BlockStreamReader, BlockStreamWriter, InmemoryBlock, PartHeader};
use crossbeam::channel::{Receiver, TryRecvError};
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};

/// Cancellation signal observed by merges at block boundaries.
///
/// The signal trips once every sender of the channel is dropped.
#[derive(Debug, Clone)]
pub struct StopSignal(Receiver<()>);

impl StopSignal {
    /// Wraps the receiving side of a stop channel.
    pub fn new(rx: Receiver<()>) -> Self {
        Self(rx)
    }

    /// Returns true once the signal tripped.
    pub fn is_stopped(&self) -> bool {
        matches!(self.0.try_recv(), Err(TryRecvError::Disconnected))
    }

    /// The underlying channel, for use in `select!`.
    pub fn receiver(&self) -> &Receiver<()> {
        &self.0
    }
}

/// Entry in the merge heap
struct HeapEntry(BlockStreamReader);

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.0.current_item() == other.0.current_item()
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
        // Reverse ordering for min-heap (smallest item first)
        other.0.current_item().cmp(self.0.current_item())
    }
}

/// Merges `readers` into `bsw` and returns the header of the written part.
///
/// Each output block passes through `prepare_block` when set. The merge
/// checks `stop` before every block and returns [`Error::ForciblyStopped`]
/// once it trips; the output is unusable in that case. `items_merged` is
/// incremented as blocks are written.
pub fn merge_block_streams(
    bsw: &mut BlockStreamWriter,
    readers: Vec<BlockStreamReader>,
    prepare_block: Option<&PrepareBlock>,
    stop: Option<&StopSignal>,
    items_merged: &AtomicU64,
) -> Result<PartHeader> {
    if readers.is_empty() {
        return Err(Error::invalid_argument("cannot merge zero block streams"));
    }

    let mut heap = BinaryHeap::with_capacity(readers.len());
    for mut bsr in readers {
        if bsr.next_block()? {
            heap.push(HeapEntry(bsr));
        }
    }

    let mut merger = Merger { ib: InmemoryBlock::new(), prepare_block, items_merged };
    while let Some(HeapEntry(mut bsr)) = heap.pop() {
        if stop.is_some_and(StopSignal::is_stopped) {
            return Err(Error::ForciblyStopped);
        }

        let next_item = heap.peek().map(|e| e.0.current_item());
        let block = bsr.block();
        let len = block.len();
        // Skip per-item comparisons when the whole block precedes the next reader.
        let compare_every_item = match next_item {
            Some(next) => block.item(len - 1) > next,
            None => false,
        };
        while bsr.block_item_idx < len {
            let item = bsr.block().item(bsr.block_item_idx);
            if compare_every_item && next_item.is_some_and(|next| item > next) {
                break;
            }
            if !merger.ib.add(item) {
                merger.flush(bsw)?;
                continue;
            }
            bsr.block_item_idx += 1;
        }

        if bsr.block_item_idx == len && !bsr.next_block()? {
            continue;
        }
        heap.push(HeapEntry(bsr));
    }

    merger.flush(bsw)?;
    Ok(bsw.header().clone())
}

struct Merger<'a> {
    ib: InmemoryBlock,
    prepare_block: Option<&'a PrepareBlock>,
    items_merged: &'a AtomicU64,
}

impl Merger<'_> {
    fn flush(&mut self, bsw: &mut BlockStreamWriter) -> Result<()> {
        if self.ib.is_empty() {
            return Ok(());
        }
        self.items_merged.fetch_add(self.ib.len() as u64, AtomicOrdering::Relaxed);

        if let Some(prepare_block) = self.prepare_block {
            let first = self.ib.item(0).to_vec();
            let last = self.ib.item(self.ib.len() - 1).to_vec();
            let items = prepare_block.apply(self.ib.to_vecs());
            if let (Some(new_first), Some(new_last)) = (items.first(), items.last()) {
                assert!(
                    *new_first >= first,
                    "BUG: prepare_block returned first item {} smaller than the original first item {}",
                    hex::encode(new_first),
                    hex::encode(&first)
                );
                assert!(
                    *new_last <= last,
                    "BUG: prepare_block returned last item {} bigger than the original last item {}",
                    hex::encode(new_last),
                    hex::encode(&last)
                );
            }
            self.ib.set_items(&items);
            if self.ib.is_empty() {
                return Ok(());
            }
        }

        bsw.write_block(&mut self.ib)?;
        self.ib.reset();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CompressionType;
    use crate::part::InmemoryPart;
    use proptest::prelude::*;

    fn stream(items: &[Vec<u8>]) -> InmemoryPart {
        let mut bsw = BlockStreamWriter::new_inmemory(CompressionType::Zstd, 1);
        let mut ib = InmemoryBlock::new();
        for item in items {
            if !ib.add(item) {
                bsw.write_block(&mut ib).unwrap();
                ib.reset();
                assert!(ib.add(item));
            }
        }
        bsw.write_block(&mut ib).unwrap();
        bsw.finish_inmemory().unwrap()
    }

    fn readers(parts: &[InmemoryPart]) -> Vec<BlockStreamReader> {
        parts.iter().map(|mp| BlockStreamReader::from_inmemory_part(mp).unwrap()).collect()
    }

    fn read_all(mp: &InmemoryPart) -> Vec<Vec<u8>> {
        let mut bsr = BlockStreamReader::from_inmemory_part(mp).unwrap();
        let mut out = Vec::new();
        while bsr.next_block().unwrap() {
            out.extend(bsr.block().to_vecs());
        }
        out
    }

    fn keys(range: impl Iterator<Item = usize>, prefix: &str) -> Vec<Vec<u8>> {
        range.map(|i| format!("{}{:08}", prefix, i).into_bytes()).collect()
    }

    #[test]
    fn test_merge_interleaved_streams() {
        let a = keys((0..20_000).step_by(2), "k");
        let b = keys((1..20_000).step_by(2), "k");
        let c = keys(5_000..6_000, "k");
        let parts = [stream(&a), stream(&b), stream(&c)];

        let items_merged = AtomicU64::new(0);
        let mut bsw = BlockStreamWriter::new_inmemory(CompressionType::Zstd, 1);
        let ph = merge_block_streams(&mut bsw, readers(&parts), None, None, &items_merged).unwrap();
        let mp = bsw.finish_inmemory().unwrap();

        let mut expected: Vec<Vec<u8>> = a.iter().chain(&b).chain(&c).cloned().collect();
        expected.sort();
        assert_eq!(ph.items_count, expected.len() as u64);
        assert_eq!(mp.ph, ph);
        assert_eq!(items_merged.load(AtomicOrdering::Relaxed), expected.len() as u64);
        assert_eq!(ph.first_item, expected[0]);
        assert_eq!(ph.last_item, expected[expected.len() - 1]);
        assert_eq!(read_all(&mp), expected);
    }

    #[test]
    fn test_merge_single_stream() {
        let a = keys(0..100, "x");
        let parts = [stream(&a)];
        let mut bsw = BlockStreamWriter::new_inmemory(CompressionType::None, 0);
        let ph = merge_block_streams(&mut bsw, readers(&parts), None, None, &AtomicU64::new(0)).unwrap();
        assert_eq!(ph.items_count, 100);
        assert_eq!(read_all(&bsw.finish_inmemory().unwrap()), a);
    }

    #[test]
    fn test_merge_zero_streams() {
        let mut bsw = BlockStreamWriter::new_inmemory(CompressionType::Zstd, 1);
        let err = merge_block_streams(&mut bsw, Vec::new(), None, None, &AtomicU64::new(0)).unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[test]
    fn test_merge_forcibly_stopped() {
        let parts = [stream(&keys(0..1000, "a")), stream(&keys(0..1000, "b"))];
        let (tx, rx) = crossbeam::channel::bounded::<()>(0);
        let stop = StopSignal::new(rx);
        assert!(!stop.is_stopped());
        drop(tx);
        assert!(stop.is_stopped());

        let mut bsw = BlockStreamWriter::new_inmemory(CompressionType::Zstd, 1);
        let err = merge_block_streams(&mut bsw, readers(&parts), None, Some(&stop), &AtomicU64::new(0))
            .unwrap_err();
        assert!(err.is_forcibly_stopped());
    }

    #[test]
    fn test_prepare_block_dedup() {
        let a = keys(0..500, "d");
        let parts = [stream(&a), stream(&a)];
        let hook = PrepareBlock::new(|mut items: Vec<Vec<u8>>| {
            items.dedup();
            items
        });
        let mut bsw = BlockStreamWriter::new_inmemory(CompressionType::Zstd, 1);
        let ph = merge_block_streams(&mut bsw, readers(&parts), Some(&hook), None, &AtomicU64::new(0))
            .unwrap();
        assert_eq!(ph.items_count, 500);
        assert_eq!(read_all(&bsw.finish_inmemory().unwrap()), a);
    }

    #[test]
    fn test_prepare_block_may_drop_everything() {
        let parts = [stream(&keys(0..10, "e"))];
        let hook = PrepareBlock::new(|_| Vec::new());
        let mut bsw = BlockStreamWriter::new_inmemory(CompressionType::Zstd, 1);
        let ph = merge_block_streams(&mut bsw, readers(&parts), Some(&hook), None, &AtomicU64::new(0))
            .unwrap();
        assert_eq!(ph.items_count, 0);
        assert_eq!(ph.blocks_count, 0);
    }

    #[test]
    #[should_panic(expected = "smaller than the original first item")]
    fn test_prepare_block_out_of_bounds() {
        let parts = [stream(&keys(10..20, "f"))];
        let hook = PrepareBlock::new(|mut items: Vec<Vec<u8>>| {
            items.insert(0, b"a".to_vec());
            items
        });
        let mut bsw = BlockStreamWriter::new_inmemory(CompressionType::Zstd, 1);
        let _ = merge_block_streams(&mut bsw, readers(&parts), Some(&hook), None, &AtomicU64::new(0));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn prop_merge_is_sorted_union(
            streams in prop::collection::vec(
                prop::collection::vec(prop::collection::vec(any::<u8>(), 1..24), 1..400),
                1..6,
            )
        ) {
            let mut parts = Vec::new();
            let mut expected = Vec::new();
            for mut s in streams {
                s.sort();
                expected.extend(s.iter().cloned());
                parts.push(stream(&s));
            }
            expected.sort();

            let mut bsw = BlockStreamWriter::new_inmemory(CompressionType::Zstd, -5);
            let ph = merge_block_streams(&mut bsw, readers(&parts), None, None, &AtomicU64::new(0)).unwrap();
            prop_assert_eq!(ph.items_count, expected.len() as u64);
            prop_assert!(ph.blocks_count >= 1 && ph.blocks_count <= ph.items_count);
            prop_assert_eq!(read_all(&bsw.finish_inmemory().unwrap()), expected);
        }
    }
}
