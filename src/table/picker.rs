//! Selection of parts to merge.
//!
//! The picker looks for the run of similarly sized parts whose merge gives
//! the biggest output relative to its largest input. A high ratio means
//! every merged item moves a few times at most over the table's lifetime.

use crate::part::Part;
use std::ops::Range;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Maximum number of parts merged at once.
pub const DEFAULT_PARTS_TO_MERGE: usize = 15;

/// Minimum ratio between the output size and the largest input size.
const MIN_MERGE_MULTIPLIER: f64 = 1.7;

/// A live part plus its merge state.
#[derive(Debug)]
pub struct PartWrapper {
    /// The opened part.
    pub part: Arc<Part>,
    /// Set while the part is an input of a running merge.
    pub in_merge: AtomicBool,
}

impl PartWrapper {
    pub(crate) fn new(part: Part) -> Arc<Self> {
        Arc::new(Self { part: Arc::new(part), in_merge: AtomicBool::new(false) })
    }

    fn items(&self) -> u64 {
        self.part.items_count()
    }
}

/// Picks parts to merge among those not already in a merge and marks them.
///
/// The output holds at most `max_out_items` items.
pub(crate) fn parts_to_merge(
    pws: &[Arc<PartWrapper>],
    max_parts_to_merge: usize,
    max_out_items: u64,
) -> Vec<Arc<PartWrapper>> {
    let src: Vec<Arc<PartWrapper>> =
        pws.iter().filter(|pw| !pw.in_merge.load(Ordering::Acquire)).cloned().collect();
    let picked = append_parts_to_merge(Vec::new(), src, max_parts_to_merge, max_out_items);
    mark_in_merge(&picked);
    picked
}

/// Picks on-disk parts worth merging into a flush of `flushed_items` items
/// and marks them.
///
/// The flush takes part in the selection as one more part. Batch sizes
/// shrink down to 2 until the best batch includes the flush; the result is
/// empty if none does.
pub(crate) fn parts_to_merge_with_flush(
    pws: &[Arc<PartWrapper>],
    flushed_items: u64,
    max_out_items: u64,
) -> Vec<Arc<PartWrapper>> {
    if flushed_items > max_out_items / 2 {
        return Vec::new();
    }
    let src = eligible_parts(
        pws.iter().filter(|pw| !pw.in_merge.load(Ordering::Acquire)).cloned().collect(),
        max_out_items,
    );
    let flush_pos = src.partition_point(|pw| pw.items() < flushed_items);
    let mut items: Vec<u64> = src.iter().map(|pw| pw.items()).collect();
    items.insert(flush_pos, flushed_items);

    for max_parts_to_merge in (2..=DEFAULT_PARTS_TO_MERGE).rev() {
        let Some(window) = best_window(&items, max_parts_to_merge, max_out_items) else {
            continue;
        };
        if !window.contains(&flush_pos) {
            continue;
        }
        let picked: Vec<Arc<PartWrapper>> = window
            .filter(|&i| i != flush_pos)
            .map(|i| Arc::clone(&src[if i < flush_pos { i } else { i - 1 }]))
            .collect();
        mark_in_merge(&picked);
        return picked;
    }
    Vec::new()
}

fn mark_in_merge(pws: &[Arc<PartWrapper>]) {
    for pw in pws {
        let was_in_merge = pw.in_merge.swap(true, Ordering::AcqRel);
        assert!(!was_in_merge, "BUG: part {:?} is already in merge", pw.part);
    }
}

/// Appends the best parts to merge from `src` to `dst`.
fn append_parts_to_merge(
    mut dst: Vec<Arc<PartWrapper>>,
    src: Vec<Arc<PartWrapper>>,
    max_parts_to_merge: usize,
    max_out_items: u64,
) -> Vec<Arc<PartWrapper>> {
    let src = eligible_parts(src, max_out_items);
    let items: Vec<u64> = src.iter().map(|pw| pw.items()).collect();
    if let Some(window) = best_window(&items, max_parts_to_merge, max_out_items) {
        dst.extend(src[window].iter().cloned());
    }
    dst
}

/// Drops parts that alone fill half the output and sorts the rest by size.
fn eligible_parts(src: Vec<Arc<PartWrapper>>, max_out_items: u64) -> Vec<Arc<PartWrapper>> {
    // Parts that alone fill half the output aren't worth rewriting.
    let max_in_items = max_out_items / 2;
    let mut src: Vec<Arc<PartWrapper>> = src.into_iter().filter(|pw| pw.items() <= max_in_items).collect();
    src.sort_by_key(|pw| pw.items());
    src
}

/// Finds the window of `items`, sorted in ascending order, with the best
/// output to largest input ratio.
fn best_window(items: &[u64], max_parts_to_merge: usize, max_out_items: u64) -> Option<Range<usize>> {
    if items.len() < 2 {
        return None;
    }
    assert!(
        max_parts_to_merge >= 2,
        "BUG: max_parts_to_merge cannot be smaller than 2; got {}",
        max_parts_to_merge
    );

    let max_src_parts = max_parts_to_merge.min(items.len());
    let min_src_parts = max_src_parts.div_ceil(2).max(2);

    let mut best = None;
    let mut max_m = 0f64;
    for i in min_src_parts..=max_src_parts {
        for j in 0..=items.len() - i {
            let a = &items[j..j + i];
            let smallest = a[0];
            let largest = a[a.len() - 1];
            if smallest.saturating_mul(a.len() as u64) < largest {
                // Too unbalanced.
                continue;
            }
            let out_items: u64 = a.iter().sum();
            if out_items > max_out_items {
                // The remaining windows are bigger.
                break;
            }
            let m = out_items as f64 / largest.max(1) as f64;
            if m < max_m {
                continue;
            }
            max_m = m;
            best = Some(j..j + i);
        }
    }

    let min_m = (max_parts_to_merge as f64 / 2.0).max(MIN_MERGE_MULTIPLIER);
    if max_m < min_m {
        return None;
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::BlockCaches;
    use crate::config::CompressionType;
    use crate::part::{InmemoryBlock, InmemoryPart};

    fn parts(sizes: &[usize]) -> Vec<Arc<PartWrapper>> {
        let caches = Arc::new(BlockCaches::new(0, 0));
        sizes
            .iter()
            .map(|&n| {
                let mut ib = InmemoryBlock::new();
                for i in 0..n {
                    assert!(ib.add(format!("{:06}", i).as_bytes()));
                }
                let mp = InmemoryPart::from_block(&mut ib, CompressionType::None).unwrap();
                PartWrapper::new(Part::from_inmemory(&mp, Arc::clone(&caches)).unwrap())
            })
            .collect()
    }

    fn sizes(pws: &[Arc<PartWrapper>]) -> Vec<u64> {
        let mut s: Vec<u64> = pws.iter().map(|pw| pw.items()).collect();
        s.sort();
        s
    }

    #[test]
    fn test_no_merge_for_single_part() {
        let pws = parts(&[100]);
        assert!(parts_to_merge(&pws, 15, u64::MAX).is_empty());
    }

    #[test]
    fn test_equal_parts_are_merged() {
        let pws = parts(&[10, 10, 10, 10]);
        let picked = parts_to_merge(&pws, 4, u64::MAX);
        assert_eq!(sizes(&picked), vec![10, 10, 10, 10]);
        assert!(picked.iter().all(|pw| pw.in_merge.load(Ordering::Relaxed)));

        // Parts in merge are skipped.
        assert!(parts_to_merge(&pws, 4, u64::MAX).is_empty());
    }

    #[test]
    fn test_low_ratio_is_skipped() {
        // Merging 1 + 100 only rewrites the big part.
        let pws = parts(&[1, 100]);
        assert!(parts_to_merge(&pws, 15, u64::MAX).is_empty());
    }

    #[test]
    fn test_big_parts_are_excluded() {
        let pws = parts(&[10, 10, 10, 500]);
        let picked = parts_to_merge(&pws, 3, 100);
        assert_eq!(sizes(&picked), vec![10, 10, 10]);
        assert!(!pws[3].in_merge.load(Ordering::Relaxed));
    }

    #[test]
    fn test_output_ceiling() {
        let pws = parts(&[30, 30, 30]);
        assert!(parts_to_merge(&pws, 3, 50).is_empty());
        assert_eq!(sizes(&parts_to_merge(&pws, 3, 80)), vec![30, 30]);
    }

    #[test]
    fn test_prefers_similar_sizes() {
        let pws = parts(&[5, 5, 5, 5, 200, 210, 220]);
        let picked = parts_to_merge(&pws, 4, u64::MAX);
        assert_eq!(sizes(&picked), vec![5, 5, 5, 5]);
    }

    #[test]
    fn test_flush_joins_similar_parts() {
        let pws = parts(&[10, 12, 500]);
        let picked = parts_to_merge_with_flush(&pws, 11, u64::MAX);
        assert_eq!(sizes(&picked), vec![10, 12]);
        assert!(picked.iter().all(|pw| pw.in_merge.load(Ordering::Relaxed)));
        assert!(!pws[2].in_merge.load(Ordering::Relaxed));
    }

    #[test]
    fn test_flush_skips_unbalanced_parts() {
        let pws = parts(&[1000]);
        assert!(parts_to_merge_with_flush(&pws, 10, u64::MAX).is_empty());
        assert!(!pws[0].in_merge.load(Ordering::Relaxed));

        assert!(parts_to_merge_with_flush(&[], 10, u64::MAX).is_empty());
    }

    #[test]
    fn test_flush_skips_parts_in_merge() {
        let pws = parts(&[10, 10]);
        pws[0].in_merge.store(true, Ordering::Relaxed);
        pws[1].in_merge.store(true, Ordering::Relaxed);
        assert!(parts_to_merge_with_flush(&pws, 10, u64::MAX).is_empty());
    }

    #[test]
    fn test_flush_must_be_in_the_best_batch() {
        // Four equal parts merge better without the much smaller flush.
        let pws = parts(&[100, 100, 100, 100]);
        assert!(parts_to_merge_with_flush(&pws, 1, u64::MAX).is_empty());
        assert!(pws.iter().all(|pw| !pw.in_merge.load(Ordering::Relaxed)));
    }

    #[test]
    fn test_flush_respects_output_ceiling() {
        let pws = parts(&[30]);
        assert!(parts_to_merge_with_flush(&pws, 30, 50).is_empty());
        assert_eq!(sizes(&parts_to_merge_with_flush(&pws, 30, 80)), vec![30]);
    }
}
