//! In-memory and storage representations of a block of items.
//!
//! An [`InmemoryBlock`] holds up to 64KB of item bytes. Before it is
//! written, items are sorted and the longest prefix shared by all of them is
//! stripped. The remaining suffixes are encoded into a [`StorageBlock`]:
//!
//! ```text
//! Compressed form (MarshalType::Compressed):
//!   itemsData = compress(suffix bytes not shared with the previous item)
//!   lensData  = compress([prefixLen_i ^ prefixLen_{i-1}: uvarint] * (n-1)
//!                        [itemLen_i ^ itemLen_{i-1}: uvarint] * (n-1))
//!
//! Plain form (MarshalType::Plain):
//!   itemsData = items[1..] without the common prefix, concatenated
//!   lensData  = [itemLen: u64] * (n-1)
//! ```
//!
//! The first item is never stored in the block: it lives in the
//! [`BlockHeader`](super::BlockHeader).

use crate::config::CompressionType;
use crate::encoding::{self, common_prefix_len};
use crate::error::{Error, Result};
use crate::part::BlockHeader;
use std::cmp::Ordering;
use std::fmt::Write as _;

/// Maximum number of item bytes in a block.
///
/// Small enough to keep a decoded block in the CPU cache.
pub const MAX_INMEMORY_BLOCK_SIZE: usize = 64 * 1024;

/// Maximum number of items in a block.
///
/// Bounds the lens region of blocks made of empty or tiny items: the plain
/// form spends 8 bytes per item regardless of the item size.
pub const MAX_ITEMS_PER_BLOCK: usize = MAX_INMEMORY_BLOCK_SIZE;

/// Blocks whose prefix-stripped payload is smaller than this are stored plain.
const MIN_COMPRESSIBLE_SIZE: usize = 64;

/// Encoding of a block's storage regions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum MarshalType {
    /// Item bytes with fixed 8-byte lengths, no compression.
    #[default]
    Plain = 0,
    /// Delta-encoded suffixes and lengths, compressed with the part codec.
    Compressed = 1,
}

impl MarshalType {
    /// Convert from u8
    pub fn from_u8(value: u8) -> Result<Self> {
        match value {
            0 => Ok(MarshalType::Plain),
            1 => Ok(MarshalType::Compressed),
            _ => Err(Error::corruption(format!(
                "marshal type must be in the range [0..1]; got {}",
                value
            ))),
        }
    }
}

/// Location of one item inside `InmemoryBlock::data`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Item {
    start: u32,
    end: u32,
}

impl Item {
    #[inline]
    fn bytes<'a>(&self, data: &'a [u8]) -> &'a [u8] {
        &data[self.start as usize..self.end as usize]
    }

    #[inline]
    fn suffix<'a>(&self, data: &'a [u8], skip: usize) -> &'a [u8] {
        &data[self.start as usize + skip..self.end as usize]
    }
}

/// Encoded form of a block: the items and lens regions.
#[derive(Debug, Default, Clone)]
pub struct StorageBlock {
    /// Item suffix bytes.
    pub items_data: Vec<u8>,
    /// Item lengths.
    pub lens_data: Vec<u8>,
}

impl StorageBlock {
    /// Clears both regions, keeping their allocations.
    pub fn reset(&mut self) {
        self.items_data.clear();
        self.lens_data.clear();
    }
}

/// A bounded batch of items plus the prefix they all share.
#[derive(Debug, Default, Clone)]
pub struct InmemoryBlock {
    common_prefix: Vec<u8>,
    data: Vec<u8>,
    items: Vec<Item>,
}

impl InmemoryBlock {
    /// Creates an empty block.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of items in the block.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Returns true if the block has no items.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Returns the i-th item.
    pub fn item(&self, i: usize) -> &[u8] {
        self.items[i].bytes(&self.data)
    }

    /// Iterates over the items in block order.
    pub fn iter(&self) -> impl Iterator<Item = &[u8]> + '_ {
        self.items.iter().map(move |it| it.bytes(&self.data))
    }

    /// Prefix shared by every item, valid after sorting or decoding.
    pub fn common_prefix(&self) -> &[u8] {
        &self.common_prefix
    }

    /// Total length of the item bytes.
    pub fn data_len(&self) -> usize {
        self.data.len()
    }

    /// Approximate heap footprint, used for cache accounting.
    pub fn size_bytes(&self) -> usize {
        std::mem::size_of::<Self>()
            + self.common_prefix.capacity()
            + self.data.capacity()
            + self.items.capacity() * std::mem::size_of::<Item>()
    }

    /// Appends `x` to the block.
    ///
    /// Returns false without modifying the block if `x` doesn't fit or the
    /// block already holds [`MAX_ITEMS_PER_BLOCK`] items.
    pub fn add(&mut self, x: &[u8]) -> bool {
        if x.len() + self.data.len() > MAX_INMEMORY_BLOCK_SIZE {
            return false;
        }
        if self.items.len() >= MAX_ITEMS_PER_BLOCK {
            return false;
        }
        if self.data.capacity() == 0 {
            self.data.reserve_exact(MAX_INMEMORY_BLOCK_SIZE);
            self.items.reserve(512);
        }
        let start = self.data.len() as u32;
        self.data.extend_from_slice(x);
        self.items.push(Item { start, end: self.data.len() as u32 });
        true
    }

    /// Removes all items, keeping the allocations.
    pub fn reset(&mut self) {
        self.common_prefix.clear();
        self.data.clear();
        self.items.clear();
    }

    /// Returns true if the items are in non-decreasing order.
    pub fn is_sorted(&self) -> bool {
        let cp_len = self.common_prefix.len();
        let data = &self.data;
        self.items
            .windows(2)
            .all(|w| w[0].suffix(data, cp_len) <= w[1].suffix(data, cp_len))
    }

    /// Sorts the items and refreshes the common prefix.
    pub fn sort_items(&mut self) {
        self.common_prefix.clear();
        if self.is_sorted() {
            self.update_common_prefix_sorted();
            return;
        }
        self.update_common_prefix_unsorted();
        let cp_len = self.common_prefix.len();
        let data = &self.data;
        self.items
            .sort_unstable_by(|a, b| a.suffix(data, cp_len).cmp(b.suffix(data, cp_len)));
    }

    fn update_common_prefix_sorted(&mut self) {
        self.common_prefix.clear();
        if self.items.len() <= 1 {
            // A prefix for a single item only grows the block header.
            return;
        }
        let first = self.items[0].bytes(&self.data);
        let last = self.items[self.items.len() - 1].bytes(&self.data);
        let n = common_prefix_len(first, last);
        self.common_prefix.extend_from_slice(&first[..n]);
    }

    fn update_common_prefix_unsorted(&mut self) {
        self.common_prefix.clear();
        let Some(first) = self.items.first() else {
            return;
        };
        let data = &self.data;
        let mut cp = first.bytes(data);
        for it in &self.items[1..] {
            let item = it.bytes(data);
            if item.starts_with(cp) {
                continue;
            }
            cp = &cp[..common_prefix_len(cp, item)];
            if cp.is_empty() {
                return;
            }
        }
        self.common_prefix.extend_from_slice(cp);
    }

    /// Sorts the items and encodes them into `sb`.
    pub fn marshal_unsorted_data(
        &mut self,
        sb: &mut StorageBlock,
        codec: CompressionType,
        level: i32,
    ) -> Result<BlockHeader> {
        self.sort_items();
        self.marshal_data(sb, codec, level)
    }

    /// Encodes already sorted items into `sb`.
    ///
    /// # Panics
    ///
    /// Panics if the items aren't sorted: merge inputs are sorted by
    /// construction, so an unsorted block here means a bug upstream.
    pub fn marshal_sorted_data(
        &mut self,
        sb: &mut StorageBlock,
        codec: CompressionType,
        level: i32,
    ) -> Result<BlockHeader> {
        self.common_prefix.clear();
        assert!(
            self.is_sorted(),
            "BUG: {} items must be sorted; items:\n{}",
            self.items.len(),
            self.debug_items_string()
        );
        self.update_common_prefix_sorted();
        self.marshal_data(sb, codec, level)
    }

    fn marshal_data(
        &self,
        sb: &mut StorageBlock,
        codec: CompressionType,
        level: i32,
    ) -> Result<BlockHeader> {
        assert!(!self.items.is_empty(), "BUG: cannot marshal an empty block");

        let data = &self.data;
        let cp_len = self.common_prefix.len();
        let first_item = self.items[0].bytes(data);
        let mut bh = BlockHeader {
            common_prefix: self.common_prefix.clone(),
            first_item: first_item.to_vec(),
            items_count: self.items.len() as u32,
            ..BlockHeader::default()
        };

        let raw_size = data.len() - cp_len * self.items.len();
        if raw_size < MIN_COMPRESSIBLE_SIZE || self.items.len() < 2 {
            self.marshal_data_plain(sb);
            bh.marshal_type = MarshalType::Plain;
            return Ok(bh);
        }

        let mut items_buf = Vec::with_capacity(raw_size);
        let mut xs = Vec::with_capacity(self.items.len() - 1);
        let mut prev_item = &first_item[cp_len..];
        let mut prev_prefix_len = 0u64;
        for it in &self.items[1..] {
            let item = it.suffix(data, cp_len);
            let prefix_len = common_prefix_len(prev_item, item);
            items_buf.extend_from_slice(&item[prefix_len..]);
            xs.push(prefix_len as u64 ^ prev_prefix_len);
            prev_item = item;
            prev_prefix_len = prefix_len as u64;
        }
        let mut lens_buf = Vec::with_capacity(xs.len() * 4);
        encoding::put_uvarints(&mut lens_buf, &xs);

        xs.clear();
        let mut prev_len = (first_item.len() - cp_len) as u64;
        for it in &self.items[1..] {
            let item_len = (it.end - it.start) as u64 - cp_len as u64;
            xs.push(item_len ^ prev_len);
            prev_len = item_len;
        }
        encoding::put_uvarints(&mut lens_buf, &xs);

        sb.items_data = encoding::compress(codec, level, &items_buf)?;
        if sb.items_data.len() as f64 > 0.9 * raw_size as f64 {
            // Poor ratio. The plain form is cheaper to decode.
            self.marshal_data_plain(sb);
            bh.marshal_type = MarshalType::Plain;
            return Ok(bh);
        }
        sb.lens_data = encoding::compress(codec, level, &lens_buf)?;
        bh.marshal_type = MarshalType::Compressed;
        Ok(bh)
    }

    fn marshal_data_plain(&self, sb: &mut StorageBlock) {
        let data = &self.data;
        let cp_len = self.common_prefix.len();
        sb.reset();
        for it in &self.items[1..] {
            sb.items_data.extend_from_slice(it.suffix(data, cp_len));
        }
        for it in &self.items[1..] {
            encoding::put_u64(&mut sb.lens_data, (it.end - it.start) as u64 - cp_len as u64);
        }
    }

    /// Decodes `items_count` items from `sb`, replacing the block contents.
    ///
    /// Fails if the regions are malformed or the decoded items aren't sorted.
    pub fn unmarshal_data(
        &mut self,
        sb: &StorageBlock,
        first_item: &[u8],
        common_prefix: &[u8],
        items_count: u32,
        mt: MarshalType,
        codec: CompressionType,
    ) -> Result<()> {
        self.reset();
        if items_count == 0 {
            return Err(Error::corruption("cannot unmarshal zero items"));
        }
        if !first_item.starts_with(common_prefix) {
            return Err(Error::corruption(format!(
                "first item {} doesn't start with common prefix {}",
                hex::encode(first_item),
                hex::encode(common_prefix)
            )));
        }
        self.common_prefix.extend_from_slice(common_prefix);

        match mt {
            MarshalType::Plain => self
                .unmarshal_data_plain(sb, first_item, items_count)
                .map_err(|e| Error::corruption(format!("cannot unmarshal plain data: {}", e)))?,
            MarshalType::Compressed => {
                self.unmarshal_data_compressed(sb, first_item, items_count, codec)?
            }
        }
        if !self.is_sorted() {
            return Err(Error::corruption(format!(
                "decoded block contains unsorted items; items:\n{}",
                self.debug_items_string()
            )));
        }
        Ok(())
    }

    fn unmarshal_data_compressed(
        &mut self,
        sb: &StorageBlock,
        first_item: &[u8],
        items_count: u32,
        codec: CompressionType,
    ) -> Result<()> {
        let n = items_count as usize;
        let cp = self.common_prefix.clone();

        let lens_buf = encoding::decompress(codec, &sb.lens_data)
            .map_err(|e| Error::corruption(format!("cannot decompress lensData: {}", e)))?;
        let mut xs = vec![0u64; n - 1];

        let tail = encoding::get_uvarints(&mut xs, &lens_buf)
            .map_err(|e| Error::corruption(format!("cannot unmarshal prefix lens: {}", e)))?;
        let mut prefix_lens = vec![0u64; n];
        for (i, &x) in xs.iter().enumerate() {
            prefix_lens[i + 1] = x ^ prefix_lens[i];
        }

        let tail = encoding::get_uvarints(&mut xs, tail)
            .map_err(|e| Error::corruption(format!("cannot unmarshal item lens: {}", e)))?;
        if !tail.is_empty() {
            return Err(Error::corruption(format!(
                "unexpected tail left unmarshaling {} lens; tail size={}",
                n,
                tail.len()
            )));
        }
        let mut lens = vec![0u64; n];
        lens[0] = (first_item.len() - cp.len()) as u64;
        let mut data_len = (cp.len() * n) as u64 + lens[0];
        for (i, &x) in xs.iter().enumerate() {
            lens[i + 1] = x ^ lens[i];
            data_len = data_len.saturating_add(lens[i + 1]);
        }
        if data_len > 2 * MAX_INMEMORY_BLOCK_SIZE as u64 {
            return Err(Error::corruption(format!(
                "decoded block size {} exceeds {} bytes",
                data_len,
                2 * MAX_INMEMORY_BLOCK_SIZE
            )));
        }

        let suffixes = encoding::decompress(codec, &sb.items_data)
            .map_err(|e| Error::corruption(format!("cannot decompress itemsData: {}", e)))?;

        // Sized exactly: decoded blocks are never appended to, and may be cached.
        let mut data = Vec::with_capacity(data_len as usize);
        data.extend_from_slice(first_item);
        self.items.reserve_exact(n);
        self.items.push(Item { start: 0, end: data.len() as u32 });

        let mut b = &suffixes[..];
        let mut prev_start = cp.len();
        for i in 1..n {
            let item_len = lens[i];
            let prefix_len = prefix_lens[i];
            if prefix_len > item_len {
                return Err(Error::corruption(format!(
                    "prefixLen={} exceeds itemLen={}",
                    prefix_len, item_len
                )));
            }
            let suffix_len = (item_len - prefix_len) as usize;
            if b.len() < suffix_len {
                return Err(Error::corruption(format!(
                    "not enough data for decoding item from itemsData; want {} bytes; remained {} bytes",
                    suffix_len,
                    b.len()
                )));
            }
            let prev_len = data.len() - prev_start;
            if prefix_len as usize > prev_len {
                return Err(Error::corruption(format!(
                    "prefixLen cannot exceed {}; got {}",
                    prev_len, prefix_len
                )));
            }
            let start = data.len();
            data.extend_from_slice(&cp);
            data.extend_from_within(prev_start..prev_start + prefix_len as usize);
            data.extend_from_slice(&b[..suffix_len]);
            self.items.push(Item { start: start as u32, end: data.len() as u32 });
            b = &b[suffix_len..];
            prev_start = start + cp.len();
        }
        if !b.is_empty() {
            return Err(Error::corruption(format!(
                "unexpected tail left after itemsData with len {}",
                b.len()
            )));
        }
        if data.len() as u64 != data_len {
            return Err(Error::corruption(format!(
                "unexpected data len; got {}; want {}",
                data.len(),
                data_len
            )));
        }
        self.data = data;
        Ok(())
    }

    fn unmarshal_data_plain(
        &mut self,
        sb: &StorageBlock,
        first_item: &[u8],
        items_count: u32,
    ) -> Result<()> {
        let n = items_count as usize;
        let cp_len = self.common_prefix.len();

        let mut lens = Vec::with_capacity(n);
        lens.push((first_item.len() - cp_len) as u64);
        let mut b = &sb.lens_data[..];
        for _ in 1..n {
            let (len, tail) = encoding::get_u64(b)?;
            lens.push(len);
            b = tail;
        }
        if !b.is_empty() {
            return Err(Error::corruption(format!(
                "unexpected tail left after lensData with len {}",
                b.len()
            )));
        }

        let data_len = first_item.len() + sb.items_data.len() + cp_len * (n - 1);
        let mut data = Vec::with_capacity(data_len);
        data.extend_from_slice(first_item);
        self.items.reserve_exact(n);
        self.items.push(Item { start: 0, end: data.len() as u32 });

        let mut b = &sb.items_data[..];
        for &item_len in &lens[1..] {
            if (b.len() as u64) < item_len {
                return Err(Error::corruption(format!(
                    "not enough data for decoding item from itemsData; want {} bytes; remained {} bytes",
                    item_len,
                    b.len()
                )));
            }
            let item_len = item_len as usize;
            let start = data.len();
            data.extend_from_slice(&self.common_prefix);
            data.extend_from_slice(&b[..item_len]);
            self.items.push(Item { start: start as u32, end: data.len() as u32 });
            b = &b[item_len..];
        }
        if !b.is_empty() {
            return Err(Error::corruption(format!(
                "unexpected tail left after itemsData with len {}",
                b.len()
            )));
        }
        self.data = data;
        Ok(())
    }

    /// Returns the index of the first item >= `k`, or `len()` if none.
    ///
    /// Items must be sorted. `k` is compared only past the part of the
    /// common prefix it shares with the block.
    pub fn search(&self, k: &[u8]) -> usize {
        self.search_from(0, self.items.len(), k)
    }

    /// Same as [`search`](Self::search), restricted to `items[from..to]`.
    pub(crate) fn search_from(&self, from: usize, to: usize, k: &[u8]) -> usize {
        let cp_len = common_prefix_len(&self.common_prefix, k);
        let suffix = &k[cp_len..];
        let data = &self.data;
        from + self.items[from..to].partition_point(|it| it.suffix(data, cp_len) < suffix)
    }

    /// Compares `k` with the i-th item, skipping the shared prefix.
    pub(crate) fn cmp_item(&self, i: usize, k: &[u8]) -> Ordering {
        let cp_len = common_prefix_len(&self.common_prefix, k);
        self.items[i].suffix(&self.data, cp_len).cmp(&k[cp_len..])
    }

    /// Copies the items out, for handing to a prepare-block hook.
    pub(crate) fn to_vecs(&self) -> Vec<Vec<u8>> {
        self.iter().map(|b| b.to_vec()).collect()
    }

    /// Replaces the contents with `items`, which must fit the block.
    pub(crate) fn set_items(&mut self, items: &[Vec<u8>]) {
        self.reset();
        for item in items {
            assert!(
                self.add(item),
                "BUG: prepared items exceed the block limits of {} bytes and {} items",
                MAX_INMEMORY_BLOCK_SIZE,
                MAX_ITEMS_PER_BLOCK
            );
        }
    }

    fn debug_items_string(&self) -> String {
        let mut s = String::new();
        let mut prev: &[u8] = &[];
        for (i, item) in self.iter().enumerate() {
            if item < prev {
                s.push_str("!!! the next item is smaller than the previous item !!!\n");
            }
            let _ = writeln!(s, "{:05} {}", i, hex::encode(item));
            prev = item;
        }
        s
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn block_of(items: &[&[u8]]) -> InmemoryBlock {
        let mut ib = InmemoryBlock::new();
        for item in items {
            assert!(ib.add(item));
        }
        ib
    }

    fn round_trip(ib: &mut InmemoryBlock, codec: CompressionType) -> (InmemoryBlock, MarshalType) {
        let mut sb = StorageBlock::default();
        let bh = ib.marshal_unsorted_data(&mut sb, codec, 1).unwrap();
        let mut out = InmemoryBlock::new();
        out.unmarshal_data(&sb, &bh.first_item, &bh.common_prefix, bh.items_count, bh.marshal_type, codec)
            .unwrap();
        (out, bh.marshal_type)
    }

    #[test]
    fn test_add_respects_block_size() {
        let mut ib = InmemoryBlock::new();
        let big = vec![b'x'; MAX_INMEMORY_BLOCK_SIZE - 10];
        assert!(ib.add(&big));
        assert!(!ib.add(&[b'y'; 11]));
        assert!(ib.add(&[b'z'; 10]));
        assert_eq!(ib.len(), 2);
        assert_eq!(ib.data_len(), MAX_INMEMORY_BLOCK_SIZE);
    }

    #[test]
    fn test_add_respects_items_count() {
        let mut ib = InmemoryBlock::new();
        for _ in 0..MAX_ITEMS_PER_BLOCK {
            assert!(ib.add(b""));
        }
        assert!(!ib.add(b""));
        assert!(!ib.add(b"x"));
        assert_eq!(ib.len(), MAX_ITEMS_PER_BLOCK);
    }

    #[test]
    fn test_full_block_of_empty_items_fits_header_bounds() {
        for codec in [CompressionType::None, CompressionType::Zstd] {
            let mut ib = InmemoryBlock::new();
            while ib.add(b"") {}
            let mut sb = StorageBlock::default();
            let mut bh = ib.marshal_unsorted_data(&mut sb, codec, 1).unwrap();
            assert_eq!(bh.items_count as usize, MAX_ITEMS_PER_BLOCK);
            bh.items_block_size = sb.items_data.len() as u32;
            bh.lens_block_size = sb.lens_data.len() as u32;

            let mut buf = Vec::new();
            bh.marshal(&mut buf);
            let (decoded, _) = BlockHeader::unmarshal(&buf).unwrap();

            let mut out = InmemoryBlock::new();
            out.unmarshal_data(
                &sb,
                &decoded.first_item,
                &decoded.common_prefix,
                decoded.items_count,
                decoded.marshal_type,
                codec,
            )
            .unwrap();
            assert_eq!(out.len(), MAX_ITEMS_PER_BLOCK);
            assert!(out.iter().all(|item| item.is_empty()));
        }
    }

    #[test]
    fn test_full_block_of_one_byte_items_fits_header_bounds() {
        let mut ib = InmemoryBlock::new();
        let mut i = 0u32;
        while ib.add(&[(i % 7) as u8]) {
            i += 1;
        }
        assert_eq!(ib.len(), MAX_ITEMS_PER_BLOCK);
        let mut sb = StorageBlock::default();
        let mut bh = ib.marshal_unsorted_data(&mut sb, CompressionType::None, 1).unwrap();
        bh.items_block_size = sb.items_data.len() as u32;
        bh.lens_block_size = sb.lens_data.len() as u32;
        let mut buf = Vec::new();
        bh.marshal(&mut buf);
        let (decoded, _) = BlockHeader::unmarshal(&buf).unwrap();
        assert_eq!(decoded.items_count as usize, MAX_ITEMS_PER_BLOCK);
    }

    #[test]
    fn test_sort_items_and_common_prefix() {
        let mut ib = block_of(&[b"prefix:c", b"prefix:a", b"prefix:b"]);
        assert!(!ib.is_sorted());
        ib.sort_items();
        assert!(ib.is_sorted());
        assert_eq!(ib.common_prefix(), b"prefix:");
        let items: Vec<&[u8]> = ib.iter().collect();
        assert_eq!(items, vec![&b"prefix:a"[..], b"prefix:b", b"prefix:c"]);
    }

    #[test]
    fn test_single_item_has_no_common_prefix() {
        let mut ib = block_of(&[b"lonely"]);
        ib.sort_items();
        assert!(ib.common_prefix().is_empty());
    }

    #[test]
    fn test_small_block_is_plain() {
        let mut ib = block_of(&[b"b", b"a", b"c"]);
        let (out, mt) = round_trip(&mut ib, CompressionType::Zstd);
        assert_eq!(mt, MarshalType::Plain);
        assert_eq!(out.to_vecs(), vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]);
    }

    #[test]
    fn test_compressible_block() {
        let mut ib = InmemoryBlock::new();
        for i in (0..1500).rev() {
            assert!(ib.add(format!("metric_name{{job=\"api\",instance=\"{:05}\"}}", i).as_bytes()));
        }
        let (out, mt) = round_trip(&mut ib, CompressionType::Zstd);
        assert_eq!(mt, MarshalType::Compressed);
        assert_eq!(out.len(), 1500);
        assert_eq!(out.item(0), b"metric_name{job=\"api\",instance=\"00000\"}");
        assert_eq!(out.item(1499), b"metric_name{job=\"api\",instance=\"01499\"}");
        assert_eq!(out.common_prefix(), b"metric_name{job=\"api\",instance=\"0");
    }

    #[test]
    fn test_incompressible_block_falls_back_to_plain() {
        use rand::{Rng, SeedableRng};
        let mut rng = rand::rngs::StdRng::seed_from_u64(7);
        let mut ib = InmemoryBlock::new();
        for _ in 0..200 {
            let item: Vec<u8> = (0..64).map(|_| rng.random()).collect();
            assert!(ib.add(&item));
        }
        let mut expected = ib.to_vecs();
        expected.sort();
        let (out, mt) = round_trip(&mut ib, CompressionType::Zstd);
        assert_eq!(mt, MarshalType::Plain);
        assert_eq!(out.to_vecs(), expected);
    }

    #[test]
    fn test_duplicates_survive() {
        let mut ib = InmemoryBlock::new();
        for _ in 0..100 {
            assert!(ib.add(b"same-item-over-and-over"));
        }
        let (out, _) = round_trip(&mut ib, CompressionType::Zstd);
        assert_eq!(out.len(), 100);
        assert!(out.iter().all(|it| it == b"same-item-over-and-over"));
    }

    #[test]
    fn test_unsorted_plain_data_is_corruption() {
        let mut ib = block_of(&[b"a", b"b", b"c"]);
        let mut sb = StorageBlock::default();
        let bh = ib.marshal_sorted_data(&mut sb, CompressionType::None, 0).unwrap();
        assert_eq!(bh.marshal_type, MarshalType::Plain);

        // Swap the stored "b" and "c".
        sb.items_data = b"cb".to_vec();
        let mut out = InmemoryBlock::new();
        let err = out
            .unmarshal_data(&sb, &bh.first_item, &bh.common_prefix, 3, MarshalType::Plain, CompressionType::None)
            .unwrap_err();
        assert!(matches!(err, Error::Corruption(_)));
        assert!(err.to_string().contains("unsorted"));
    }

    #[test]
    fn test_truncated_lens_is_corruption() {
        let mut ib = block_of(&[b"a", b"b", b"c"]);
        let mut sb = StorageBlock::default();
        let bh = ib.marshal_sorted_data(&mut sb, CompressionType::None, 0).unwrap();
        sb.lens_data.truncate(12);
        let mut out = InmemoryBlock::new();
        assert!(out
            .unmarshal_data(&sb, &bh.first_item, &bh.common_prefix, 3, MarshalType::Plain, CompressionType::None)
            .is_err());
    }

    #[test]
    #[should_panic(expected = "must be sorted")]
    fn test_marshal_sorted_data_rejects_unsorted() {
        let mut ib = block_of(&[b"b", b"a"]);
        let mut sb = StorageBlock::default();
        let _ = ib.marshal_sorted_data(&mut sb, CompressionType::Zstd, 1);
    }

    #[test]
    fn test_search() {
        let mut ib = block_of(&[b"key:1", b"key:3", b"key:5", b"key:7"]);
        ib.sort_items();
        assert_eq!(ib.search(b""), 0);
        assert_eq!(ib.search(b"key:0"), 0);
        assert_eq!(ib.search(b"key:3"), 1);
        assert_eq!(ib.search(b"key:4"), 2);
        assert_eq!(ib.search(b"key:7"), 3);
        assert_eq!(ib.search(b"key:8"), 4);
        assert_eq!(ib.search(b"kez"), 4);
        assert_eq!(ib.search(b"a"), 0);
        assert_eq!(ib.search_from(2, 4, b"key:1"), 2);
        assert_eq!(ib.cmp_item(1, b"key:3"), Ordering::Equal);
        assert_eq!(ib.cmp_item(1, b"key:2"), Ordering::Greater);
    }

    proptest! {
        #[test]
        fn prop_round_trip(mut items in prop::collection::vec(prop::collection::vec(any::<u8>(), 0..40), 1..300)) {
            items.sort();
            let mut ib = InmemoryBlock::new();
            for item in &items {
                prop_assert!(ib.add(item));
            }
            for codec in [CompressionType::Zstd, CompressionType::None] {
                let mut sb = StorageBlock::default();
                let bh = ib.marshal_sorted_data(&mut sb, codec, 1).unwrap();
                let mut out = InmemoryBlock::new();
                out.unmarshal_data(&sb, &bh.first_item, &bh.common_prefix, bh.items_count, bh.marshal_type, codec).unwrap();
                prop_assert_eq!(out.to_vecs(), items.clone());
            }
        }

        #[test]
        fn prop_shared_prefix_round_trip(suffixes in prop::collection::vec("[a-c]{0,12}", 2..500)) {
            let mut items: Vec<Vec<u8>> = suffixes.iter().map(|s| format!("tag=value/{}", s).into_bytes()).collect();
            let mut ib = InmemoryBlock::new();
            for item in &items {
                prop_assert!(ib.add(item));
            }
            items.sort();
            let mut sb = StorageBlock::default();
            let bh = ib.marshal_unsorted_data(&mut sb, CompressionType::Zstd, -5).unwrap();
            let mut out = InmemoryBlock::new();
            out.unmarshal_data(&sb, &bh.first_item, &bh.common_prefix, bh.items_count, bh.marshal_type, CompressionType::Zstd).unwrap();
            prop_assert_eq!(out.to_vecs(), items);
        }
    }
}
