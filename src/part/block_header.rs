//! Per-block metadata stored in index blocks.

use crate::encoding;
use crate::error::{Error, Result};
use crate::part::block::{MarshalType, MAX_INMEMORY_BLOCK_SIZE, MAX_ITEMS_PER_BLOCK};

/// Header of a single block, persisted in `index.bin`.
///
/// Format:
/// ```text
/// [common_prefix: bytes]
/// [first_item: bytes]
/// [marshal_type: u8]
/// [items_count: u32]
/// [items_block_offset: u64]
/// [lens_block_offset: u64]
/// [items_block_size: u32]
/// [lens_block_size: u32]
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlockHeader {
    /// Prefix shared by every item of the block.
    pub common_prefix: Vec<u8>,
    /// Smallest item of the block.
    pub first_item: Vec<u8>,
    /// Encoding of the items and lens regions.
    pub marshal_type: MarshalType,
    /// Number of items, including the first one.
    pub items_count: u32,
    /// Offset of the items region in `items.bin`.
    pub items_block_offset: u64,
    /// Offset of the lens region in `lens.bin`.
    pub lens_block_offset: u64,
    /// Size of the items region.
    pub items_block_size: u32,
    /// Size of the lens region.
    pub lens_block_size: u32,
}

impl BlockHeader {
    /// Appends the encoded header to `dst`.
    pub fn marshal(&self, dst: &mut Vec<u8>) {
        encoding::put_bytes(dst, &self.common_prefix);
        encoding::put_bytes(dst, &self.first_item);
        dst.push(self.marshal_type as u8);
        encoding::put_u32(dst, self.items_count);
        encoding::put_u64(dst, self.items_block_offset);
        encoding::put_u64(dst, self.lens_block_offset);
        encoding::put_u32(dst, self.items_block_size);
        encoding::put_u32(dst, self.lens_block_size);
    }

    /// Decodes a header from the head of `src` and returns the tail.
    pub fn unmarshal(src: &[u8]) -> Result<(Self, &[u8])> {
        let (common_prefix, src) = encoding::get_bytes(src)
            .map_err(|e| Error::corruption(format!("cannot unmarshal commonPrefix: {}", e)))?;
        let (first_item, src) = encoding::get_bytes(src)
            .map_err(|e| Error::corruption(format!("cannot unmarshal firstItem: {}", e)))?;
        let Some((&mt, src)) = src.split_first() else {
            return Err(Error::corruption("cannot unmarshal marshalType from zero bytes"));
        };
        let marshal_type = MarshalType::from_u8(mt)?;
        let (items_count, src) = encoding::get_u32(src)?;
        let (items_block_offset, src) = encoding::get_u64(src)?;
        let (lens_block_offset, src) = encoding::get_u64(src)?;
        let (items_block_size, src) = encoding::get_u32(src)?;
        let (lens_block_size, src) = encoding::get_u32(src)?;

        if items_count == 0 {
            return Err(Error::corruption("itemsCount must be bigger than 0"));
        }
        if items_count as usize > MAX_ITEMS_PER_BLOCK {
            return Err(Error::corruption(format!(
                "too big itemsCount; got {}; cannot exceed {}",
                items_count, MAX_ITEMS_PER_BLOCK
            )));
        }
        if items_block_size as usize > 2 * MAX_INMEMORY_BLOCK_SIZE {
            return Err(Error::corruption(format!(
                "too big itemsBlockSize; got {}; cannot exceed {}",
                items_block_size,
                2 * MAX_INMEMORY_BLOCK_SIZE
            )));
        }
        if lens_block_size as usize > 2 * 8 * MAX_INMEMORY_BLOCK_SIZE {
            return Err(Error::corruption(format!(
                "too big lensBlockSize; got {}; cannot exceed {}",
                lens_block_size,
                2 * 8 * MAX_INMEMORY_BLOCK_SIZE
            )));
        }
        if !first_item.starts_with(common_prefix) {
            return Err(Error::corruption(format!(
                "firstItem {} doesn't start with commonPrefix {}",
                hex::encode(first_item),
                hex::encode(common_prefix)
            )));
        }

        let bh = BlockHeader {
            common_prefix: common_prefix.to_vec(),
            first_item: first_item.to_vec(),
            marshal_type,
            items_count,
            items_block_offset,
            lens_block_offset,
            items_block_size,
            lens_block_size,
        };
        Ok((bh, src))
    }
}

/// Decodes exactly `count` headers from an unpacked index block.
///
/// The headers must be sorted by first item and must consume all of `src`.
pub fn unmarshal_block_headers(mut src: &[u8], count: usize) -> Result<Vec<BlockHeader>> {
    assert!(count > 0, "BUG: block headers count must be greater than 0");
    let mut bhs = Vec::with_capacity(count);
    for i in 0..count {
        let (bh, tail) = BlockHeader::unmarshal(src).map_err(|e| {
            Error::corruption(format!("cannot unmarshal block header #{} out of {}: {}", i, count, e))
        })?;
        bhs.push(bh);
        src = tail;
    }
    if !src.is_empty() {
        return Err(Error::corruption(format!(
            "unexpected non-zero tail left after unmarshaling {} block headers; len(tail)={}",
            count,
            src.len()
        )));
    }
    if !bhs.windows(2).all(|w| w[0].first_item <= w[1].first_item) {
        return Err(Error::corruption(format!(
            "block headers must be sorted by firstItem; got {} unsorted headers",
            count
        )));
    }
    Ok(bhs)
}
