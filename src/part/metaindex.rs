//! Metaindex rows: one per index block.

use crate::config::CompressionType;
use crate::encoding;
use crate::error::{Error, Result};

/// Maximum size of an unpacked index block.
pub const MAX_INDEX_BLOCK_SIZE: usize = 64 * 1024;

/// Locates one compressed index block in `index.bin`.
///
/// Format:
/// ```text
/// [first_item: bytes]
/// [block_headers_count: u32]
/// [index_block_offset: u64]
/// [index_block_size: u32]
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetaindexRow {
    /// First item of the first block in the index block.
    pub first_item: Vec<u8>,
    /// Number of block headers in the index block.
    pub block_headers_count: u32,
    /// Offset of the compressed index block.
    pub index_block_offset: u64,
    /// Size of the compressed index block.
    pub index_block_size: u32,
}

impl MetaindexRow {
    /// Appends the encoded row to `dst`.
    pub fn marshal(&self, dst: &mut Vec<u8>) {
        encoding::put_bytes(dst, &self.first_item);
        encoding::put_u32(dst, self.block_headers_count);
        encoding::put_u64(dst, self.index_block_offset);
        encoding::put_u32(dst, self.index_block_size);
    }

    /// Decodes a row from the head of `src` and returns the tail.
    pub fn unmarshal(src: &[u8]) -> Result<(Self, &[u8])> {
        let (first_item, src) = encoding::get_bytes(src)
            .map_err(|e| Error::corruption(format!("cannot unmarshal firstItem: {}", e)))?;
        let (block_headers_count, src) = encoding::get_u32(src)?;
        let (index_block_offset, src) = encoding::get_u64(src)?;
        let (index_block_size, src) = encoding::get_u32(src)?;

        if block_headers_count == 0 {
            return Err(Error::corruption("blockHeadersCount must be bigger than 0"));
        }
        if index_block_size as usize > 2 * MAX_INDEX_BLOCK_SIZE {
            return Err(Error::corruption(format!(
                "too big indexBlockSize; got {}; cannot exceed {}",
                index_block_size,
                2 * MAX_INDEX_BLOCK_SIZE
            )));
        }
        let mr = MetaindexRow {
            first_item: first_item.to_vec(),
            block_headers_count,
            index_block_offset,
            index_block_size,
        };
        Ok((mr, src))
    }
}

/// Decodes the whole compressed metaindex stream.
///
/// There must be at least one row and rows must be sorted by first item.
pub fn unmarshal_metaindex_rows(compressed: &[u8], codec: CompressionType) -> Result<Vec<MetaindexRow>> {
    let data = encoding::decompress(codec, compressed)
        .map_err(|e| Error::corruption(format!("cannot decompress metaindex: {}", e)))?;
    let mut src = &data[..];
    let mut mrs = Vec::new();
    while !src.is_empty() {
        let (mr, tail) = MetaindexRow::unmarshal(src).map_err(|e| {
            Error::corruption(format!("cannot unmarshal metaindexRow #{}: {}", mrs.len(), e))
        })?;
        mrs.push(mr);
        src = tail;
    }
    if mrs.is_empty() {
        return Err(Error::corruption("expecting non-zero metaindex rows; got zero"));
    }
    if !mrs.windows(2).all(|w| w[0].first_item <= w[1].first_item) {
        return Err(Error::corruption(format!(
            "metaindex rows must be sorted by firstItem; got {} unsorted rows",
            mrs.len()
        )));
    }
    Ok(mrs)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(first: &[u8], offset: u64) -> MetaindexRow {
        MetaindexRow {
            first_item: first.to_vec(),
            block_headers_count: 3,
            index_block_offset: offset,
            index_block_size: 512,
        }
    }

    #[test]
    fn test_marshal_unmarshal() {
        let mr = row(b"first", 1 << 40);
        let mut buf = Vec::new();
        mr.marshal(&mut buf);
        let (decoded, tail) = MetaindexRow::unmarshal(&buf).unwrap();
        assert_eq!(decoded, mr);
        assert!(tail.is_empty());
    }

    #[test]
    fn test_unmarshal_validation() {
        let mut mr = row(b"x", 0);
        mr.block_headers_count = 0;
        let mut buf = Vec::new();
        mr.marshal(&mut buf);
        assert!(MetaindexRow::unmarshal(&buf).is_err());

        let mut mr = row(b"x", 0);
        mr.index_block_size = (3 * MAX_INDEX_BLOCK_SIZE) as u32;
        buf.clear();
        mr.marshal(&mut buf);
        assert!(MetaindexRow::unmarshal(&buf).is_err());
    }

    #[test]
    fn test_unmarshal_metaindex_rows() {
        let mut buf = Vec::new();
        row(b"a", 0).marshal(&mut buf);
        row(b"m", 512).marshal(&mut buf);
        let packed = encoding::compress(CompressionType::Zstd, 1, &buf).unwrap();

        let mrs = unmarshal_metaindex_rows(&packed, CompressionType::Zstd).unwrap();
        assert_eq!(mrs.len(), 2);
        assert_eq!(mrs[1].index_block_offset, 512);
    }

    #[test]
    fn test_unmarshal_metaindex_rows_empty() {
        let packed = encoding::compress(CompressionType::Zstd, 1, &[]).unwrap();
        assert!(unmarshal_metaindex_rows(&packed, CompressionType::Zstd).is_err());
    }

    #[test]
    fn test_unmarshal_metaindex_rows_unsorted() {
        let mut buf = Vec::new();
        row(b"z", 0).marshal(&mut buf);
        row(b"a", 512).marshal(&mut buf);
        let packed = encoding::compress(CompressionType::None, 0, &buf).unwrap();
        let err = unmarshal_metaindex_rows(&packed, CompressionType::None).unwrap_err();
        assert!(err.to_string().contains("sorted"));
    }
}
