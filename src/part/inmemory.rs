//! Parts held entirely in memory.

use crate::config::CompressionType;
use crate::encoding;
use crate::error::{Error, Result};
use crate::fs::{self, FileWriter};
use crate::part::{
    BlockStreamWriter, InmemoryBlock, PartHeader, INDEX_FILENAME, ITEMS_FILENAME, LENS_FILENAME,
    METAINDEX_FILENAME,
};
use bytes::Bytes;
use std::io::Write;
use std::path::Path;

/// A complete part whose regions live in memory buffers.
///
/// Produced by flushing raw items; either merged further or stored to disk
/// as-is.
#[derive(Debug, Clone, Default)]
pub struct InmemoryPart {
    /// Part summary.
    pub ph: PartHeader,
    /// Compressed metaindex.
    pub metaindex: Bytes,
    /// Compressed index blocks.
    pub index: Bytes,
    /// Item regions.
    pub items: Bytes,
    /// Length regions.
    pub lens: Bytes,
}

impl InmemoryPart {
    /// Builds a single-block part from `ib`, sorting it first.
    pub fn from_block(ib: &mut InmemoryBlock, codec: CompressionType) -> Result<Self> {
        ib.sort_items();
        let level = encoding::compress_level_for_items(ib.len() as u64);
        let mut bsw = BlockStreamWriter::new_inmemory(codec, level);
        bsw.write_block(ib)?;
        bsw.finish_inmemory()
    }

    /// Total size of the regions in bytes.
    pub fn size(&self) -> u64 {
        (self.metaindex.len() + self.index.len() + self.items.len() + self.lens.len()) as u64
    }

    /// Writes the part into a new directory at `path`.
    pub fn store_to_disk(&self, path: &Path) -> Result<()> {
        fs::mkdir_fail_if_exist(path).map_err(|e| Error::io_at(e, "create", path))?;
        for (name, data) in [
            (METAINDEX_FILENAME, &self.metaindex),
            (INDEX_FILENAME, &self.index),
            (ITEMS_FILENAME, &self.items),
            (LENS_FILENAME, &self.lens),
        ] {
            let file_path = path.join(name);
            let mut w = FileWriter::create(&file_path, false)
                .map_err(|e| Error::io_at(e, "create", &file_path))?;
            w.write_all(data).map_err(|e| Error::io_at(e, "write", &file_path))?;
            w.finish().map_err(|e| Error::io_at(e, "sync", &file_path))?;
        }
        self.ph.write_metadata(path)?;
        fs::sync_path(path).map_err(|e| Error::io_at(e, "sync", path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::part::{BlockStreamReader, METADATA_FILENAME};
    use tempfile::TempDir;

    #[test]
    fn test_from_block() {
        let mut ib = InmemoryBlock::new();
        for item in [&b"c"[..], b"a", b"b", b"a"] {
            assert!(ib.add(item));
        }
        let mp = InmemoryPart::from_block(&mut ib, CompressionType::Zstd).unwrap();
        assert_eq!(mp.ph.items_count, 4);
        assert_eq!(mp.ph.blocks_count, 1);
        assert_eq!(mp.ph.first_item, b"a");
        assert_eq!(mp.ph.last_item, b"c");
        assert!(mp.size() > 0);

        let mut bsr = BlockStreamReader::from_inmemory_part(&mp).unwrap();
        assert!(bsr.next_block().unwrap());
        assert_eq!(bsr.block().to_vecs(), vec![b"a".to_vec(), b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]);
        assert!(!bsr.next_block().unwrap());
    }

    #[test]
    fn test_store_to_disk() {
        let dir = TempDir::new().unwrap();
        let mut ib = InmemoryBlock::new();
        for i in 0..1000 {
            assert!(ib.add(format!("key-{}", i).as_bytes()));
        }
        let mp = InmemoryPart::from_block(&mut ib, CompressionType::None).unwrap();
        let path = dir.path().join("part");
        mp.store_to_disk(&path).unwrap();

        for name in [METADATA_FILENAME, METAINDEX_FILENAME, INDEX_FILENAME, ITEMS_FILENAME, LENS_FILENAME] {
            assert!(path.join(name).exists(), "missing {}", name);
        }
        assert_eq!(PartHeader::read_metadata(&path).unwrap(), mp.ph);
        assert_eq!(std::fs::read(path.join(ITEMS_FILENAME)).unwrap(), mp.items.to_vec());

        // The target directory must not exist.
        assert!(mp.store_to_disk(&path).is_err());
    }
}
