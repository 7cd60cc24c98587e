//! Immutable sorted parts and their on-disk format.
//!
//! A part is a sorted run of items split into blocks:
//!
//! ```text
//! <part dir>/
//!   metadata.json   PartHeader
//!   metaindex.bin   compressed MetaindexRow stream, one row per index block
//!   index.bin       compressed index blocks of BlockHeaders
//!   items.bin       per-block item regions
//!   lens.bin        per-block length regions
//! ```
//!
//! Parts are written once by a [`BlockStreamWriter`] and never modified.

pub mod block;
pub mod block_header;
pub mod header;
pub mod inmemory;
pub mod metaindex;
pub mod reader;
pub mod search;
pub mod writer;

pub use block::{InmemoryBlock, MarshalType, StorageBlock, MAX_INMEMORY_BLOCK_SIZE, MAX_ITEMS_PER_BLOCK};
pub use block_header::BlockHeader;
pub use header::{PartHeader, METADATA_FILENAME};
pub use inmemory::InmemoryPart;
pub use metaindex::{MetaindexRow, MAX_INDEX_BLOCK_SIZE};
pub use reader::BlockStreamReader;
pub use search::PartSearch;
pub use writer::BlockStreamWriter;

use crate::cache::BlockCaches;
use crate::encoding;
use crate::error::{Error, Result};
use crate::fs::{ReadAt, ReadAtFile};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// File holding the compressed metaindex.
pub const METAINDEX_FILENAME: &str = "metaindex.bin";
/// File holding the compressed index blocks.
pub const INDEX_FILENAME: &str = "index.bin";
/// File holding the item regions.
pub const ITEMS_FILENAME: &str = "items.bin";
/// File holding the length regions.
pub const LENS_FILENAME: &str = "lens.bin";

/// The decoded block headers of one index block.
#[derive(Debug, Default)]
pub struct IndexBlock {
    /// Headers sorted by first item.
    pub bhs: Vec<BlockHeader>,
}

impl IndexBlock {
    /// Approximate heap footprint, used for cache accounting.
    pub fn size_bytes(&self) -> usize {
        std::mem::size_of::<Self>()
            + self
                .bhs
                .iter()
                .map(|bh| {
                    std::mem::size_of::<BlockHeader>()
                        + bh.common_prefix.capacity()
                        + bh.first_item.capacity()
                })
                .sum::<usize>()
    }
}

/// An opened part: its header, metaindex and random access to its regions.
///
/// Decoded blocks are served through the shared [`BlockCaches`]; the part's
/// entries are evicted when the part is dropped.
pub struct Part {
    id: u64,
    ph: PartHeader,
    path: Option<PathBuf>,
    size: u64,
    mrs: Vec<MetaindexRow>,
    index: Box<dyn ReadAt>,
    items: Box<dyn ReadAt>,
    lens: Box<dyn ReadAt>,
    caches: Arc<BlockCaches>,
}

impl std::fmt::Debug for Part {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Part")
            .field("id", &self.id)
            .field("path", &self.path)
            .field("items_count", &self.ph.items_count)
            .field("blocks_count", &self.ph.blocks_count)
            .field("size", &self.size)
            .finish()
    }
}

impl Part {
    /// Opens the part stored in directory `path`.
    pub fn open(path: &Path, caches: Arc<BlockCaches>) -> Result<Self> {
        let ph = PartHeader::read_metadata(path)?;

        let metaindex_path = path.join(METAINDEX_FILENAME);
        let metaindex = std::fs::read(&metaindex_path)
            .map_err(|e| Error::io_at(e, "read", &metaindex_path))?;
        let mrs = metaindex::unmarshal_metaindex_rows(&metaindex, ph.compression).map_err(|e| {
            Error::corruption(format!("cannot read {}: {}", metaindex_path.display(), e))
        })?;

        let open = |name: &str, nocache: bool| -> Result<ReadAtFile> {
            let p = path.join(name);
            ReadAtFile::open(&p, nocache).map_err(|e| Error::io_at(e, "open", &p))
        };
        // Items and lens are read once per data block cache miss.
        let index = open(INDEX_FILENAME, false)?;
        let items = open(ITEMS_FILENAME, true)?;
        let lens = open(LENS_FILENAME, true)?;

        let size = metaindex.len() as u64 + index.size() + items.size() + lens.size();
        Ok(Self {
            id: caches.next_part_id(),
            ph,
            path: Some(path.to_path_buf()),
            size,
            mrs,
            index: Box::new(index),
            items: Box::new(items),
            lens: Box::new(lens),
            caches,
        })
    }

    /// Opens a part over the buffers of an in-memory part.
    pub fn from_inmemory(mp: &InmemoryPart, caches: Arc<BlockCaches>) -> Result<Self> {
        mp.ph.validate()?;
        let mrs = metaindex::unmarshal_metaindex_rows(&mp.metaindex, mp.ph.compression)?;
        Ok(Self {
            id: caches.next_part_id(),
            ph: mp.ph.clone(),
            path: None,
            size: mp.size(),
            mrs,
            index: Box::new(mp.index.clone()),
            items: Box::new(mp.items.clone()),
            lens: Box::new(mp.lens.clone()),
            caches,
        })
    }

    /// Process-unique id used in cache keys.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The part header.
    pub fn header(&self) -> &PartHeader {
        &self.ph
    }

    /// Directory of the part, `None` for in-memory parts.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Total size of the part regions in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Number of items in the part.
    pub fn items_count(&self) -> u64 {
        self.ph.items_count
    }

    /// Number of blocks in the part.
    pub fn blocks_count(&self) -> u64 {
        self.ph.blocks_count
    }

    pub(crate) fn metaindex(&self) -> &[MetaindexRow] {
        &self.mrs
    }

    pub(crate) fn caches(&self) -> &BlockCaches {
        &self.caches
    }

    /// Reads and decodes the index block referenced by `mr`.
    pub(crate) fn read_index_block(&self, mr: &MetaindexRow) -> Result<IndexBlock> {
        let mut packed = vec![0u8; mr.index_block_size as usize];
        self.index
            .read_at(&mut packed, mr.index_block_offset)
            .map_err(|e| self.read_error("index block", mr.index_block_offset, e))?;
        let data = encoding::decompress(self.ph.compression, &packed).map_err(|e| {
            Error::corruption(format!(
                "cannot decompress index block at offset {} in {}: {}",
                mr.index_block_offset,
                self.describe(),
                e
            ))
        })?;
        let bhs = block_header::unmarshal_block_headers(&data, mr.block_headers_count as usize)
            .map_err(|e| Error::corruption(format!("{}: {}", self.describe(), e)))?;
        Ok(IndexBlock { bhs })
    }

    /// Reads and decodes the data block described by `bh`.
    pub(crate) fn read_data_block(&self, bh: &BlockHeader) -> Result<InmemoryBlock> {
        let mut sb = StorageBlock {
            items_data: vec![0u8; bh.items_block_size as usize],
            lens_data: vec![0u8; bh.lens_block_size as usize],
        };
        self.items
            .read_at(&mut sb.items_data, bh.items_block_offset)
            .map_err(|e| self.read_error("items block", bh.items_block_offset, e))?;
        self.lens
            .read_at(&mut sb.lens_data, bh.lens_block_offset)
            .map_err(|e| self.read_error("lens block", bh.lens_block_offset, e))?;

        let mut ib = InmemoryBlock::new();
        ib.unmarshal_data(
            &sb,
            &bh.first_item,
            &bh.common_prefix,
            bh.items_count,
            bh.marshal_type,
            self.ph.compression,
        )
        .map_err(|e| {
            Error::corruption(format!(
                "cannot decode block at items offset {} in {}: {}",
                bh.items_block_offset,
                self.describe(),
                e
            ))
        })?;
        Ok(ib)
    }

    fn read_error(&self, what: &str, offset: u64, err: std::io::Error) -> Error {
        if err.kind() == std::io::ErrorKind::UnexpectedEof {
            return Error::corruption(format!(
                "{} at offset {} is out of bounds in {}",
                what,
                offset,
                self.describe()
            ));
        }
        Error::Io(std::io::Error::new(
            err.kind(),
            format!("cannot read {} at offset {} in {}: {}", what, offset, self.describe(), err),
        ))
    }

    fn describe(&self) -> String {
        match &self.path {
            Some(p) => p.display().to_string(),
            None => format!("in-memory part #{}", self.id),
        }
    }
}

impl Drop for Part {
    fn drop(&mut self) {
        self.caches.remove_part(self.id);
    }
}
