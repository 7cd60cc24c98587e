//! Sequential reader of part blocks, used as merge input.

use crate::config::CompressionType;
use crate::encoding;
use crate::error::{Error, Result};
use crate::fs::FileReader;
use crate::part::block_header::unmarshal_block_headers;
use crate::part::metaindex::unmarshal_metaindex_rows;
use crate::part::{
    BlockHeader, InmemoryBlock, InmemoryPart, MetaindexRow, PartHeader, StorageBlock,
    INDEX_FILENAME, ITEMS_FILENAME, LENS_FILENAME, METAINDEX_FILENAME,
};
use bytes::Buf;
use std::io::Read;
use std::path::Path;

type Source = Box<dyn Read + Send>;

/// Streams the blocks of a part in order.
///
/// Every block is checked against the part header: offsets must be
/// contiguous, and item and block counts plus the first and last item must
/// match once the stream ends.
pub struct BlockStreamReader {
    ph: PartHeader,
    name: String,

    mrs: Vec<MetaindexRow>,
    mr_idx: usize,
    bhs: Vec<BlockHeader>,
    bh_idx: usize,

    index: Source,
    items: Source,
    lens: Source,

    index_offset: u64,
    items_offset: u64,
    lens_offset: u64,
    items_read: u64,
    blocks_read: u64,
    first_item_checked: bool,

    block: InmemoryBlock,
    sb: StorageBlock,
    packed: Vec<u8>,

    /// Position of the next item of the current block to consume.
    pub(crate) block_item_idx: usize,
}

impl std::fmt::Debug for BlockStreamReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockStreamReader")
            .field("name", &self.name)
            .field("blocks_read", &self.blocks_read)
            .field("items_read", &self.items_read)
            .finish()
    }
}

impl BlockStreamReader {
    /// Reads a single raw block as a one-block stream. `ib` gets sorted.
    pub fn from_inmemory_block(ib: &mut InmemoryBlock, codec: CompressionType) -> Result<Self> {
        let mp = InmemoryPart::from_block(ib, codec)?;
        Self::from_inmemory_part(&mp)
    }

    /// Reads the blocks of an in-memory part.
    pub fn from_inmemory_part(mp: &InmemoryPart) -> Result<Self> {
        let mrs = unmarshal_metaindex_rows(&mp.metaindex, mp.ph.compression)?;
        Ok(Self::new(
            mp.ph.clone(),
            "in-memory part".to_string(),
            mrs,
            Box::new(mp.index.clone().reader()),
            Box::new(mp.items.clone().reader()),
            Box::new(mp.lens.clone().reader()),
        ))
    }

    /// Reads the blocks of the part stored in directory `path`.
    ///
    /// With `nocache` the region files are dropped from the OS page cache
    /// once read.
    pub fn open_file_part(path: &Path, nocache: bool) -> Result<Self> {
        let ph = PartHeader::read_metadata(path)?;
        let metaindex_path = path.join(METAINDEX_FILENAME);
        let metaindex = std::fs::read(&metaindex_path)
            .map_err(|e| Error::io_at(e, "read", &metaindex_path))?;
        let mrs = unmarshal_metaindex_rows(&metaindex, ph.compression).map_err(|e| {
            Error::corruption(format!("cannot read {}: {}", metaindex_path.display(), e))
        })?;

        let open = |name: &str| -> Result<Source> {
            let p = path.join(name);
            let r = FileReader::open(&p, nocache).map_err(|e| Error::io_at(e, "open", &p))?;
            Ok(Box::new(r))
        };
        let index = open(INDEX_FILENAME)?;
        let items = open(ITEMS_FILENAME)?;
        let lens = open(LENS_FILENAME)?;
        Ok(Self::new(ph, path.display().to_string(), mrs, index, items, lens))
    }

    fn new(
        ph: PartHeader,
        name: String,
        mrs: Vec<MetaindexRow>,
        index: Source,
        items: Source,
        lens: Source,
    ) -> Self {
        Self {
            ph,
            name,
            mrs,
            mr_idx: 0,
            bhs: Vec::new(),
            bh_idx: 0,
            index,
            items,
            lens,
            index_offset: 0,
            items_offset: 0,
            lens_offset: 0,
            items_read: 0,
            blocks_read: 0,
            first_item_checked: false,
            block: InmemoryBlock::new(),
            sb: StorageBlock::default(),
            packed: Vec::new(),
            block_item_idx: 0,
        }
    }

    /// Header of the part being read.
    pub fn header(&self) -> &PartHeader {
        &self.ph
    }

    /// The current block, valid after [`next_block`](Self::next_block)
    /// returned true.
    pub fn block(&self) -> &InmemoryBlock {
        &self.block
    }

    /// The item at the read position of the current block.
    pub(crate) fn current_item(&self) -> &[u8] {
        self.block.item(self.block_item_idx)
    }

    /// Advances to the next block. Returns false at the end of the stream.
    pub fn next_block(&mut self) -> Result<bool> {
        if self.bh_idx >= self.bhs.len() && !self.read_index_block()? {
            self.check_end()?;
            return Ok(false);
        }
        let bh = &self.bhs[self.bh_idx];
        self.bh_idx += 1;

        if bh.items_block_offset != self.items_offset {
            return Err(self.corruption(format!(
                "unexpected items block offset; got {}; want {}",
                bh.items_block_offset, self.items_offset
            )));
        }
        if bh.lens_block_offset != self.lens_offset {
            return Err(self.corruption(format!(
                "unexpected lens block offset; got {}; want {}",
                bh.lens_block_offset, self.lens_offset
            )));
        }

        self.sb.items_data.resize(bh.items_block_size as usize, 0);
        self.sb.lens_data.resize(bh.lens_block_size as usize, 0);
        read_region(&mut self.items, &mut self.sb.items_data)
            .map_err(|e| Error::corruption(format!("cannot read items block from {}: {}", self.name, e)))?;
        read_region(&mut self.lens, &mut self.sb.lens_data)
            .map_err(|e| Error::corruption(format!("cannot read lens block from {}: {}", self.name, e)))?;
        self.items_offset += bh.items_block_size as u64;
        self.lens_offset += bh.lens_block_size as u64;

        let bh = &self.bhs[self.bh_idx - 1];
        self.block
            .unmarshal_data(
                &self.sb,
                &bh.first_item,
                &bh.common_prefix,
                bh.items_count,
                bh.marshal_type,
                self.ph.compression,
            )
            .map_err(|e| Error::corruption(format!("cannot decode block from {}: {}", self.name, e)))?;
        self.block_item_idx = 0;
        self.items_read += self.block.len() as u64;
        self.blocks_read += 1;

        if self.items_read > self.ph.items_count {
            return Err(self.corruption(format!(
                "too many items read; got {}; cannot exceed {}",
                self.items_read, self.ph.items_count
            )));
        }
        if self.blocks_read > self.ph.blocks_count {
            return Err(self.corruption(format!(
                "too many blocks read; got {}; cannot exceed {}",
                self.blocks_read, self.ph.blocks_count
            )));
        }
        if !self.first_item_checked {
            self.first_item_checked = true;
            if self.block.item(0) != self.ph.first_item.as_slice() {
                return Err(self.corruption(format!(
                    "unexpected first item; got {}; want {}",
                    hex::encode(self.block.item(0)),
                    hex::encode(&self.ph.first_item)
                )));
            }
        }
        Ok(true)
    }

    fn read_index_block(&mut self) -> Result<bool> {
        if self.mr_idx >= self.mrs.len() {
            return Ok(false);
        }
        let mr = &self.mrs[self.mr_idx];
        self.mr_idx += 1;
        if mr.index_block_offset != self.index_offset {
            return Err(self.corruption(format!(
                "unexpected index block offset; got {}; want {}",
                mr.index_block_offset, self.index_offset
            )));
        }
        let count = mr.block_headers_count as usize;
        let size = mr.index_block_size;

        self.packed.resize(size as usize, 0);
        read_region(&mut self.index, &mut self.packed)
            .map_err(|e| Error::corruption(format!("cannot read index block from {}: {}", self.name, e)))?;
        self.index_offset += size as u64;

        let data = encoding::decompress(self.ph.compression, &self.packed)
            .map_err(|e| Error::corruption(format!("cannot decompress index block from {}: {}", self.name, e)))?;
        self.bhs = unmarshal_block_headers(&data, count)
            .map_err(|e| Error::corruption(format!("{}: {}", self.name, e)))?;
        self.bh_idx = 0;
        Ok(true)
    }

    fn check_end(&self) -> Result<()> {
        if self.items_read != self.ph.items_count {
            return Err(self.corruption(format!(
                "unexpected number of items read; got {}; want {}",
                self.items_read, self.ph.items_count
            )));
        }
        if self.blocks_read != self.ph.blocks_count {
            return Err(self.corruption(format!(
                "unexpected number of blocks read; got {}; want {}",
                self.blocks_read, self.ph.blocks_count
            )));
        }
        if self.blocks_read > 0 && self.block.item(self.block.len() - 1) != self.ph.last_item.as_slice() {
            return Err(self.corruption(format!(
                "unexpected last item; got {}; want {}",
                hex::encode(self.block.item(self.block.len() - 1)),
                hex::encode(&self.ph.last_item)
            )));
        }
        Ok(())
    }

    fn corruption(&self, msg: String) -> Error {
        Error::corruption(format!("{}: {}", self.name, msg))
    }
}

fn read_region(src: &mut Source, buf: &mut [u8]) -> std::io::Result<()> {
    src.read_exact(buf)
}
