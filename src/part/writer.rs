//! Sequential writer of part blocks.

use crate::config::CompressionType;
use crate::encoding;
use crate::error::{Error, Result};
use crate::fs::{self, FileWriter};
use crate::part::{
    InmemoryBlock, InmemoryPart, MetaindexRow, PartHeader, StorageBlock, INDEX_FILENAME,
    ITEMS_FILENAME, LENS_FILENAME, MAX_INDEX_BLOCK_SIZE, METAINDEX_FILENAME,
};
use bytes::BytesMut;
use std::io::Write;
use std::path::{Path, PathBuf};

/// Destination of one part region.
enum Sink {
    Memory(BytesMut),
    File(FileWriter),
}

impl Sink {
    fn create(path: &Path, nocache: bool) -> Result<Self> {
        let w = FileWriter::create(path, nocache).map_err(|e| Error::io_at(e, "create", path))?;
        Ok(Sink::File(w))
    }

    fn write_all(&mut self, data: &[u8]) -> Result<()> {
        match self {
            Sink::Memory(buf) => {
                buf.extend_from_slice(data);
                Ok(())
            }
            Sink::File(w) => w.write_all(data).map_err(|e| Error::io_at(e, "write", w.path())),
        }
    }

    fn finish(self) -> Result<Option<BytesMut>> {
        match self {
            Sink::Memory(buf) => Ok(Some(buf)),
            Sink::File(w) => {
                let path = w.path().to_path_buf();
                w.finish().map_err(|e| Error::io_at(e, "sync", &path))?;
                Ok(None)
            }
        }
    }
}

/// Writes sorted blocks into a new part, either in memory or on disk.
///
/// Blocks must be written in ascending order. The writer tracks the part
/// header as blocks arrive; call [`finish`](Self::finish) or
/// [`finish_inmemory`](Self::finish_inmemory) to complete the part.
pub struct BlockStreamWriter {
    codec: CompressionType,
    level: i32,
    path: Option<PathBuf>,

    metaindex: Sink,
    index: Sink,
    items: Sink,
    lens: Sink,

    items_offset: u64,
    lens_offset: u64,
    index_offset: u64,

    ph: PartHeader,
    sb: StorageBlock,
    unpacked_index_block: Vec<u8>,
    unpacked_metaindex: Vec<u8>,
    mr: MetaindexRow,
    mr_first_item_caught: bool,
}

impl BlockStreamWriter {
    /// Creates a writer backed by memory buffers.
    pub fn new_inmemory(codec: CompressionType, level: i32) -> Self {
        let sink = || Sink::Memory(BytesMut::new());
        Self::with_sinks(codec, level, None, sink(), sink(), sink(), sink())
    }

    /// Creates a writer for a new part directory at `path`.
    ///
    /// With `nocache` the items, lens and index files bypass the OS page
    /// cache; the metaindex is always cached since every open reads it.
    pub fn create_file_part(
        path: &Path,
        nocache: bool,
        codec: CompressionType,
        level: i32,
    ) -> Result<Self> {
        fs::mkdir_fail_if_exist(path).map_err(|e| Error::io_at(e, "create", path))?;
        let metaindex = Sink::create(&path.join(METAINDEX_FILENAME), false)?;
        let index = Sink::create(&path.join(INDEX_FILENAME), nocache)?;
        let items = Sink::create(&path.join(ITEMS_FILENAME), nocache)?;
        let lens = Sink::create(&path.join(LENS_FILENAME), nocache)?;
        Ok(Self::with_sinks(codec, level, Some(path.to_path_buf()), metaindex, index, items, lens))
    }

    fn with_sinks(
        codec: CompressionType,
        level: i32,
        path: Option<PathBuf>,
        metaindex: Sink,
        index: Sink,
        items: Sink,
        lens: Sink,
    ) -> Self {
        Self {
            codec,
            level,
            path,
            metaindex,
            index,
            items,
            lens,
            items_offset: 0,
            lens_offset: 0,
            index_offset: 0,
            ph: PartHeader { compression: codec, ..PartHeader::default() },
            sb: StorageBlock::default(),
            unpacked_index_block: Vec::new(),
            unpacked_metaindex: Vec::new(),
            mr: MetaindexRow::default(),
            mr_first_item_caught: false,
        }
    }

    /// Header of the blocks written so far.
    pub fn header(&self) -> &PartHeader {
        &self.ph
    }

    /// Encodes `ib` and appends it to the part.
    ///
    /// The items of `ib` must be sorted and not smaller than the items of
    /// the previously written block.
    pub fn write_block(&mut self, ib: &mut InmemoryBlock) -> Result<()> {
        if ib.is_empty() {
            return Ok(());
        }
        let mut bh = ib.marshal_sorted_data(&mut self.sb, self.codec, self.level)?;
        debug_assert!(
            self.ph.items_count == 0 || self.ph.last_item.as_slice() <= ib.item(0),
            "BUG: blocks must be written in ascending order"
        );

        if self.ph.items_count == 0 {
            self.ph.first_item = bh.first_item.clone();
        }
        self.ph.last_item.clear();
        self.ph.last_item.extend_from_slice(ib.item(ib.len() - 1));
        self.ph.items_count += ib.len() as u64;
        self.ph.blocks_count += 1;

        if !self.mr_first_item_caught {
            self.mr.first_item = bh.first_item.clone();
            self.mr_first_item_caught = true;
        }

        bh.items_block_offset = self.items_offset;
        bh.items_block_size = self.sb.items_data.len() as u32;
        self.items.write_all(&self.sb.items_data)?;
        self.items_offset += self.sb.items_data.len() as u64;

        bh.lens_block_offset = self.lens_offset;
        bh.lens_block_size = self.sb.lens_data.len() as u32;
        self.lens.write_all(&self.sb.lens_data)?;
        self.lens_offset += self.sb.lens_data.len() as u64;

        bh.marshal(&mut self.unpacked_index_block);
        self.mr.block_headers_count += 1;
        if self.unpacked_index_block.len() >= MAX_INDEX_BLOCK_SIZE {
            self.flush_index_data()?;
        }
        Ok(())
    }

    fn flush_index_data(&mut self) -> Result<()> {
        if self.unpacked_index_block.is_empty() {
            return Ok(());
        }
        let packed = encoding::compress(self.codec, 0, &self.unpacked_index_block)?;
        self.index.write_all(&packed)?;

        self.mr.index_block_offset = self.index_offset;
        self.mr.index_block_size = packed.len() as u32;
        self.index_offset += packed.len() as u64;
        self.mr.marshal(&mut self.unpacked_metaindex);

        self.mr = MetaindexRow::default();
        self.mr_first_item_caught = false;
        self.unpacked_index_block.clear();
        Ok(())
    }

    fn close(mut self) -> Result<(PartHeader, Option<PathBuf>, [Option<BytesMut>; 4])> {
        self.flush_index_data()?;
        let packed = encoding::compress(self.codec, 0, &self.unpacked_metaindex)?;
        self.metaindex.write_all(&packed)?;

        let regions = [
            self.metaindex.finish()?,
            self.index.finish()?,
            self.items.finish()?,
            self.lens.finish()?,
        ];
        Ok((self.ph, self.path, regions))
    }

    /// Completes a file part: flushes the regions and writes its metadata.
    ///
    /// A part without items gets no metadata; the caller discards it.
    pub fn finish(self) -> Result<PartHeader> {
        let (ph, path, _) = self.close()?;
        let Some(path) = path else {
            return Err(Error::internal("finish called on an in-memory writer"));
        };
        if ph.items_count > 0 {
            ph.write_metadata(&path)?;
        }
        fs::sync_path(&path).map_err(|e| Error::io_at(e, "sync", &path))?;
        Ok(ph)
    }

    /// Completes an in-memory part.
    pub fn finish_inmemory(self) -> Result<InmemoryPart> {
        let (ph, _, regions) = self.close()?;
        let [Some(metaindex), Some(index), Some(items), Some(lens)] = regions else {
            return Err(Error::internal("finish_inmemory called on a file writer"));
        };
        Ok(InmemoryPart {
            ph,
            metaindex: metaindex.freeze(),
            index: index.freeze(),
            items: items.freeze(),
            lens: lens.freeze(),
        })
    }
}
