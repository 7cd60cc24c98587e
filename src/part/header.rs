//! Whole-part summary persisted as `metadata.json`.

use crate::config::CompressionType;
use crate::error::{Error, Result};
use crate::fs;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Name of the metadata file inside a part directory.
pub const METADATA_FILENAME: &str = "metadata.json";

/// Summary of a part: counts, item range and codec.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PartHeader {
    /// Number of items in the part.
    pub items_count: u64,
    /// Number of blocks in the part.
    pub blocks_count: u64,
    /// Smallest item.
    pub first_item: Vec<u8>,
    /// Largest item.
    pub last_item: Vec<u8>,
    /// Codec used for every compressed region of the part.
    pub compression: CompressionType,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct PartHeaderJson {
    items_count: u64,
    blocks_count: u64,
    first_item: String,
    last_item: String,
    #[serde(default = "default_compression")]
    compression: u8,
}

fn default_compression() -> u8 {
    CompressionType::Zstd as u8
}

impl PartHeader {
    /// Clears the header for reuse.
    pub fn reset(&mut self) {
        self.items_count = 0;
        self.blocks_count = 0;
        self.first_item.clear();
        self.last_item.clear();
    }

    /// Checks the count invariants of a non-empty part.
    pub fn validate(&self) -> Result<()> {
        if self.items_count == 0 {
            return Err(Error::corruption("part cannot contain zero items"));
        }
        if self.blocks_count == 0 {
            return Err(Error::corruption("part cannot contain zero blocks"));
        }
        if self.blocks_count > self.items_count {
            return Err(Error::corruption(format!(
                "the number of blocks cannot exceed the number of items; got blocksCount={}, itemsCount={}",
                self.blocks_count, self.items_count
            )));
        }
        if self.first_item > self.last_item {
            return Err(Error::corruption(format!(
                "firstItem={} cannot be bigger than lastItem={}",
                hex::encode(&self.first_item),
                hex::encode(&self.last_item)
            )));
        }
        Ok(())
    }

    /// Serializes the header to JSON.
    pub fn to_json(&self) -> Result<Vec<u8>> {
        let phj = PartHeaderJson {
            items_count: self.items_count,
            blocks_count: self.blocks_count,
            first_item: hex::encode(&self.first_item),
            last_item: hex::encode(&self.last_item),
            compression: self.compression as u8,
        };
        Ok(serde_json::to_vec(&phj)?)
    }

    /// Parses and validates a header from JSON.
    pub fn from_json(data: &[u8]) -> Result<Self> {
        let phj: PartHeaderJson = serde_json::from_slice(data)?;
        let decode = |field: &str, s: &str| {
            hex::decode(s).map_err(|e| {
                Error::Serialization(format!("cannot decode {} {:?} from hex: {}", field, s, e))
            })
        };
        let compression = CompressionType::from_u8(phj.compression).ok_or_else(|| {
            Error::corruption(format!("unsupported compression type {}", phj.compression))
        })?;
        let ph = PartHeader {
            items_count: phj.items_count,
            blocks_count: phj.blocks_count,
            first_item: decode("FirstItem", &phj.first_item)?,
            last_item: decode("LastItem", &phj.last_item)?,
            compression,
        };
        ph.validate()?;
        Ok(ph)
    }

    /// Reads `metadata.json` from `part_path`.
    pub fn read_metadata(part_path: &Path) -> Result<Self> {
        let path = part_path.join(METADATA_FILENAME);
        let data = std::fs::read(&path).map_err(|e| Error::io_at(e, "read", &path))?;
        Self::from_json(&data).map_err(|e| match e {
            Error::Io(e) => Error::Io(e),
            other => Error::corruption(format!("invalid {}: {}", path.display(), other)),
        })
    }

    /// Writes `metadata.json` into `part_path` atomically.
    pub fn write_metadata(&self, part_path: &Path) -> Result<()> {
        let path = part_path.join(METADATA_FILENAME);
        let data = self.to_json()?;
        fs::write_atomic(&path, &data).map_err(|e| Error::io_at(e, "write", &path))
    }
}
