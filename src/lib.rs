//! # mergeset - A Compacting Sorted-Byte-String Storage Engine
//!
//! mergeset stores arbitrary binary items sorted and deduplication-free. It
//! is meant as the backing store of an inverted index: items are appended in
//! large batches and looked up by exact value or by prefix.
//!
//! ## Architecture
//!
//! The storage engine consists of several key components:
//!
//! - **Block codec**: Prefix and delta compression of up to 64KB of sorted items
//! - **Parts**: Immutable sorted runs of blocks plus a two-level index
//! - **Merger**: K-way merge of block streams into a new part
//! - **Table**: Ingestion buffer, background merges and transactional part swaps
//! - **Search**: Cursors merging the items of every part in sorted order
//! - **Block Cache**: Caches decoded index and data blocks
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use mergeset::{Options, Table};
//!
//! # fn main() -> Result<(), mergeset::Error> {
//! // Open or create a table
//! let table = Table::open("./index", Options::default())?;
//!
//! // Write operations
//! table.add_items(&["tag:env=prod", "tag:env=dev", "metric:cpu"])?;
//! table.debug_flush()?;
//!
//! // Read operations
//! let mut ts = table.search();
//! if ts.first_item_with_prefix(b"tag:env=")? {
//!     println!("Found: {:?}", ts.item());
//! }
//!
//! table.close()?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

// Module declarations
pub mod cache;
pub mod config;
pub mod encoding;
pub mod error;
pub mod fs;
pub mod merge;
pub mod part;
pub mod table;

// Re-exports
pub use cache::BlockCaches;
pub use config::{CompressionType, FlushCallback, Options, PrepareBlock};
pub use error::{Error, Result};
pub use part::search::CachePredicate;
pub use table::{Table, TableMetrics, TableSearch};
