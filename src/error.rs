//! Error types for the mergeset storage engine.

use std::io;

/// The result type used throughout mergeset.
pub type Result<T> = std::result::Result<T, Error>;

/// The error type for mergeset operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// An I/O error occurred.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Data corruption was detected while decoding a part.
    ///
    /// Also returned when a decoded block holds unsorted items. Background
    /// merges that hit it log the error and abort the process.
    #[error("Data corruption: {0}")]
    Corruption(String),

    /// The requested table or file was not found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// An invalid argument was provided.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// A single item exceeds the maximum block payload.
    #[error("Item too large: {len} bytes exceeds the limit of {max} bytes")]
    ItemTooLarge {
        /// Length of the rejected item.
        len: usize,
        /// Maximum allowed item length.
        max: usize,
    },

    /// A serialization or deserialization error occurred.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Compressing or decompressing a region failed.
    #[error("Compression error: {0}")]
    Compression(String),

    /// The destination already exists.
    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// The table is in read-only mode because free disk space ran low.
    #[error("Read-only: {0}")]
    ReadOnly(String),

    /// A merge observed the stop signal and was abandoned.
    ///
    /// This is not a failure: the table is shutting down.
    #[error("Merge forcibly stopped")]
    ForciblyStopped,

    /// An internal error occurred.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Creates a new corruption error.
    pub fn corruption(msg: impl Into<String>) -> Self {
        Error::Corruption(msg.into())
    }

    /// Creates a new not found error.
    pub fn not_found(msg: impl Into<String>) -> Self {
        Error::NotFound(msg.into())
    }

    /// Creates a new invalid argument error.
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Error::InvalidArgument(msg.into())
    }

    /// Creates a new compression error.
    pub fn compression(msg: impl Into<String>) -> Self {
        Error::Compression(msg.into())
    }

    /// Creates a new internal error.
    pub fn internal(msg: impl Into<String>) -> Self {
        Error::Internal(msg.into())
    }

    /// Creates a new read-only error.
    pub fn read_only(msg: impl Into<String>) -> Self {
        Error::ReadOnly(msg.into())
    }

    /// Returns true if the error is the stop outcome of a cancelled merge.
    pub fn is_forcibly_stopped(&self) -> bool {
        matches!(self, Error::ForciblyStopped)
    }

    /// Wraps an I/O error with the path it was raised for.
    pub(crate) fn io_at(err: io::Error, what: &str, path: &std::path::Path) -> Self {
        Error::Io(io::Error::new(
            err.kind(),
            format!("cannot {} {}: {}", what, path.display(), err),
        ))
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}
