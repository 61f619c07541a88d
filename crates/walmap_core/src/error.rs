//! Error types for walmap core.

use std::io;
use thiserror::Error;
use walmap_codec::CodecError;

/// Result type for store and map operations.
pub type CoreResult<T> = Result<T, StoreError>;

/// Errors that can occur in store and map operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The requested key is absent.
    #[error("key not found")]
    KeyNotFound,

    /// Operation invoked on a store that is not currently open.
    #[error("store is not loaded")]
    NotLoaded,

    /// Open called on a store that is already open.
    #[error("store is already loaded")]
    AlreadyLoaded,

    /// A key contains a forbidden control code point.
    #[error("invalid key: control character {code_point:?} at byte {position}")]
    InvalidKey {
        /// Byte offset of the offending code point within the key.
        position: usize,
        /// The offending code point.
        code_point: char,
    },

    /// The log header line does not match the required version string.
    #[error("invalid WAL header {found:?}, unsupported WAL file")]
    InvalidHeader {
        /// The header line actually present in the file.
        found: String,
    },

    /// A record header was shorter than three bytes or missing its
    /// separating space.
    #[error("malformed record at offset {offset}: {reason}")]
    MalformedRecord {
        /// Byte offset of the record within the log file.
        offset: u64,
        /// Description of the malformation.
        reason: String,
    },

    /// A value failed to encode or decode.
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// An underlying filesystem operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A map is already registered under this namespace.
    #[error("map {name:?} already exists")]
    MapAlreadyExists {
        /// The contested namespace.
        name: String,
    },

    /// The namespace was explicitly closed and cannot be registered again.
    #[error("map {name:?} was closed")]
    MapClosed {
        /// The closed namespace.
        name: String,
    },

    /// Shrink invoked while another shrink is active.
    #[error("shrink already in progress")]
    ShrinkInProgress,

    /// A store-level typed get found a value of an incompatible type.
    #[error("type mismatch for key {key:?}")]
    TypeMismatch {
        /// The key whose cached value has a different type.
        key: String,
    },
}

impl StoreError {
    /// Creates a malformed-record error.
    pub(crate) fn malformed_record(offset: u64, reason: impl Into<String>) -> Self {
        Self::MalformedRecord {
            offset,
            reason: reason.into(),
        }
    }
}
