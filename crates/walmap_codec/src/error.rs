//! Error types for value encoding and decoding.

use thiserror::Error;

/// Result type for codec operations.
pub type CodecResult<T> = Result<T, CodecError>;

/// Errors that can occur while encoding or decoding values.
#[derive(Debug, Error)]
pub enum CodecError {
    /// The value failed to serialize.
    #[error("encode failed: {0}")]
    Encode(#[source] serde_json::Error),

    /// Stored bytes failed to deserialize into the requested type.
    #[error("decode failed: {0}")]
    Decode(#[source] serde_json::Error),

    /// The encoded form contained a newline byte.
    ///
    /// The log is line-framed, so an encoder emitting `\n` would corrupt
    /// record boundaries. Such encodings are rejected rather than escaped.
    #[error("encoded value contains a newline at byte {position}")]
    EmbeddedNewline {
        /// Byte offset of the first newline in the encoded output.
        position: usize,
    },
}
