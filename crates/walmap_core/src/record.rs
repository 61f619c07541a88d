//! Log record framing.
//!
//! ## Record format
//!
//! ```text
//! go-persist 1\n            header line, written once per file
//! S <key>\n<value>\n        set record
//! D <key>\n\n               delete record (empty value line)
//! ```
//!
//! The trailing newline of the value line is the marker that the record
//! was completely written. A trailing record missing either newline is
//! incomplete: recovery stops cleanly before it.
//!
//! ## Recovery policy
//!
//! The reader distinguishes tolerated from fatal conditions:
//!
//! - **Tolerated** (treated as end of log): an incomplete trailing record,
//!   whether the header line or the value line was cut short.
//! - **Fatal** (`MalformedRecord`): a header shorter than three bytes, a
//!   missing space separator, or a key that is not valid UTF-8.
//!
//! An unknown op byte is neither: the record is well-formed and is
//! surfaced to the caller, which logs and skips it.

use std::io::BufRead;

use crate::error::{CoreResult, StoreError};

/// Identification string written at the beginning of each log file.
pub const WAL_HEADER: &str = "go-persist 1";

/// Operation byte of a log record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    /// Set a key to a value.
    Set,
    /// Delete a key.
    Delete,
}

impl Op {
    /// Converts the operation to its on-disk byte.
    #[must_use]
    pub const fn as_byte(self) -> u8 {
        match self {
            Self::Set => b'S',
            Self::Delete => b'D',
        }
    }

    /// Converts an on-disk byte to an operation.
    #[must_use]
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            b'S' => Some(Self::Set),
            b'D' => Some(Self::Delete),
            _ => None,
        }
    }
}

/// A raw record as read back from the log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawRecord {
    /// Operation byte; may be an op this version does not recognize.
    pub op: u8,
    /// Full key, including any namespace prefix.
    pub key: String,
    /// Encoded value bytes; empty for delete records.
    pub value: Vec<u8>,
}

/// Builds the two-line on-disk image of a record.
///
/// The image is assembled into one buffer so callers can append it with a
/// single write call, minimizing (not eliminating) torn writes at the OS
/// layer.
#[must_use]
pub fn encode_record(op: Op, key: &str, value: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(key.len() + value.len() + 4);
    buf.push(op.as_byte());
    buf.push(b' ');
    buf.extend_from_slice(key.as_bytes());
    buf.push(b'\n');
    buf.extend_from_slice(value);
    buf.push(b'\n');
    buf
}

/// Streaming reader over log records.
///
/// Tracks the byte offset of each record so malformations can be reported
/// precisely.
pub struct RecordReader<R> {
    reader: R,
    offset: u64,
}

impl<R: BufRead> RecordReader<R> {
    /// Creates a reader positioned at a record boundary.
    ///
    /// `offset` is the byte position of the underlying source, used only
    /// for error reporting.
    pub fn new(reader: R, offset: u64) -> Self {
        Self { reader, offset }
    }

    /// Reads the next record.
    ///
    /// Returns `Ok(None)` at the end of the log, including when the log
    /// ends in an incomplete record.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::MalformedRecord`] for a header that is too
    /// short, lacks its space separator, or carries a non-UTF-8 key, and
    /// [`StoreError::Io`] if reading fails.
    pub fn next_record(&mut self) -> CoreResult<Option<RawRecord>> {
        let record_offset = self.offset;

        let mut header = Vec::new();
        let n = self.reader.read_until(b'\n', &mut header)?;
        if n == 0 {
            return Ok(None);
        }
        self.offset += n as u64;

        if header.last() != Some(&b'\n') {
            tracing::warn!(
                offset = record_offset,
                "incomplete record header at end of log, ignoring"
            );
            return Ok(None);
        }
        header.pop();

        if header.len() < 3 {
            return Err(StoreError::malformed_record(
                record_offset,
                format!("header too short ({} bytes)", header.len()),
            ));
        }
        if header[1] != b' ' {
            return Err(StoreError::malformed_record(
                record_offset,
                "missing space separator after op",
            ));
        }

        let op = header[0];
        let key = String::from_utf8(header.split_off(2)).map_err(|_| {
            StoreError::malformed_record(record_offset, "key is not valid UTF-8")
        })?;

        let mut value = Vec::new();
        let n = self.reader.read_until(b'\n', &mut value)?;
        self.offset += n as u64;
        if value.last() != Some(&b'\n') {
            tracing::warn!(
                offset = record_offset,
                key = %key,
                "incomplete record value at end of log, ignoring"
            );
            return Ok(None);
        }
        value.pop();

        Ok(Some(RawRecord { op, key, value }))
    }
}
