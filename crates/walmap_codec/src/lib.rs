//! # walmap Codec
//!
//! Compact JSON encoding for walmap values.
//!
//! The walmap write-ahead log is line-oriented text: every record is a
//! header line followed by a single value line, and the trailing `\n` of
//! the value line is the marker that the record was completely written.
//! The codec therefore guarantees that an encoded value never contains a
//! raw `0x0A` byte. Compact JSON already satisfies this (newlines inside
//! strings are escaped to `\n`), and [`to_line_json`] enforces it as a
//! hard invariant so that no alternative `Serialize` implementation can
//! silently break record framing.
//!
//! ## Usage
//!
//! ```
//! use walmap_codec::{to_line_json, from_line_json};
//!
//! let bytes = to_line_json(&vec![1, 2, 3]).unwrap();
//! assert_eq!(bytes, b"[1,2,3]");
//!
//! let decoded: Vec<i32> = from_line_json(&bytes).unwrap();
//! assert_eq!(decoded, vec![1, 2, 3]);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod error;

pub use error::{CodecError, CodecResult};

use serde::de::DeserializeOwned;
use serde::Serialize;

/// Encodes a value as a single line of compact JSON.
///
/// The returned bytes contain no `\n`, so they can be written verbatim as
/// the value line of a log record.
///
/// # Errors
///
/// Returns [`CodecError::Encode`] if the value cannot be serialized, or
/// [`CodecError::EmbeddedNewline`] if the serialized form would break
/// line framing.
pub fn to_line_json<T: Serialize>(value: &T) -> CodecResult<Vec<u8>> {
    let bytes = serde_json::to_vec(value).map_err(CodecError::Encode)?;
    if let Some(position) = bytes.iter().position(|&b| b == b'\n') {
        return Err(CodecError::EmbeddedNewline { position });
    }
    Ok(bytes)
}

/// Decodes a value from its encoded line.
///
/// # Errors
///
/// Returns [`CodecError::Decode`] if the bytes are not valid JSON for `T`.
pub fn from_line_json<T: DeserializeOwned>(bytes: &[u8]) -> CodecResult<T> {
    serde_json::from_slice(bytes).map_err(CodecError::Decode)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Account {
        name: String,
        balance: i64,
        tags: Vec<String>,
    }

    #[test]
    fn scalar_roundtrip() {
        let bytes = to_line_json(&42i64).unwrap();
        assert_eq!(bytes, b"42");
        assert_eq!(from_line_json::<i64>(&bytes).unwrap(), 42);
    }

    #[test]
    fn struct_roundtrip() {
        let account = Account {
            name: "alice".to_string(),
            balance: -250,
            tags: vec!["vip".to_string(), "beta".to_string()],
        };

        let bytes = to_line_json(&account).unwrap();
        let decoded: Account = from_line_json(&bytes).unwrap();
        assert_eq!(decoded, account);
    }

    #[test]
    fn newline_in_string_is_escaped() {
        let text = "first line\nsecond line".to_string();
        let bytes = to_line_json(&text).unwrap();

        // The embedded newline must appear escaped, never raw.
        assert!(!bytes.contains(&b'\n'));

        let decoded: String = from_line_json(&bytes).unwrap();
        assert_eq!(decoded, text);
    }

    #[test]
    fn decode_wrong_shape_fails() {
        let bytes = to_line_json(&"not a number").unwrap();
        let result = from_line_json::<u32>(&bytes);
        assert!(matches!(result, Err(CodecError::Decode(_))));
    }

    #[test]
    fn decode_garbage_fails() {
        let result = from_line_json::<i32>(b"{truncated");
        assert!(matches!(result, Err(CodecError::Decode(_))));
    }

    #[test]
    fn unit_and_option_values() {
        let bytes = to_line_json(&Option::<i32>::None).unwrap();
        assert_eq!(bytes, b"null");
        assert_eq!(from_line_json::<Option<i32>>(&bytes).unwrap(), None);

        let bytes = to_line_json(&Some(7)).unwrap();
        assert_eq!(from_line_json::<Option<i32>>(&bytes).unwrap(), Some(7));
    }
}
