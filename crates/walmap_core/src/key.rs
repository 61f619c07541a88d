//! Key validation.
//!
//! The log is line-oriented text: `\n` frames records and a single space
//! separates the op byte from the key. Keys therefore must not contain
//! control code points: C0 (U+0000–U+001F), DEL (U+007F), or C1
//! (U+0080–U+009F). Everything else is legal, including `:`, spaces, and
//! non-BMP characters. The empty string is a valid key.

use crate::error::{CoreResult, StoreError};

/// Validates that a key contains no control code points.
///
/// # Errors
///
/// Returns [`StoreError::InvalidKey`] with the byte position and code
/// point of the first offending character.
pub fn validate_key(key: &str) -> CoreResult<()> {
    for (position, code_point) in key.char_indices() {
        if code_point <= '\u{1f}' || ('\u{7f}'..='\u{9f}').contains(&code_point) {
            return Err(StoreError::InvalidKey {
                position,
                code_point,
            });
        }
    }
    Ok(())
}
