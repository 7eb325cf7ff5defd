//! Byte-preserving text encoding and log sanitizing.

use crate::error::{RelayError, Result};

/// Longest first word [`sanitize`] will show.
const MAX_VISIBLE_WORD: usize = 32;

/// Encode bytes as text, one char per byte (Latin-1 mapping).
///
/// Every value 0-255 maps to the scalar with the same number, so the bytes
/// survive any boundary that only carries strings.
pub fn encode_wire(bytes: &[u8]) -> String {
    bytes.iter().copied().map(char::from).collect()
}

/// Inverse of [`encode_wire`]. Fails on any char above U+00FF.
pub fn decode_wire(text: &str) -> Result<Vec<u8>> {
    text.chars()
        .map(|c| {
            u8::try_from(c).map_err(|_| {
                RelayError::Parse(format!("wire data contains non-byte char U+{:04X}", c as u32))
            })
        })
        .collect()
}

/// Describe protocol data for logs without exposing payload.
///
/// Returns `"<first word> and <N> more bytes"`.
pub fn sanitize(data: &[u8]) -> String {
    let word_len = data
        .iter()
        .position(|&b| b == b' ' || b == b'\n')
        .unwrap_or(data.len());
    let remaining = data.len() - word_len;

    let word = &data[..word_len.min(MAX_VISIBLE_WORD)];
    let shown = word.escape_ascii().to_string();
    let hidden_word_bytes = word_len - word.len();

    format!("{shown} and {} more bytes", remaining + hidden_word_bytes)
}
