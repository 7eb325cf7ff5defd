//! Splitting complete units off a client buffer.

use crate::error::{RelayError, Result};

/// Terminator of an INQUIRE reply block.
pub const INQUIRE_TERMINATOR: &[u8] = b"END\n";

/// Result of an extraction attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Extracted<'a> {
    /// The complete unit, terminator included (`None` if not yet present)
    pub extracted: Option<&'a [u8]>,
    /// Bytes after the unit, or the whole buffer when nothing was extracted
    pub remaining: &'a [u8],
}

impl<'a> Extracted<'a> {
    fn split(buffer: &'a [u8], end: Option<usize>) -> Self {
        match end {
            Some(end) => {
                let (unit, rest) = buffer.split_at(end);
                Self {
                    extracted: Some(unit),
                    remaining: rest,
                }
            },
            None => Self {
                extracted: None,
                remaining: buffer,
            },
        }
    }

    /// Length of the extracted unit, 0 when nothing was extracted.
    pub fn consumed(&self) -> usize {
        self.extracted.map_or(0, <[u8]>::len)
    }
}

/// Split at the first `\n`, inclusive.
pub fn extract_line(buffer: &[u8]) -> Extracted<'_> {
    let end = buffer.iter().position(|&b| b == b'\n').map(|i| i + 1);
    Extracted::split(buffer, end)
}

/// Split after the first literal `END\n`, inclusive.
pub fn extract_inquire_block(buffer: &[u8]) -> Extracted<'_> {
    let end = buffer
        .windows(INQUIRE_TERMINATOR.len())
        .position(|w| w == INQUIRE_TERMINATOR)
        .map(|i| i + INQUIRE_TERMINATOR.len());
    Extracted::split(buffer, end)
}

/// Split after the first `END\n` that is a whole line, inclusive.
///
/// Unlike [`extract_inquire_block`], a `D` line whose data happens to end
/// in `END` does not terminate the reply.
pub fn extract_inquire_reply(buffer: &[u8]) -> Extracted<'_> {
    let mut start = 0;
    while let Some(line) = extract_line(&buffer[start..]).extracted {
        start += line.len();
        if line == INQUIRE_TERMINATOR {
            return Extracted::split(buffer, Some(start));
        }
    }
    Extracted::split(buffer, None)
}

/// Check that every complete line of an INQUIRE reply is a `D` line or `END`.
///
/// A trailing partial line is not judged until its newline arrives.
pub fn validate_inquire_lines(buffer: &[u8]) -> Result<()> {
    let mut rest = buffer;
    while let Some(line) = extract_line(rest).extracted {
        let ok = line == b"D\n" || line.starts_with(b"D ") || line == INQUIRE_TERMINATOR;
        if !ok {
            return Err(RelayError::ProtocolViolation(format!(
                "expected D or END while answering INQUIRE, got {}",
                super::sanitize(line)
            )));
        }
        if line == INQUIRE_TERMINATOR {
            break;
        }
        rest = &rest[line.len()..];
    }
    Ok(())
}
