//! Response completion detection.

use std::fmt;

/// Terminal marker that completed a response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseKind {
    /// `OK` or `OK <text>`
    Ok,
    /// `ERR <code> [text]`
    Err,
    /// `INQUIRE <keyword>`: the agent wants a D/END block before finishing
    Inquire,
}

impl ResponseKind {
    /// Whether this marker ends the command/response exchange.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Ok | Self::Err)
    }
}

impl fmt::Display for ResponseKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Ok => "OK",
            Self::Err => "ERR",
            Self::Inquire => "INQUIRE",
        };
        f.write_str(name)
    }
}

/// Completion status derived from an accumulated buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Completion {
    /// Buffer holds a whole response
    pub complete: bool,
    /// Marker that completed it (`None` when incomplete)
    pub kind: Option<ResponseKind>,
}

impl Completion {
    const INCOMPLETE: Self = Self {
        complete: false,
        kind: None,
    };

    fn done(kind: ResponseKind) -> Self {
        Self {
            complete: true,
            kind: Some(kind),
        }
    }
}

/// Decide whether `buffer` holds a complete response.
///
/// The buffer must end with `\n`. Lines are scanned from the end, skipping
/// blank ones; the first non-blank line decides. Only a line that *starts*
/// with a marker counts, so `D OK embedded` stays incomplete.
pub fn detect_completion(buffer: &[u8]) -> Completion {
    if buffer.last() != Some(&b'\n') {
        return Completion::INCOMPLETE;
    }

    let last = buffer
        .split(|&b| b == b'\n')
        .rev()
        .find(|line| !line.iter().all(u8::is_ascii_whitespace));

    let Some(line) = last else {
        return Completion::INCOMPLETE;
    };

    if line == b"OK" || line.starts_with(b"OK ") {
        Completion::done(ResponseKind::Ok)
    } else if line.starts_with(b"ERR ") {
        Completion::done(ResponseKind::Err)
    } else if line.starts_with(b"INQUIRE ") {
        Completion::done(ResponseKind::Inquire)
    } else {
        Completion::INCOMPLETE
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_then_ok() {
        let c = detect_completion(b"S PROGRESS foo\nOK done\n");
        assert!(c.complete);
        assert_eq!(c.kind, Some(ResponseKind::Ok));
    }

    #[test]
    fn test_status_only_is_incomplete() {
        let c = detect_completion(b"S PROGRESS foo\n");
        assert!(!c.complete);
        assert_eq!(c.kind, None);
    }

    #[test]
    fn test_data_line_containing_ok_is_incomplete() {
        assert!(!detect_completion(b"D OK embedded\n").complete);
        assert!(!detect_completion(b"D ERR 1\n").complete);
        assert!(!detect_completion(b"D INQUIRE X\n").complete);
    }

    #[test]
    fn test_bare_ok() {
        assert_eq!(detect_completion(b"OK\n").kind, Some(ResponseKind::Ok));
        assert_eq!(
            detect_completion(b"OK Pleased to meet you\n").kind,
            Some(ResponseKind::Ok)
        );
    }

    #[test]
    fn test_ok_prefix_needs_separator() {
        assert!(!detect_completion(b"OKAY\n").complete);
        assert!(!detect_completion(b"ERR\n").complete);
        assert!(!detect_completion(b"INQUIRE\n").complete);
    }

    #[test]
    fn test_err_and_inquire() {
        assert_eq!(
            detect_completion(b"ERR 67108881 No secret key <GPG Agent>\n").kind,
            Some(ResponseKind::Err)
        );
        assert_eq!(
            detect_completion(b"S INQUIRE_MAXLEN 255\nINQUIRE PASSPHRASE\n").kind,
            Some(ResponseKind::Inquire)
        );
    }

    #[test]
    fn test_trailing_blank_lines_are_skipped() {
        let c = detect_completion(b"D abc\nOK\n\n  \n");
        assert_eq!(c.kind, Some(ResponseKind::Ok));
    }

    #[test]
    fn test_missing_final_newline() {
        assert!(!detect_completion(b"OK").complete);
        assert!(!detect_completion(b"D x\nOK").complete);
    }

    #[test]
    fn test_empty_and_whitespace() {
        assert!(!detect_completion(b"").complete);
        assert!(!detect_completion(b"\n").complete);
        assert!(!detect_completion(b" \n\t\n").complete);
    }

    #[test]
    fn test_binary_data_before_marker() {
        let mut buf = b"D ".to_vec();
        buf.extend((0u8..=255).filter(|&b| b != b'\n'));
        buf.extend_from_slice(b"\nOK\n");
        assert!(detect_completion(&buf).complete);
    }

    #[test]
    fn test_terminal_kinds() {
        assert!(ResponseKind::Ok.is_terminal());
        assert!(ResponseKind::Err.is_terminal());
        assert!(!ResponseKind::Inquire.is_terminal());
    }
}
