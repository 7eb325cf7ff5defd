//! Backend descriptor file: `<port>\n<16-byte nonce>`.

use std::fmt;
use std::path::Path;

use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{RelayError, Result};

/// Nonce length in bytes.
pub const NONCE_LEN: usize = 16;

/// Largest descriptor file accepted by [`Descriptor::load`].
///
/// Five port digits, a newline and the nonce fit well inside this.
pub const MAX_DESCRIPTOR_BYTES: usize = 64;

/// Single-use authentication token presented to the backend on connect.
///
/// Zeroized on drop; `Debug` never prints the bytes.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct Nonce([u8; NONCE_LEN]);

impl Nonce {
    /// Wrap raw nonce bytes.
    pub fn new(bytes: [u8; NONCE_LEN]) -> Self {
        Self(bytes)
    }

    /// Raw bytes, for writing to the transport.
    pub fn as_bytes(&self) -> &[u8; NONCE_LEN] {
        &self.0
    }
}

impl fmt::Debug for Nonce {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Nonce([REDACTED; {NONCE_LEN}])")
    }
}

/// Parsed descriptor file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Descriptor {
    /// Backend TCP port (1-65535)
    pub port: u16,
    /// Authentication nonce
    pub nonce: Nonce,
}

impl Descriptor {
    /// Read and parse a descriptor file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let bytes = std::fs::read(path).map_err(|e| {
            RelayError::Config(format!("Failed to read descriptor {}: {e}", path.display()))
        })?;

        if bytes.len() > MAX_DESCRIPTOR_BYTES {
            return Err(RelayError::Parse(format!(
                "descriptor is {} bytes, expected at most {MAX_DESCRIPTOR_BYTES}",
                bytes.len()
            )));
        }

        parse_descriptor(&bytes)
    }
}

/// Parse `<decimal port>\n<16 raw bytes>`.
///
/// Fails on a missing newline, an empty, non-numeric or out-of-range port,
/// or a nonce that is not exactly [`NONCE_LEN`] bytes.
pub fn parse_descriptor(bytes: &[u8]) -> Result<Descriptor> {
    let newline = bytes
        .iter()
        .position(|&b| b == b'\n')
        .ok_or_else(|| RelayError::Parse("descriptor has no newline".to_string()))?;

    let (port_bytes, rest) = bytes.split_at(newline);
    let nonce_bytes = &rest[1..];

    if port_bytes.is_empty() || !port_bytes.iter().all(u8::is_ascii_digit) {
        return Err(RelayError::Parse("descriptor port is not numeric".to_string()));
    }

    // Digits only, so this is valid ASCII; the u32 parse bounds the length.
    let port: u32 = std::str::from_utf8(port_bytes)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| RelayError::Parse("descriptor port out of range".to_string()))?;

    let port = u16::try_from(port)
        .ok()
        .filter(|&p| p != 0)
        .ok_or_else(|| RelayError::Parse(format!("descriptor port {port} out of range")))?;

    let nonce: [u8; NONCE_LEN] = nonce_bytes.try_into().map_err(|_| {
        RelayError::Parse(format!(
            "descriptor nonce is {} bytes, expected {NONCE_LEN}",
            nonce_bytes.len()
        ))
    })?;

    Ok(Descriptor {
        port,
        nonce: Nonce::new(nonce),
    })
}
