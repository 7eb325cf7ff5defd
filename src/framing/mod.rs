//! Framing library shared by both sides of the relay.
//!
//! Pure functions over raw byte buffers. Protocol data is never treated as
//! text: lines are split on `\n` bytes and every 0-255 value is preserved.
//!
//! # Wire Protocol
//!
//! ```text
//! COMMAND arg...\n            client/agent command
//! OK [text]\n                 terminal success
//! ERR <code> [text]\n         terminal failure
//! S <keyword> ...\n           non-terminal status
//! D <data>\n                  data line
//! INQUIRE <keyword>\n         mid-command request for D/END reply
//! ```
//!
//! A response is complete when its last non-blank line is `OK`, `ERR` or
//! `INQUIRE`. An INQUIRE is answered with a block of `D` lines closed by
//! `END\n`, which the relay forwards as one unit.
//!
//! # Descriptor File
//!
//! The backend agent publishes its TCP port and a 16-byte nonce:
//!
//! ```text
//! <decimal port>\n<16 raw bytes>
//! ```

mod cleanup;
mod descriptor;
mod extract;
mod response;
mod wire;

pub use cleanup::{cleanup_transport, Detach, Link, Teardown};
pub use descriptor::{parse_descriptor, Descriptor, Nonce, MAX_DESCRIPTOR_BYTES, NONCE_LEN};
pub use extract::{
    extract_inquire_block, extract_inquire_reply, extract_line, validate_inquire_lines, Extracted, INQUIRE_TERMINATOR,
};
pub use response::{detect_completion, Completion, ResponseKind};
pub use wire::{decode_wire, encode_wire, sanitize};
