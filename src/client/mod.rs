//! Client side: a local Assuan endpoint relayed through the bridge.
//!
//! # Session flow
//!
//! ```text
//! Client                      Relay                       Bridge
//!   |--- connect ------------->|                            |
//!   |                          |--- connect() ------------->|
//!   |<-- OK greeting ----------|<-- {session_id, greeting} -|
//!   |--- SIGN\n -------------->|--- send(SIGN\n) ---------->|
//!   |<-- INQUIRE PASSPHRASE ---|<-- INQUIRE PASSPHRASE -----|
//!   |--- D secret\nEND\n ----->|--- send(D secret\nEND\n) ->|
//!   |<-- OK -------------------|<-- OK ---------------------|
//! ```
//!
//! The client is not read until the greeting has been relayed. Commands
//! are forwarded one line at a time; an INQUIRE reply is forwarded as one
//! block once `END\n` arrives. Both are bounded by `max_buffer_bytes`.

mod driver;
mod listener;
mod session;
mod state;

pub use listener::ClientListener;
pub use session::{ClientSession, Unit};
pub use state::{ClientEvent, ClientState, CLIENT_TRANSITIONS};
