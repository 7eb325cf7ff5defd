//! Cross-boundary call interface.
//!
//! The client side drives the agent side through three calls:
//!
//! ```text
//! connect(session_id?)        -> { session_id, greeting }
//! send(session_id, block)     -> response
//! disconnect(session_id)      -> ()
//! ```
//!
//! [`AgentBridge`] is that contract. [`crate::agent::AgentCoordinator`]
//! implements it in-process; [`StreamBridge`] carries it over a JSON-lines
//! stream to a remote [`serve_bridge`] loop. Any call may suspend
//! indefinitely (the backend may be waiting on a human), so none of them
//! carries a timeout.

mod stream;
mod wire;

pub use stream::{serve_bridge, StreamBridge};
pub use wire::{BridgeCall, BridgeOutcome, BridgeRequest, BridgeResponse};

use bytes::Bytes;
use futures::future::BoxFuture;

use crate::error::Result;

/// Outcome of a successful `connect`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connected {
    /// ID of the new agent-side session
    pub session_id: String,
    /// Backend greeting, relayed verbatim to the client
    pub greeting: Bytes,
}

/// The agent-side operations the client side depends on.
pub trait AgentBridge: Send + Sync + 'static {
    /// Open a backend session, optionally under a caller-chosen ID.
    fn connect(&self, session_id: Option<String>) -> BoxFuture<'_, Result<Connected>>;

    /// Send one command block and wait for its complete response.
    fn send(&self, session_id: String, block: Bytes) -> BoxFuture<'_, Result<Bytes>>;

    /// Tear the session down.
    fn disconnect(&self, session_id: String) -> BoxFuture<'_, Result<()>>;
}
