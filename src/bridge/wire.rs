//! Bridge messages, one JSON object per line.
//!
//! Protocol bytes are carried as strings through the Latin-1 wire codec,
//! so arbitrary byte values survive JSON.

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::Connected;
use crate::error::{RelayError, Result};
use crate::framing::{decode_wire, encode_wire};

/// Request from the client side
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BridgeRequest {
    /// Correlates the response; unique per bridge connection
    pub id: u64,
    /// The call
    #[serde(flatten)]
    pub call: BridgeCall,
}

/// Cross-boundary call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "call", rename_all = "snake_case")]
pub enum BridgeCall {
    /// Open a session
    Connect {
        /// Requested ID, or `None` for a generated one
        session_id: Option<String>,
    },
    /// Send a command block
    Send {
        /// Target session
        session_id: String,
        /// Wire-encoded block
        block: String,
    },
    /// Close a session
    Disconnect {
        /// Target session
        session_id: String,
    },
}

impl BridgeCall {
    /// Build a `Send`, encoding `block`.
    pub fn send(session_id: impl Into<String>, block: &[u8]) -> Self {
        Self::Send {
            session_id: session_id.into(),
            block: encode_wire(block),
        }
    }
}

/// Response from the agent side
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BridgeResponse {
    /// ID of the request being answered
    pub id: u64,
    /// What happened
    #[serde(flatten)]
    pub outcome: BridgeOutcome,
}

/// Result of a call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum BridgeOutcome {
    /// `connect` succeeded
    Connected {
        /// ID of the new session
        session_id: String,
        /// Wire-encoded greeting
        greeting: String,
    },
    /// `send` succeeded
    Response {
        /// Wire-encoded response
        response: String,
    },
    /// `disconnect` succeeded
    Disconnected,
    /// The call failed
    Failed {
        /// [`RelayError::kind`] of the failure
        kind: String,
        /// Failure detail
        message: String,
    },
}

impl BridgeOutcome {
    /// Carry a successful `connect`.
    pub fn connected(connected: &Connected) -> Self {
        Self::Connected {
            session_id: connected.session_id.clone(),
            greeting: encode_wire(&connected.greeting),
        }
    }

    /// Carry a successful `send`.
    pub fn response(response: &[u8]) -> Self {
        Self::Response {
            response: encode_wire(response),
        }
    }

    /// Carry a failure.
    pub fn failed(err: &RelayError) -> Self {
        Self::Failed {
            kind: err.kind().to_string(),
            message: err.detail(),
        }
    }

    /// Unpack as the answer to a `connect`.
    pub fn into_connected(self) -> Result<Connected> {
        match self {
            Self::Connected {
                session_id,
                greeting,
            } => Ok(Connected {
                session_id,
                greeting: Bytes::from(decode_wire(&greeting)?),
            }),
            other => Err(other.unexpected("connected")),
        }
    }

    /// Unpack as the answer to a `send`.
    pub fn into_response(self) -> Result<Bytes> {
        match self {
            Self::Response { response } => Ok(Bytes::from(decode_wire(&response)?)),
            other => Err(other.unexpected("response")),
        }
    }

    /// Unpack as the answer to a `disconnect`.
    pub fn into_disconnected(self) -> Result<()> {
        match self {
            Self::Disconnected => Ok(()),
            other => Err(other.unexpected("disconnected")),
        }
    }

    fn unexpected(self, expected: &str) -> RelayError {
        match self {
            Self::Failed { kind, message } => RelayError::from_kind(&kind, message),
            other => RelayError::Bridge(format!("expected {expected}, got {other:?}")),
        }
    }
}

/// Serialize one message as a newline-terminated line.
pub(crate) fn encode_line<T: Serialize>(message: &T) -> Result<Vec<u8>> {
    let mut line = serde_json::to_vec(message)?;
    line.push(b'\n');
    Ok(line)
}

/// Parse one line, trailing newline optional.
pub(crate) fn decode_line<T: DeserializeOwned>(line: &[u8]) -> Result<T> {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    Ok(serde_json::from_slice(line)?)
}
