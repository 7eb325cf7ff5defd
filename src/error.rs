//! Relay error types.
//!
//! Every failure inside a session funnels into one [`RelayError`], which
//! drives the session's single terminal path
//! (error → cleanup → `Disconnected` | `Fatal`).
//!
//! Errors that cross the bridge travel as a `(kind, message)` pair;
//! [`RelayError::kind`] and [`RelayError::from_kind`] keep both ends
//! agreeing on the variant.

use thiserror::Error;

/// Relay errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RelayError {
    /// Malformed descriptor file, response or wire payload.
    #[error("Parse error: {0}")]
    Parse(String),

    /// Input that is illegal in the session's current state.
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    /// Connect, write or socket failure.
    #[error("Transport error: {0}")]
    Transport(String),

    /// Transport connect or greeting took too long.
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Accumulated bytes exceeded the configured cap.
    #[error("Buffer overflow: {attempted} bytes exceeds limit of {limit}")]
    BufferOverflow {
        /// Configured cap in bytes.
        limit: usize,
        /// Size the buffer would have reached.
        attempted: usize,
    },

    /// Transport teardown failed; the session is unrecoverable.
    #[error("Cleanup error: {0}")]
    Cleanup(String),

    /// The (state, event) pair is not in the transition table.
    #[error("Invalid transition from {state} via {event}")]
    InvalidTransition {
        /// State the session was in.
        state: String,
        /// Event that was rejected.
        event: String,
    },

    /// No tracked session with this ID.
    #[error("Session not found: {0}")]
    SessionNotFound(String),

    /// A session with this ID is already tracked.
    #[error("Session already exists: {0}")]
    SessionExists(String),

    /// The coordinator is at its concurrent-session limit.
    #[error("Capacity exceeded: limit of {limit} concurrent sessions")]
    CapacityExceeded {
        /// Configured maximum.
        limit: usize,
    },

    /// Failure reported by the far side of the bridge.
    #[error("Bridge error: {0}")]
    Bridge(String),

    /// Configuration error.
    #[error("Config error: {0}")]
    Config(String),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(String),

    /// I/O error.
    #[error("IO error: {0}")]
    Io(String),
}

/// Result type alias for relay operations
pub type Result<T> = std::result::Result<T, RelayError>;

impl RelayError {
    /// Stable short name of the variant, used on the bridge wire.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Parse(_) => "parse",
            Self::ProtocolViolation(_) => "protocol",
            Self::Transport(_) => "transport",
            Self::Timeout(_) => "timeout",
            Self::BufferOverflow { .. } => "overflow",
            Self::Cleanup(_) => "cleanup",
            Self::InvalidTransition { .. } => "transition",
            Self::SessionNotFound(_) => "not_found",
            Self::SessionExists(_) => "exists",
            Self::CapacityExceeded { .. } => "capacity",
            Self::Bridge(_) => "bridge",
            Self::Config(_) => "config",
            Self::Json(_) => "json",
            Self::Io(_) => "io",
        }
    }

    /// Rebuild an error received from the far side of the bridge.
    ///
    /// Structured variants cannot be rebuilt exactly from text and come
    /// back as [`RelayError::Bridge`] carrying the remote message.
    pub fn from_kind(kind: &str, message: String) -> Self {
        match kind {
            "parse" => Self::Parse(message),
            "protocol" => Self::ProtocolViolation(message),
            "transport" => Self::Transport(message),
            "timeout" => Self::Timeout(message),
            "cleanup" => Self::Cleanup(message),
            "not_found" => Self::SessionNotFound(message),
            "exists" => Self::SessionExists(message),
            "config" => Self::Config(message),
            _ => Self::Bridge(format!("{kind}: {message}")),
        }
    }

    /// Message without the variant prefix, for the bridge wire.
    pub fn detail(&self) -> String {
        match self {
            Self::Parse(m)
            | Self::ProtocolViolation(m)
            | Self::Transport(m)
            | Self::Timeout(m)
            | Self::Cleanup(m)
            | Self::SessionNotFound(m)
            | Self::SessionExists(m)
            | Self::Bridge(m)
            | Self::Config(m)
            | Self::Json(m)
            | Self::Io(m) => m.clone(),
            other => other.to_string(),
        }
    }
}

impl From<std::io::Error> for RelayError {
    fn from(err: std::io::Error) -> Self {
        RelayError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for RelayError {
    fn from(err: serde_json::Error) -> Self {
        RelayError::Json(err.to_string())
    }
}

impl From<toml::de::Error> for RelayError {
    fn from(err: toml::de::Error) -> Self {
        RelayError::Config(err.to_string())
    }
}
