//! Agent-side session state: transitions, response accumulation, cleanup
//! bookkeeping. Performs no I/O; the driver feeds it events.

use bytes::{Bytes, BytesMut};

use super::state::{AgentEvent, AgentState, AGENT_TRANSITIONS};
use crate::error::{RelayError, Result};
use crate::framing::{detect_completion, sanitize, ResponseKind};
use crate::machine::StateMachine;

/// A complete response read from the backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentResponse {
    /// Raw response bytes, terminal line included
    pub data: Bytes,
    /// Marker that completed it
    pub kind: ResponseKind,
}

/// One backend conversation
#[derive(Debug)]
pub struct AgentSession {
    /// Session ID
    id: String,
    /// State machine over [`AGENT_TRANSITIONS`]
    machine: StateMachine<AgentState, AgentEvent>,
    /// Response accumulation buffer
    buffer: BytesMut,
    /// Cap on `buffer`
    max_response_bytes: usize,
    /// Error that sent the session down the cleanup path
    last_error: Option<RelayError>,
    /// Cleanup has been requested once already
    cleanup_requested: bool,
}

impl AgentSession {
    /// Create a disconnected session
    pub fn new(id: impl Into<String>, max_response_bytes: usize) -> Self {
        Self {
            id: id.into(),
            machine: StateMachine::new(AgentState::Disconnected, AGENT_TRANSITIONS),
            buffer: BytesMut::new(),
            max_response_bytes,
            last_error: None,
            cleanup_requested: false,
        }
    }

    /// Get session ID
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Get current state
    pub fn state(&self) -> AgentState {
        self.machine.state()
    }

    /// Error recorded by [`AgentSession::fail`], if any
    pub fn last_error(&self) -> Option<&RelayError> {
        self.last_error.as_ref()
    }

    /// Bytes accumulated toward the current response
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Apply an event through the transition table.
    pub fn handle(&mut self, event: AgentEvent) -> Result<AgentState> {
        self.machine.handle(event)
    }

    /// Start the handshake.
    pub fn begin_connect(&mut self) -> Result<()> {
        self.handle(AgentEvent::ConnectRequested)?;
        Ok(())
    }

    /// Transport is open; the nonce goes out next.
    pub fn socket_connected(&mut self) -> Result<()> {
        self.handle(AgentEvent::SocketConnected)?;
        self.handle(AgentEvent::DataReceived)?;
        self.buffer.clear();
        Ok(())
    }

    /// Accept a command for sending.
    ///
    /// Only legal in `Ready`; anything else is a protocol violation and
    /// leaves the session untouched.
    pub fn begin_send(&mut self, block: &[u8]) -> Result<()> {
        if self.state() != AgentState::Ready {
            return Err(RelayError::ProtocolViolation(format!(
                "cannot send {} in state {:?}",
                sanitize(block),
                self.state()
            )));
        }

        self.handle(AgentEvent::DataReceived)?;
        self.buffer.clear();
        tracing::debug!(session = %self.id, command = %sanitize(block), "sending command");
        Ok(())
    }

    /// The pending write finished.
    pub fn write_ok(&mut self) -> Result<()> {
        self.handle(AgentEvent::WriteOk)?;
        Ok(())
    }

    /// Accumulate a response chunk.
    ///
    /// Returns the whole response once its terminal line is present. A
    /// chunk that would push the buffer past the cap is refused whole.
    pub fn push_chunk(&mut self, chunk: &[u8]) -> Result<Option<AgentResponse>> {
        let attempted = self.buffer.len() + chunk.len();
        if attempted > self.max_response_bytes {
            return Err(RelayError::BufferOverflow {
                limit: self.max_response_bytes,
                attempted,
            });
        }

        self.handle(AgentEvent::DataChunk)?;
        self.buffer.extend_from_slice(chunk);

        let completion = detect_completion(&self.buffer);
        let Some(kind) = completion.kind.filter(|_| completion.complete) else {
            return Ok(None);
        };

        self.handle(AgentEvent::DataComplete)?;
        let data = self.buffer.split().freeze();
        Ok(Some(AgentResponse { data, kind }))
    }

    /// Record a failure and move to `Error`.
    ///
    /// Returns the error for propagation. The first recorded error is kept.
    pub fn fail(&mut self, error: RelayError) -> RelayError {
        tracing::warn!(session = %self.id, state = ?self.state(), %error, "agent session failed");
        if self.machine.accepts(AgentEvent::ErrorOccurred) {
            // Accepted by the table, so this cannot fail.
            let _ = self.handle(AgentEvent::ErrorOccurred);
        }
        self.last_error.get_or_insert_with(|| error.clone());
        error
    }

    /// Ask for teardown. One-shot: later calls return `false` and change nothing.
    pub fn request_cleanup(&mut self, had_error: bool) -> bool {
        if self.cleanup_requested || !self.machine.accepts(AgentEvent::CleanupRequested) {
            return false;
        }

        self.cleanup_requested = true;
        // Accepted by the table, so this cannot fail.
        let _ = self.handle(AgentEvent::CleanupRequested);
        tracing::debug!(session = %self.id, had_error, "agent cleanup requested");
        true
    }

    /// Record the teardown outcome: `Disconnected` on success, `Fatal` otherwise.
    pub fn finish_cleanup(&mut self, outcome: Result<()>) -> Result<()> {
        self.buffer.clear();
        match outcome {
            Ok(()) => {
                self.handle(AgentEvent::CleanupComplete)?;
                tracing::info!(session = %self.id, "agent session closed");
                Ok(())
            },
            Err(e) => {
                self.handle(AgentEvent::CleanupError)?;
                tracing::error!(session = %self.id, error = %e, "agent session is fatal");
                Err(e)
            },
        }
    }
}
