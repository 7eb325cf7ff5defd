//! Client-side session state: command and INQUIRE buffering, relay
//! bookkeeping. Performs no I/O; the driver feeds it events.

use bytes::{Bytes, BytesMut};

use super::state::{ClientEvent, ClientState, CLIENT_TRANSITIONS};
use crate::error::{RelayError, Result};
use crate::framing::{
    detect_completion, extract_inquire_reply, extract_line, sanitize, validate_inquire_lines,
    ResponseKind,
};
use crate::machine::StateMachine;

/// A complete unit ready to go across the bridge
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Unit {
    /// One command line
    Command(Bytes),
    /// A D/END block answering an INQUIRE
    InquireReply(Bytes),
}

impl Unit {
    /// The bytes to forward
    pub fn block(&self) -> &Bytes {
        match self {
            Self::Command(block) | Self::InquireReply(block) => block,
        }
    }
}

/// One client conversation
#[derive(Debug)]
pub struct ClientSession {
    /// Local session ID
    id: String,
    /// ID of the agent-side session across the bridge
    remote_id: Option<String>,
    /// State machine over [`CLIENT_TRANSITIONS`]
    machine: StateMachine<ClientState, ClientEvent>,
    /// Client bytes not yet forwarded
    buffer: BytesMut,
    /// Cap on `buffer`, for commands and INQUIRE replies alike
    max_buffer_bytes: usize,
    /// Error that sent the session down the cleanup path
    last_error: Option<RelayError>,
    /// Cleanup has been requested once already
    cleanup_requested: bool,
}

impl ClientSession {
    /// Create a session for a connection that has not been accepted yet
    pub fn new(id: impl Into<String>, max_buffer_bytes: usize) -> Self {
        Self {
            id: id.into(),
            remote_id: None,
            machine: StateMachine::new(ClientState::Disconnected, CLIENT_TRANSITIONS),
            buffer: BytesMut::new(),
            max_buffer_bytes,
            last_error: None,
            cleanup_requested: false,
        }
    }

    /// Get session ID
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Agent-side session ID, once connected
    pub fn remote_id(&self) -> Option<&str> {
        self.remote_id.as_deref()
    }

    /// Get current state
    pub fn state(&self) -> ClientState {
        self.machine.state()
    }

    /// Error recorded by [`ClientSession::fail`], if any
    pub fn last_error(&self) -> Option<&RelayError> {
        self.last_error.as_ref()
    }

    /// Bytes buffered and not yet forwarded
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Apply an event through the transition table.
    pub fn handle(&mut self, event: ClientEvent) -> Result<ClientState> {
        self.machine.handle(event)
    }

    /// The client transport was accepted.
    pub fn accept(&mut self) -> Result<()> {
        self.handle(ClientEvent::ClientConnected)?;
        Ok(())
    }

    /// The bridge session is open and its greeting reached the client.
    pub fn connected(&mut self, remote_id: impl Into<String>) -> Result<()> {
        self.handle(ClientEvent::BridgeConnected)?;
        self.remote_id = Some(remote_id.into());
        Ok(())
    }

    /// The agent-side session exists; remember it even if the handshake
    /// does not complete, so cleanup can close it.
    pub fn set_remote_id(&mut self, remote_id: impl Into<String>) {
        self.remote_id = Some(remote_id.into());
    }

    /// Buffer bytes from the client.
    ///
    /// A chunk that would take the buffer past the cap is refused whole,
    /// with nothing dropped before it.
    pub fn push_client_data(&mut self, chunk: &[u8]) -> Result<()> {
        let attempted = self.buffer.len() + chunk.len();
        if attempted > self.max_buffer_bytes {
            return Err(RelayError::BufferOverflow {
                limit: self.max_buffer_bytes,
                attempted,
            });
        }

        self.handle(ClientEvent::ClientData)?;
        self.buffer.extend_from_slice(chunk);
        Ok(())
    }

    /// Split the next complete unit off the buffer, if there is one.
    ///
    /// In `Ready` with bytes left over from an earlier chunk, buffering
    /// restarts at once, so several commands in one chunk are served one
    /// after the other without further reads.
    pub fn next_unit(&mut self) -> Result<Option<Unit>> {
        if self.state() == ClientState::Ready && !self.buffer.is_empty() {
            self.handle(ClientEvent::ClientData)?;
        }

        match self.state() {
            ClientState::BufferingCommand => {
                let len = extract_line(&self.buffer).consumed();
                if len == 0 {
                    return Ok(None);
                }
                self.handle(ClientEvent::CommandComplete)?;
                let block = self.buffer.split_to(len).freeze();
                tracing::debug!(session = %self.id, command = %sanitize(&block), "command buffered");
                Ok(Some(Unit::Command(block)))
            },
            ClientState::BufferingInquire => {
                validate_inquire_lines(&self.buffer)?;
                let len = extract_inquire_reply(&self.buffer).consumed();
                if len == 0 {
                    return Ok(None);
                }
                self.handle(ClientEvent::InquireComplete)?;
                let block = self.buffer.split_to(len).freeze();
                tracing::debug!(session = %self.id, bytes = block.len(), "inquire reply buffered");
                Ok(Some(Unit::InquireReply(block)))
            },
            _ => Ok(None),
        }
    }

    /// The unit was handed to the bridge.
    pub fn dispatched(&mut self) -> Result<()> {
        self.handle(ClientEvent::CallDispatched)?;
        Ok(())
    }

    /// The bridge answered. Returns the response's terminal kind.
    pub fn response_received(&mut self, response: &[u8]) -> Result<ResponseKind> {
        let completion = detect_completion(response);
        let kind = completion
            .kind
            .filter(|_| completion.complete)
            .ok_or_else(|| {
                RelayError::ProtocolViolation(format!(
                    "incomplete response from agent side: {}",
                    sanitize(response)
                ))
            })?;

        self.handle(ClientEvent::ResponseReceived)?;
        Ok(kind)
    }

    /// The response reached the client. `INQUIRE` moves on to collecting
    /// the reply; `OK`/`ERR` end the exchange.
    pub fn relayed(&mut self, kind: ResponseKind) -> Result<ClientState> {
        let event = if kind.is_terminal() {
            ClientEvent::ResponseRelayed
        } else {
            ClientEvent::InquireRelayed
        };
        self.handle(event)
    }

    /// Record a failure and move to `Error`.
    ///
    /// Returns the error for propagation. The first recorded error is kept.
    pub fn fail(&mut self, error: RelayError) -> RelayError {
        tracing::warn!(session = %self.id, state = ?self.state(), %error, "client session failed");
        if self.machine.accepts(ClientEvent::ErrorOccurred) {
            // Accepted by the table, so this cannot fail.
            let _ = self.handle(ClientEvent::ErrorOccurred);
        }
        self.last_error.get_or_insert_with(|| error.clone());
        error
    }

    /// Ask for teardown. One-shot: later calls return `false` and change nothing.
    pub fn request_cleanup(&mut self, had_error: bool) -> bool {
        if self.cleanup_requested || !self.machine.accepts(ClientEvent::CleanupRequested) {
            return false;
        }

        self.cleanup_requested = true;
        // Accepted by the table, so this cannot fail.
        let _ = self.handle(ClientEvent::CleanupRequested);
        tracing::debug!(session = %self.id, had_error, "client cleanup requested");
        true
    }

    /// Record the teardown outcome: `Disconnected` on success, `Fatal` otherwise.
    pub fn finish_cleanup(&mut self, outcome: Result<()>) -> Result<()> {
        self.buffer.clear();
        match outcome {
            Ok(()) => {
                self.handle(ClientEvent::CleanupComplete)?;
                tracing::info!(session = %self.id, "client session closed");
                Ok(())
            },
            Err(e) => {
                self.handle(ClientEvent::CleanupError)?;
                tracing::error!(session = %self.id, error = %e, "client session is fatal");
                Err(e)
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ready_session(max: usize) -> ClientSession {
        let mut s = ClientSession::new("c1", max);
        s.accept().unwrap();
        s.connected("a1").unwrap();
        assert_eq!(s.state(), ClientState::Ready);
        s
    }

    /// Dispatch, answer with `response`, relay.
    fn answer(s: &mut ClientSession, response: &[u8]) -> ResponseKind {
        s.dispatched().unwrap();
        let kind = s.response_received(response).unwrap();
        s.relayed(kind).unwrap();
        kind
    }

    #[test]
    fn test_partial_line_waits() {
        let mut s = ready_session(1024);
        s.push_client_data(b"GETINFO ver").unwrap();
        assert_eq!(s.state(), ClientState::BufferingCommand);
        assert_eq!(s.next_unit().unwrap(), None);

        s.push_client_data(b"sion\n").unwrap();
        assert_eq!(
            s.next_unit().unwrap(),
            Some(Unit::Command(Bytes::from_static(b"GETINFO version\n")))
        );
        assert_eq!(s.state(), ClientState::Sending);
        assert_eq!(s.buffered(), 0);
    }

    #[test]
    fn test_two_commands_in_one_chunk() {
        let mut s = ready_session(1024);
        s.push_client_data(b"CMD1\nCMD2\n").unwrap();

        let first = s.next_unit().unwrap().unwrap();
        assert_eq!(&first.block()[..], b"CMD1\n");
        assert_eq!(answer(&mut s, b"OK\n"), ResponseKind::Ok);
        assert_eq!(s.state(), ClientState::Ready);

        let second = s.next_unit().unwrap().unwrap();
        assert_eq!(&second.block()[..], b"CMD2\n");
        assert_eq!(answer(&mut s, b"ERR 1 nope\n"), ResponseKind::Err);
        assert_eq!(s.next_unit().unwrap(), None);
        assert_eq!(s.state(), ClientState::Ready);
    }

    #[test]
    fn test_inquire_exchange() {
        let mut s = ready_session(1024);
        s.push_client_data(b"SIGN\n").unwrap();
        s.next_unit().unwrap().unwrap();
        assert_eq!(answer(&mut s, b"INQUIRE PASSPHRASE\n"), ResponseKind::Inquire);
        assert_eq!(s.state(), ClientState::BufferingInquire);

        s.push_client_data(b"D sec").unwrap();
        assert_eq!(s.next_unit().unwrap(), None);
        s.push_client_data(b"ret\nEND\n").unwrap();
        assert_eq!(
            s.next_unit().unwrap(),
            Some(Unit::InquireReply(Bytes::from_static(b"D secret\nEND\n")))
        );

        assert_eq!(answer(&mut s, b"OK\n"), ResponseKind::Ok);
        assert_eq!(s.state(), ClientState::Ready);
    }

    #[test]
    fn test_inquire_data_ending_in_end_is_not_the_terminator() {
        let mut s = ready_session(1024);
        s.push_client_data(b"SIGN\n").unwrap();
        s.next_unit().unwrap().unwrap();
        answer(&mut s, b"INQUIRE PASSPHRASE\n");

        s.push_client_data(b"D weekEND\n").unwrap();
        assert_eq!(s.next_unit().unwrap(), None);
        assert_eq!(s.state(), ClientState::BufferingInquire);

        s.push_client_data(b"END\n").unwrap();
        assert_eq!(
            s.next_unit().unwrap(),
            Some(Unit::InquireReply(Bytes::from_static(b"D weekEND\nEND\n")))
        );
        assert_eq!(s.buffered(), 0);
    }

    #[test]
    fn test_nested_inquire() {
        let mut s = ready_session(1024);
        s.push_client_data(b"PKDECRYPT\n").unwrap();
        s.next_unit().unwrap().unwrap();
        answer(&mut s, b"INQUIRE CIPHERTEXT\n");

        s.push_client_data(b"D (enc)\nEND\n").unwrap();
        s.next_unit().unwrap().unwrap();
        answer(&mut s, b"S PROGRESS\nINQUIRE PINENTRY_LAUNCHED 1\n");
        assert_eq!(s.state(), ClientState::BufferingInquire);

        s.push_client_data(b"END\n").unwrap();
        let reply = s.next_unit().unwrap().unwrap();
        assert!(matches!(reply, Unit::InquireReply(_)));
        answer(&mut s, b"D (value)\nOK\n");
        assert_eq!(s.state(), ClientState::Ready);
    }

    #[test]
    fn test_command_during_inquire_is_violation() {
        let mut s = ready_session(1024);
        s.push_client_data(b"SIGN\n").unwrap();
        s.next_unit().unwrap().unwrap();
        answer(&mut s, b"INQUIRE PASSPHRASE\n");

        s.push_client_data(b"GETINFO pid\n").unwrap();
        let err = s.next_unit().unwrap_err();
        assert!(matches!(err, RelayError::ProtocolViolation(_)));
    }

    #[test]
    fn test_overflow_in_both_buffering_states() {
        let mut s = ready_session(8);
        s.push_client_data(b"ABCDEF").unwrap();
        let err = s.push_client_data(b"GHI").unwrap_err();
        assert_eq!(
            err,
            RelayError::BufferOverflow {
                limit: 8,
                attempted: 9
            }
        );
        assert_eq!(s.buffered(), 6);

        let mut s = ready_session(8);
        s.push_client_data(b"SIGN\n").unwrap();
        s.next_unit().unwrap().unwrap();
        answer(&mut s, b"INQUIRE PASSPHRASE\n");
        s.push_client_data(b"D 12345\n").unwrap();
        let err = s.push_client_data(b"E").unwrap_err();
        assert_eq!(err.kind(), "overflow");
        assert_eq!(s.buffered(), 8);
    }

    #[test]
    fn test_write_ahead_while_waiting_is_kept() {
        let mut s = ready_session(1024);
        s.push_client_data(b"CMD1\n").unwrap();
        s.next_unit().unwrap().unwrap();
        s.dispatched().unwrap();

        s.push_client_data(b"CMD2\n").unwrap();
        assert_eq!(s.state(), ClientState::Waiting);
        assert_eq!(s.next_unit().unwrap(), None);

        let kind = s.response_received(b"OK\n").unwrap();
        s.relayed(kind).unwrap();
        assert_eq!(&s.next_unit().unwrap().unwrap().block()[..], b"CMD2\n");
    }

    #[test]
    fn test_incomplete_response_is_rejected() {
        let mut s = ready_session(1024);
        s.push_client_data(b"CMD\n").unwrap();
        s.next_unit().unwrap().unwrap();
        s.dispatched().unwrap();

        let err = s.response_received(b"D OK embedded\n").unwrap_err();
        assert!(matches!(err, RelayError::ProtocolViolation(_)));
        assert_eq!(s.state(), ClientState::Waiting);
    }

    #[test]
    fn test_cleanup_is_one_shot() {
        let mut s = ready_session(1024);
        assert!(s.request_cleanup(false));
        assert!(!s.request_cleanup(false));
        assert!(!s.request_cleanup(true));
        assert_eq!(s.state(), ClientState::Closing);

        s.finish_cleanup(Ok(())).unwrap();
        assert_eq!(s.state(), ClientState::Disconnected);
        assert!(!s.request_cleanup(false));
    }

    #[test]
    fn test_error_then_fatal() {
        let mut s = ready_session(1024);
        s.fail(RelayError::Transport("bridge down".to_string()));
        assert_eq!(s.state(), ClientState::Error);
        assert!(s.request_cleanup(true));
        s.finish_cleanup(Err(RelayError::Cleanup("destroy: boom".to_string())))
            .unwrap_err();
        assert_eq!(s.state(), ClientState::Fatal);
        assert_eq!(s.last_error().unwrap().kind(), "transport");
    }
}
