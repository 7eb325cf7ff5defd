//! Agent-side session states and transition table.

use crate::machine::Transition;

/// Agent-side session state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AgentState {
    /// No transport; initial and post-cleanup state
    Disconnected,
    /// TCP connect in progress
    Connecting,
    /// Transport open, nonce not yet sent
    SocketConnected,
    /// Writing nonce or command bytes
    Sending,
    /// Accumulating a response
    Waiting,
    /// Idle, accepts the next command
    Ready,
    /// Failed; cleanup pending
    Error,
    /// Tearing down the transport
    Closing,
    /// Cleanup failed; session is discarded
    Fatal,
}

impl AgentState {
    /// Every state, for exhaustive table checks.
    pub const ALL: [AgentState; 9] = [
        Self::Disconnected,
        Self::Connecting,
        Self::SocketConnected,
        Self::Sending,
        Self::Waiting,
        Self::Ready,
        Self::Error,
        Self::Closing,
        Self::Fatal,
    ];
}

/// Agent-side session event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AgentEvent {
    /// Caller asked for a backend connection
    ConnectRequested,
    /// TCP connect finished
    SocketConnected,
    /// Bytes handed over for writing (nonce or command)
    DataReceived,
    /// Write finished
    WriteOk,
    /// Part of a response arrived
    DataChunk,
    /// Response is complete
    DataComplete,
    /// Any failure
    ErrorOccurred,
    /// Teardown asked for (after an error, a disconnect or a peer close)
    CleanupRequested,
    /// Teardown succeeded
    CleanupComplete,
    /// Teardown failed
    CleanupError,
}

impl AgentEvent {
    /// Every event, for exhaustive table checks.
    pub const ALL: [AgentEvent; 10] = [
        Self::ConnectRequested,
        Self::SocketConnected,
        Self::DataReceived,
        Self::WriteOk,
        Self::DataChunk,
        Self::DataComplete,
        Self::ErrorOccurred,
        Self::CleanupRequested,
        Self::CleanupComplete,
        Self::CleanupError,
    ];
}

use AgentEvent as E;
use AgentState as S;

/// The agent-side transition table.
pub const AGENT_TRANSITIONS: &[Transition<AgentState, AgentEvent>] = &[
    // Handshake
    Transition::new(S::Disconnected, E::ConnectRequested, S::Connecting),
    Transition::new(S::Connecting, E::SocketConnected, S::SocketConnected),
    Transition::new(S::SocketConnected, E::DataReceived, S::Sending),
    // Command cycle (the nonce/greeting exchange uses it too)
    Transition::new(S::Ready, E::DataReceived, S::Sending),
    Transition::new(S::Sending, E::WriteOk, S::Waiting),
    Transition::new(S::Waiting, E::DataChunk, S::Waiting),
    Transition::new(S::Waiting, E::DataComplete, S::Ready),
    // Failures
    Transition::new(S::Connecting, E::ErrorOccurred, S::Error),
    Transition::new(S::SocketConnected, E::ErrorOccurred, S::Error),
    Transition::new(S::Sending, E::ErrorOccurred, S::Error),
    Transition::new(S::Waiting, E::ErrorOccurred, S::Error),
    Transition::new(S::Ready, E::ErrorOccurred, S::Error),
    // Teardown
    Transition::new(S::Error, E::CleanupRequested, S::Closing),
    Transition::new(S::Ready, E::CleanupRequested, S::Closing),
    Transition::new(S::Connecting, E::CleanupRequested, S::Closing),
    Transition::new(S::SocketConnected, E::CleanupRequested, S::Closing),
    Transition::new(S::Sending, E::CleanupRequested, S::Closing),
    Transition::new(S::Waiting, E::CleanupRequested, S::Closing),
    Transition::new(S::Closing, E::CleanupComplete, S::Disconnected),
    Transition::new(S::Closing, E::CleanupError, S::Fatal),
];

#[cfg(test)]
mod tests {
    use super::*;
    use crate::machine::{next_state, StateMachine};

    #[test]
    fn test_table_has_no_duplicate_pairs() {
        for (i, a) in AGENT_TRANSITIONS.iter().enumerate() {
            for b in &AGENT_TRANSITIONS[i + 1..] {
                assert!(
                    !(a.from == b.from && a.event == b.event),
                    "duplicate row {:?} / {:?}",
                    a.from,
                    a.event
                );
            }
        }
    }

    #[test]
    fn test_every_pair_outside_table_is_rejected() {
        for state in AgentState::ALL {
            for event in AgentEvent::ALL {
                let mut machine = StateMachine::new(state, AGENT_TRANSITIONS);
                let expected = next_state(AGENT_TRANSITIONS, state, event);
                match machine.handle(event) {
                    Ok(to) => assert_eq!(Some(to), expected),
                    Err(_) => {
                        assert!(expected.is_none());
                        assert_eq!(machine.state(), state, "{state:?} changed on {event:?}");
                    },
                }
            }
        }
    }

    #[test]
    fn test_fatal_is_terminal() {
        for event in AgentEvent::ALL {
            assert_eq!(next_state(AGENT_TRANSITIONS, AgentState::Fatal, event), None);
        }
    }

    #[test]
    fn test_commands_only_from_ready() {
        for state in AgentState::ALL {
            let accepted = next_state(AGENT_TRANSITIONS, state, AgentEvent::DataReceived);
            let expected = matches!(state, AgentState::Ready | AgentState::SocketConnected);
            assert_eq!(accepted.is_some(), expected, "{state:?}");
        }
    }

    #[test]
    fn test_full_handshake_path() {
        let mut m = StateMachine::new(AgentState::Disconnected, AGENT_TRANSITIONS);
        for event in [
            AgentEvent::ConnectRequested,
            AgentEvent::SocketConnected,
            AgentEvent::DataReceived,
            AgentEvent::WriteOk,
            AgentEvent::DataChunk,
            AgentEvent::DataComplete,
        ] {
            m.handle(event).unwrap();
        }
        assert_eq!(m.state(), AgentState::Ready);
    }

    #[test]
    fn test_error_cleanup_paths() {
        let mut m = StateMachine::new(AgentState::Waiting, AGENT_TRANSITIONS);
        m.handle(AgentEvent::ErrorOccurred).unwrap();
        m.handle(AgentEvent::CleanupRequested).unwrap();
        assert_eq!(m.state(), AgentState::Closing);
        m.handle(AgentEvent::CleanupError).unwrap();
        assert_eq!(m.state(), AgentState::Fatal);
    }
}
