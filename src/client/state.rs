//! Client-side session states and transition table.

use crate::machine::Transition;

/// Client-side session state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClientState {
    /// Not yet accepted, or fully cleaned up
    Disconnected,
    /// Accepted; waiting on the bridge `connect`
    Connecting,
    /// Idle, waiting for the next command line
    Ready,
    /// Collecting a command line
    BufferingCommand,
    /// Collecting a D/END reply to an INQUIRE
    BufferingInquire,
    /// Handing a unit to the bridge
    Sending,
    /// Bridge call in flight
    Waiting,
    /// Writing the response back to the client
    Relaying,
    /// Failed; cleanup pending
    Error,
    /// Tearing down
    Closing,
    /// Cleanup failed; session is discarded
    Fatal,
}

impl ClientState {
    /// Every state, for exhaustive table checks.
    pub const ALL: [ClientState; 11] = [
        Self::Disconnected,
        Self::Connecting,
        Self::Ready,
        Self::BufferingCommand,
        Self::BufferingInquire,
        Self::Sending,
        Self::Waiting,
        Self::Relaying,
        Self::Error,
        Self::Closing,
        Self::Fatal,
    ];
}

/// Client-side session event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClientEvent {
    /// Client transport accepted
    ClientConnected,
    /// Bridge `connect` returned and the greeting was relayed
    BridgeConnected,
    /// Bytes arrived from the client
    ClientData,
    /// A whole command line is buffered
    CommandComplete,
    /// A whole D/END block is buffered
    InquireComplete,
    /// The unit was handed to the bridge
    CallDispatched,
    /// The bridge returned a response
    ResponseReceived,
    /// An `OK`/`ERR` response reached the client
    ResponseRelayed,
    /// An `INQUIRE` reached the client
    InquireRelayed,
    /// Any failure
    ErrorOccurred,
    /// Teardown asked for (client closed, shutdown, or after an error)
    CleanupRequested,
    /// Teardown succeeded
    CleanupComplete,
    /// Teardown failed
    CleanupError,
}

impl ClientEvent {
    /// Every event, for exhaustive table checks.
    pub const ALL: [ClientEvent; 13] = [
        Self::ClientConnected,
        Self::BridgeConnected,
        Self::ClientData,
        Self::CommandComplete,
        Self::InquireComplete,
        Self::CallDispatched,
        Self::ResponseReceived,
        Self::ResponseRelayed,
        Self::InquireRelayed,
        Self::ErrorOccurred,
        Self::CleanupRequested,
        Self::CleanupComplete,
        Self::CleanupError,
    ];
}

use ClientEvent as E;
use ClientState as S;

/// The client-side transition table.
pub const CLIENT_TRANSITIONS: &[Transition<ClientState, ClientEvent>] = &[
    // Handshake
    Transition::new(S::Disconnected, E::ClientConnected, S::Connecting),
    Transition::new(S::Connecting, E::BridgeConnected, S::Ready),
    // Command path
    Transition::new(S::Ready, E::ClientData, S::BufferingCommand),
    Transition::new(S::BufferingCommand, E::ClientData, S::BufferingCommand),
    Transition::new(S::BufferingCommand, E::CommandComplete, S::Sending),
    // INQUIRE path
    Transition::new(S::BufferingInquire, E::ClientData, S::BufferingInquire),
    Transition::new(S::BufferingInquire, E::InquireComplete, S::Sending),
    // Dispatch and relay
    Transition::new(S::Sending, E::CallDispatched, S::Waiting),
    // Bytes written ahead by the client are held until the response is relayed
    Transition::new(S::Waiting, E::ClientData, S::Waiting),
    Transition::new(S::Waiting, E::ResponseReceived, S::Relaying),
    Transition::new(S::Relaying, E::ResponseRelayed, S::Ready),
    Transition::new(S::Relaying, E::InquireRelayed, S::BufferingInquire),
    // Failures
    Transition::new(S::Connecting, E::ErrorOccurred, S::Error),
    Transition::new(S::Ready, E::ErrorOccurred, S::Error),
    Transition::new(S::BufferingCommand, E::ErrorOccurred, S::Error),
    Transition::new(S::BufferingInquire, E::ErrorOccurred, S::Error),
    Transition::new(S::Sending, E::ErrorOccurred, S::Error),
    Transition::new(S::Waiting, E::ErrorOccurred, S::Error),
    Transition::new(S::Relaying, E::ErrorOccurred, S::Error),
    // Teardown
    Transition::new(S::Error, E::CleanupRequested, S::Closing),
    Transition::new(S::Connecting, E::CleanupRequested, S::Closing),
    Transition::new(S::Ready, E::CleanupRequested, S::Closing),
    Transition::new(S::BufferingCommand, E::CleanupRequested, S::Closing),
    Transition::new(S::BufferingInquire, E::CleanupRequested, S::Closing),
    Transition::new(S::Sending, E::CleanupRequested, S::Closing),
    Transition::new(S::Waiting, E::CleanupRequested, S::Closing),
    Transition::new(S::Relaying, E::CleanupRequested, S::Closing),
    Transition::new(S::Closing, E::CleanupComplete, S::Disconnected),
    Transition::new(S::Closing, E::CleanupError, S::Fatal),
];

#[cfg(test)]
mod tests {
    use super::*;
    use crate::machine::{next_state, StateMachine};

    #[test]
    fn test_table_has_no_duplicate_pairs() {
        for (i, a) in CLIENT_TRANSITIONS.iter().enumerate() {
            for b in &CLIENT_TRANSITIONS[i + 1..] {
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
        for state in ClientState::ALL {
            for event in ClientEvent::ALL {
                let mut machine = StateMachine::new(state, CLIENT_TRANSITIONS);
                let expected = next_state(CLIENT_TRANSITIONS, state, event);
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
        for event in ClientEvent::ALL {
            assert_eq!(next_state(CLIENT_TRANSITIONS, ClientState::Fatal, event), None);
        }
    }

    #[test]
    fn test_dispatch_only_from_sending() {
        for state in ClientState::ALL {
            let accepted = next_state(CLIENT_TRANSITIONS, state, ClientEvent::CallDispatched);
            assert_eq!(accepted.is_some(), state == ClientState::Sending, "{state:?}");
        }
    }

    #[test]
    fn test_inquire_round_trip() {
        let mut m = StateMachine::new(ClientState::Ready, CLIENT_TRANSITIONS);
        for (event, expected) in [
            (ClientEvent::ClientData, ClientState::BufferingCommand),
            (ClientEvent::CommandComplete, ClientState::Sending),
            (ClientEvent::CallDispatched, ClientState::Waiting),
            (ClientEvent::ResponseReceived, ClientState::Relaying),
            (ClientEvent::InquireRelayed, ClientState::BufferingInquire),
            (ClientEvent::InquireComplete, ClientState::Sending),
            (ClientEvent::CallDispatched, ClientState::Waiting),
            (ClientEvent::ResponseReceived, ClientState::Relaying),
            (ClientEvent::ResponseRelayed, ClientState::Ready),
        ] {
            assert_eq!(m.handle(event).unwrap(), expected);
        }
    }

    #[test]
    fn test_every_active_state_can_clean_up() {
        for state in ClientState::ALL {
            let active = !matches!(
                state,
                ClientState::Disconnected | ClientState::Closing | ClientState::Fatal
            );
            let accepted = next_state(CLIENT_TRANSITIONS, state, ClientEvent::CleanupRequested);
            assert_eq!(accepted.is_some(), active, "{state:?}");
        }
    }
}
