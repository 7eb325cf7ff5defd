//! Agent side: authenticated TCP sessions to the backend agent.
//!
//! # Handshake
//!
//! ```text
//! Relay                                   Backend
//!   |------ TCP connect (port) --------------->|
//!   |------ 16-byte nonce -------------------->|
//!   |<----- OK Pleased to meet you ------------|
//!   |                                          |
//!   |------ COMMAND args\n ------------------->|
//!   |<----- S ... / D ... / OK|ERR|INQUIRE ----|
//! ```
//!
//! Connect and greeting are each bounded by a short timeout. Command
//! responses are not: the backend may be waiting on a PIN entry, and a
//! closed transport is the only sign of a stalled command.
//!
//! # State Machine
//!
//! ```text
//! Disconnected -> Connecting -> SocketConnected -> Sending -> Waiting -> Ready
//!                                                     ^                  |
//!                                                     +------------------+
//! any active state -> Error -> Closing -> Disconnected | Fatal
//! ```

mod coordinator;
mod driver;
mod session;
mod state;

pub use coordinator::{AgentCoordinator, Connector, TcpConnector};
pub use session::{AgentResponse, AgentSession};
pub use state::{AgentEvent, AgentState, AGENT_TRANSITIONS};
