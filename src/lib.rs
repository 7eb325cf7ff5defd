//! # Assuan Relay - agent protocol forwarding across a boundary
//!
//! Relays a line-oriented Assuan agent protocol between local clients and a
//! backend agent that listens on TCP behind a port + nonce descriptor.
//!
//! ## Features
//!
//! - **Strict ordering**: one outstanding command per session, enforced by
//!   table-driven state machines
//! - **INQUIRE sub-protocol**: D/END reply blocks buffered and forwarded as
//!   one unit, nested inquiries included
//! - **Bounded memory**: every accumulation buffer has a hard cap; overflow
//!   ends the session instead of truncating
//! - **Non-hanging cleanup**: ordered two-step teardown, first error wins,
//!   and bulk shutdown that a failed cleanup cannot stall
//!
//! ## Architecture
//!
//! ```text
//!  Assuan client          Client side              Agent side             Backend
//!       |                      |                        |                     |
//!       |-- unix socket ------>| ClientListener         |                     |
//!       |                      |   ClientSession        |                     |
//!       |                      |------ AgentBridge ---->| AgentCoordinator    |
//!       |                      |  (in-process or        |   AgentSession      |
//!       |                      |   JSON-lines stream)   |------ TCP + nonce ->|
//! ```
//!
//! ### Wire Protocol
//!
//! | Line                   | Meaning                               |
//! |------------------------|---------------------------------------|
//! | `COMMAND args\n`       | Client or relay command               |
//! | `OK [text]\n`          | Terminal success                      |
//! | `ERR <code> [text]\n`  | Terminal failure                      |
//! | `S <keyword> ...\n`    | Status, not terminal                  |
//! | `D <data>\n`           | Data line                             |
//! | `INQUIRE <keyword>\n`  | Agent asks for a D/END reply          |
//!
//! ## Quick Start
//!
//! ### Both sides in one process
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use assuan_relay::{AgentCoordinator, ClientListener, Config};
//!
//! let config = Config::from_file("relay.toml")?;
//! let agent = Arc::new(AgentCoordinator::bootstrap(config.agent)?);
//! let client = ClientListener::new(config.client, Arc::clone(&agent));
//!
//! let socket = client.bind()?;
//! client.serve(socket).await?;
//! ```
//!
//! ### Split across a boundary
//!
//! ```rust,ignore
//! use assuan_relay::{serve_bridge, StreamBridge};
//!
//! // Agent side
//! serve_bridge(listener, Arc::clone(&agent), max_line_bytes, shutdown).await?;
//!
//! // Client side
//! let bridge = Arc::new(StreamBridge::connect(addr, max_line_bytes).await?);
//! let client = ClientListener::new(config.client, bridge);
//! ```
//!
//! ## Modules
//!
//! - [`framing`]: Descriptor parsing, completion detection, extraction, cleanup
//! - [`agent`]: Backend sessions and their coordinator
//! - [`client`]: Client sessions and the socket listener
//! - [`bridge`]: Cross-boundary call interface and stream transport
//! - [`machine`]: Table-driven state machines
//! - [`config`]: Configuration management
//! - [`stats`]: Relay counters
//! - [`error`]: Error types and result aliases

pub mod agent;
pub mod bridge;
pub mod client;
pub mod config;
pub mod error;
pub mod framing;
pub mod machine;
pub mod stats;

// Re-exports for convenience
pub use agent::{AgentCoordinator, AgentSession, AgentState, Connector, TcpConnector};
pub use bridge::{serve_bridge, AgentBridge, Connected, StreamBridge};
pub use client::{ClientListener, ClientSession, ClientState};
pub use config::{AgentConfig, BridgeConfig, ClientConfig, Config};
pub use error::{RelayError, Result};
pub use framing::{
    cleanup_transport, detect_completion, extract_inquire_block, extract_inquire_reply, extract_line, parse_descriptor,
    sanitize, Completion, Descriptor, ResponseKind,
};
pub use stats::{RelayStats, StatsSummary};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
