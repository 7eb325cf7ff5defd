//! Configuration management.
//!
//! Supports configuration from:
//! - TOML config files
//! - Environment variables (`ASSUAN_RELAY_*`)
//! - CLI arguments (applied by the binary on top of the merged result)

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{RelayError, Result};

/// Main configuration struct
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Agent-side (backend) configuration
    #[serde(default)]
    pub agent: AgentConfig,

    /// Client-side (listener) configuration
    #[serde(default)]
    pub client: ClientConfig,

    /// Cross-boundary stream transport configuration
    #[serde(default)]
    pub bridge: BridgeConfig,
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let content = std::fs::read_to_string(&path)
            .map_err(|e| RelayError::Config(format!("Failed to read config file: {e}")))?;

        toml::from_str(&content)
            .map_err(|e| RelayError::Config(format!("Failed to parse config: {e}")))
    }

    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        Self::from_vars(|name| std::env::var(name).ok())
    }

    fn from_vars(var: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        // Agent settings
        if let Some(path) = var("ASSUAN_RELAY_DESCRIPTOR") {
            config.agent.descriptor_path = PathBuf::from(path);
        }
        if let Some(host) = var("ASSUAN_RELAY_AGENT_HOST") {
            config.agent.host = host;
        }
        if let Some(val) = var("ASSUAN_RELAY_AGENT_MAX_SESSIONS").and_then(|v| v.parse().ok()) {
            config.agent.max_sessions = val;
        }

        // Client settings
        if let Some(path) = var("ASSUAN_RELAY_SOCKET") {
            config.client.socket_path = PathBuf::from(path);
        }
        if let Some(val) = var("ASSUAN_RELAY_CLIENT_MAX_SESSIONS").and_then(|v| v.parse().ok()) {
            config.client.max_sessions = val;
        }
        if let Some(val) = var("ASSUAN_RELAY_IDLE_TIMEOUT_MS").and_then(|v| v.parse().ok()) {
            config.client.idle_timeout_ms = Some(val);
        }

        // Bridge settings
        if let Some(addr) = var("ASSUAN_RELAY_BRIDGE_ADDR").and_then(|v| v.parse().ok()) {
            config.bridge.addr = addr;
        }

        config
    }

    /// Merge with another config (other takes precedence where it differs from defaults)
    pub fn merge(self, other: Self) -> Self {
        fn pick<T: PartialEq>(base: T, other: T, default: T) -> T {
            if other == default {
                base
            } else {
                other
            }
        }

        let agent_default = AgentConfig::default();
        let client_default = ClientConfig::default();
        let bridge_default = BridgeConfig::default();

        Self {
            agent: AgentConfig {
                descriptor_path: pick(
                    self.agent.descriptor_path,
                    other.agent.descriptor_path,
                    agent_default.descriptor_path,
                ),
                host: pick(self.agent.host, other.agent.host, agent_default.host),
                connect_timeout_ms: pick(
                    self.agent.connect_timeout_ms,
                    other.agent.connect_timeout_ms,
                    agent_default.connect_timeout_ms,
                ),
                greeting_timeout_ms: pick(
                    self.agent.greeting_timeout_ms,
                    other.agent.greeting_timeout_ms,
                    agent_default.greeting_timeout_ms,
                ),
                max_sessions: pick(
                    self.agent.max_sessions,
                    other.agent.max_sessions,
                    agent_default.max_sessions,
                ),
                max_response_bytes: pick(
                    self.agent.max_response_bytes,
                    other.agent.max_response_bytes,
                    agent_default.max_response_bytes,
                ),
            },
            client: ClientConfig {
                socket_path: pick(
                    self.client.socket_path,
                    other.client.socket_path,
                    client_default.socket_path,
                ),
                max_sessions: pick(
                    self.client.max_sessions,
                    other.client.max_sessions,
                    client_default.max_sessions,
                ),
                max_buffer_bytes: pick(
                    self.client.max_buffer_bytes,
                    other.client.max_buffer_bytes,
                    client_default.max_buffer_bytes,
                ),
                idle_timeout_ms: other.client.idle_timeout_ms.or(self.client.idle_timeout_ms),
                socket_mode: pick(
                    self.client.socket_mode,
                    other.client.socket_mode,
                    client_default.socket_mode,
                ),
            },
            bridge: BridgeConfig {
                addr: pick(self.bridge.addr, other.bridge.addr, bridge_default.addr),
                max_line_bytes: pick(
                    self.bridge.max_line_bytes,
                    other.bridge.max_line_bytes,
                    bridge_default.max_line_bytes,
                ),
            },
        }
    }
}

/// Agent-side configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Descriptor file written by the backend agent (`<port>\n<nonce>`)
    pub descriptor_path: PathBuf,

    /// Host the backend listens on
    pub host: String,

    /// TCP connect timeout in milliseconds
    pub connect_timeout_ms: u64,

    /// Greeting timeout in milliseconds
    pub greeting_timeout_ms: u64,

    /// Maximum concurrent backend sessions
    pub max_sessions: usize,

    /// Maximum accumulated response size in bytes
    pub max_response_bytes: usize,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            descriptor_path: dirs::home_dir()
                .unwrap_or_else(std::env::temp_dir)
                .join(".gnupg")
                .join("S.gpg-agent"),
            host: "127.0.0.1".to_string(),
            connect_timeout_ms: 5_000,
            greeting_timeout_ms: 5_000,
            max_sessions: 32,
            max_response_bytes: 1024 * 1024, // 1 MiB
        }
    }
}

impl AgentConfig {
    /// Connect timeout as a duration
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Greeting timeout as a duration
    pub fn greeting_timeout(&self) -> Duration {
        Duration::from_millis(self.greeting_timeout_ms)
    }

    /// Set descriptor path
    pub fn with_descriptor(mut self, path: impl Into<PathBuf>) -> Self {
        self.descriptor_path = path.into();
        self
    }

    /// Set maximum concurrent sessions
    pub fn with_max_sessions(mut self, max: usize) -> Self {
        self.max_sessions = max;
        self
    }

    /// Set maximum response size
    pub fn with_max_response_bytes(mut self, max: usize) -> Self {
        self.max_response_bytes = max;
        self
    }

    /// Set both handshake timeouts
    pub fn with_timeouts(mut self, connect: Duration, greeting: Duration) -> Self {
        self.connect_timeout_ms = connect.as_millis() as u64;
        self.greeting_timeout_ms = greeting.as_millis() as u64;
        self
    }
}

/// Client-side configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Unix socket protocol clients connect to
    pub socket_path: PathBuf,

    /// Maximum concurrent client sessions
    pub max_sessions: usize,

    /// Maximum buffered client bytes (commands and INQUIRE replies alike)
    pub max_buffer_bytes: usize,

    /// Close clients that send nothing this long after the greeting
    pub idle_timeout_ms: Option<u64>,

    /// Permission bits applied to the socket file
    pub socket_mode: u32,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            socket_path: dirs::runtime_dir()
                .unwrap_or_else(std::env::temp_dir)
                .join("gnupg")
                .join("S.gpg-agent"),
            max_sessions: 32,
            max_buffer_bytes: 1024 * 1024, // 1 MiB
            idle_timeout_ms: None,
            socket_mode: 0o600,
        }
    }
}

impl ClientConfig {
    /// Idle timeout as a duration
    pub fn idle_timeout(&self) -> Option<Duration> {
        self.idle_timeout_ms.map(Duration::from_millis)
    }

    /// Set socket path
    pub fn with_socket(mut self, path: impl Into<PathBuf>) -> Self {
        self.socket_path = path.into();
        self
    }

    /// Set maximum concurrent sessions
    pub fn with_max_sessions(mut self, max: usize) -> Self {
        self.max_sessions = max;
        self
    }

    /// Set buffer cap
    pub fn with_max_buffer_bytes(mut self, max: usize) -> Self {
        self.max_buffer_bytes = max;
        self
    }

    /// Set idle timeout
    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout_ms = Some(timeout.as_millis() as u64);
        self
    }
}

/// Stream bridge configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Address the agent side listens on and the client side connects to
    pub addr: SocketAddr,

    /// Maximum length of one bridge message line
    pub max_line_bytes: usize,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            addr: SocketAddr::from(([127, 0, 0, 1], 63331)),
            max_line_bytes: 4 * 1024 * 1024, // 4 MiB
        }
    }
}
