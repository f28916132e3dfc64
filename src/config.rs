//! Configuration for the signaling client

use serde::{Deserialize, Serialize};
use std::error::Error;
use std::fmt;
use std::path::Path;
use std::time::Duration;

/// ICE server entry passed through to the media backend
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IceServerConfig {
    /// Server URLs (stun:/turn:)
    pub urls: Vec<String>,

    /// TURN username
    #[serde(default)]
    pub username: Option<String>,

    /// TURN credential
    #[serde(default)]
    pub credential: Option<String>,
}

impl IceServerConfig {
    /// A single STUN server entry
    pub fn stun(url: &str) -> Self {
        Self {
            urls: vec![url.to_string()],
            username: None,
            credential: None,
        }
    }
}

/// Client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Addresses the listener role asks the transport to listen on
    #[serde(default = "default_listen_addrs")]
    pub listen_addrs: Vec<String>,

    /// Relay WebSocket port (used to derive the relay listen address)
    #[serde(default = "default_relay_port")]
    pub relay_port: u16,

    /// Interval between WebRTC address readiness checks, in milliseconds
    #[serde(default = "default_readiness_poll_ms")]
    pub readiness_poll_ms: u64,

    /// Maximum readiness checks before giving up
    #[serde(default = "default_readiness_max_attempts")]
    pub readiness_max_attempts: u32,

    /// Timeout for relay and peer dials, in seconds
    #[serde(default = "default_dial_timeout_secs")]
    pub dial_timeout_secs: u64,

    /// ICE servers handed to the media backend
    #[serde(default = "default_ice_servers")]
    pub ice_servers: Vec<IceServerConfig>,
}

fn default_listen_addrs() -> Vec<String> {
    vec!["/p2p-circuit".to_string(), "/webrtc".to_string()]
}

fn default_relay_port() -> u16 {
    crate::relay::DEFAULT_RELAY_PORT
}

fn default_readiness_poll_ms() -> u64 {
    1000
}

fn default_readiness_max_attempts() -> u32 {
    30
}

fn default_dial_timeout_secs() -> u64 {
    30
}

fn default_ice_servers() -> Vec<IceServerConfig> {
    vec![IceServerConfig::stun("stun:stun.l.google.com:19302")]
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            listen_addrs: default_listen_addrs(),
            relay_port: default_relay_port(),
            readiness_poll_ms: default_readiness_poll_ms(),
            readiness_max_attempts: default_readiness_max_attempts(),
            dial_timeout_secs: default_dial_timeout_secs(),
            ice_servers: default_ice_servers(),
        }
    }
}

impl ClientConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path.as_ref())
            .map_err(|e| ConfigError::Io(format!("{}: {}", path.as_ref().display(), e)))?;
        toml::from_str(&contents).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Dial timeout as a `Duration`
    pub fn dial_timeout(&self) -> Duration {
        Duration::from_secs(self.dial_timeout_secs)
    }

    /// Readiness poll interval as a `Duration`
    pub fn readiness_poll_interval(&self) -> Duration {
        Duration::from_millis(self.readiness_poll_ms)
    }
}

/// Configuration loading errors
#[derive(Debug)]
pub enum ConfigError {
    /// File could not be read
    Io(String),
    /// TOML contents were invalid
    Parse(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Io(msg) => write!(f, "Config read failed: {}", msg),
            ConfigError::Parse(msg) => write!(f, "Config parse failed: {}", msg),
        }
    }
}

impl Error for ConfigError {}
