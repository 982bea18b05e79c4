//! Node configuration.
//!
//! The protocol timeouts are fixed constants in `tether-wire`; this file only
//! covers the knobs an embedding node can tune.

use serde::{Deserialize, Serialize};

/// Default frame limit for stream transports (16 MB).
pub const DEFAULT_MAX_MESSAGE_SIZE: u32 = 16 * 1024 * 1024;

/// Top-level configuration, usually read from `~/.tether/config.toml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TetherConfig {
    /// Human-readable node name, used in logs.
    pub node_name: String,
    /// Address the TCP node listens on.
    pub listen_addr: String,
    /// Largest accepted frame in bytes.
    pub max_message_size: u32,
    /// Register the builtin `toolkit` object type on every peer.
    pub builtin_toolkit: bool,
    /// Default tracing filter when `RUST_LOG` is unset.
    pub log_level: String,
}

impl Default for TetherConfig {
    fn default() -> Self {
        Self {
            node_name: "tether-node".to_string(),
            listen_addr: "127.0.0.1:4760".to_string(),
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            builtin_toolkit: true,
            log_level: "info".to_string(),
        }
    }
}

impl TetherConfig {
    /// Parse a TOML document; missing fields take their defaults.
    pub fn from_toml(contents: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(contents)
    }
}
