// Synchronization engine configuration.
//
// Loaded from a TOML file by the embedding application. Every field has
// a default, so a missing or partial file still yields a working setup.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::session::ReconnectPolicy;

/// Tunables for room sessions, awareness, and maintenance.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SyncConfig {
    /// How long discovery waits for the first peer before reporting a
    /// solo room, in milliseconds.
    pub discovery_timeout_ms: u64,
    /// Base delay for reconnection backoff, in milliseconds.
    pub reconnect_base_delay_ms: u64,
    /// Cap for reconnection backoff, in milliseconds.
    pub reconnect_max_delay_ms: u64,
    /// Reconnection attempts before a lost peer is given up.
    pub reconnect_max_attempts: u32,
    /// Awareness broadcasts inside this window coalesce into one frame,
    /// in milliseconds.
    pub awareness_throttle_ms: u64,
    /// A peer with no channel traffic for this long has its presence
    /// expired, in milliseconds.
    pub awareness_timeout_ms: u64,
    /// Interval between divergence digest probes, in milliseconds
    /// (0 disables probes and periodic maintenance).
    pub digest_probe_interval_ms: u64,
    /// Whether acknowledged tombstones are pruned during maintenance.
    pub compaction: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            discovery_timeout_ms: 5_000,
            reconnect_base_delay_ms: 250,
            reconnect_max_delay_ms: 30_000,
            reconnect_max_attempts: u32::MAX,
            awareness_throttle_ms: 150,
            awareness_timeout_ms: 15_000,
            digest_probe_interval_ms: 30_000,
            compaction: true,
        }
    }
}

impl SyncConfig {
    /// Load from a TOML file. Returns defaults if the file doesn't exist
    /// or can't be parsed.
    pub fn load(path: &Path) -> Self {
        Self::load_from(path).unwrap_or_default()
    }

    /// Load from a specific path.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(ConfigError::Io)?;
        Self::parse(&contents)
    }

    /// Parse from TOML text.
    pub fn parse(contents: &str) -> Result<Self, ConfigError> {
        toml::from_str(contents).map_err(ConfigError::Parse)
    }

    pub fn discovery_timeout(&self) -> Duration {
        Duration::from_millis(self.discovery_timeout_ms)
    }

    pub fn awareness_throttle(&self) -> Duration {
        Duration::from_millis(self.awareness_throttle_ms)
    }

    pub fn awareness_timeout(&self) -> Duration {
        Duration::from_millis(self.awareness_timeout_ms)
    }

    /// `None` when digest probes are disabled.
    pub fn digest_probe_interval(&self) -> Option<Duration> {
        (self.digest_probe_interval_ms > 0)
            .then(|| Duration::from_millis(self.digest_probe_interval_ms))
    }

    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            base_delay: Duration::from_millis(self.reconnect_base_delay_ms),
            max_delay: Duration::from_millis(self.reconnect_max_delay_ms),
            max_attempts: self.reconnect_max_attempts,
        }
    }
}

// ── Errors ─────────────────────────────────────────────────────────

#[derive(Debug)]
pub enum ConfigError {
    Io(std::io::Error),
    Parse(toml::de::Error),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(e) => write!(f, "config I/O error: {e}"),
            Self::Parse(e) => write!(f, "config parse error: {e}"),
        }
    }
}

impl std::error::Error for ConfigError {}
