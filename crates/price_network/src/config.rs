//! Network configuration for a price-sharing node.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Port the server listens on unless configured otherwise.
pub const DEFAULT_PORT: u16 = 8081;

/// Configuration for the price-sharing network layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Human-readable node name, used as the prefix of the node id.
    pub node_name: String,

    /// Host part of the listening address.
    pub bind_host: String,

    /// Port the server listens on.
    pub listen_port: u16,

    /// Region this node belongs to (e.g. "NSW"), used when discovering peers.
    pub region: Option<String>,

    /// Interval between heartbeats while the server runs. `None` disables them.
    #[serde(with = "opt_duration_serde")]
    pub heartbeat_interval: Option<Duration>,

    /// How far back a sync request asks for prices.
    #[serde(with = "duration_serde")]
    pub sync_window: Duration,

    /// How many of the most recent local records a sync response considers.
    pub sync_recent_limit: usize,

    /// Longest accepted frame in bytes.
    pub max_frame_len: usize,

    /// Timeout for the HTTP health probe against directory entries.
    #[serde(with = "duration_serde")]
    pub health_timeout: Duration,

    /// Longest a single send to one peer may take before that peer is
    /// disconnected.
    #[serde(with = "duration_serde")]
    pub write_timeout: Duration,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            node_name: "node".to_string(),
            bind_host: "0.0.0.0".to_string(),
            listen_port: DEFAULT_PORT,
            region: None,
            heartbeat_interval: Some(Duration::from_secs(30)),
            sync_window: Duration::from_secs(7 * 24 * 60 * 60),
            sync_recent_limit: 100,
            max_frame_len: 1024 * 1024,
            health_timeout: Duration::from_secs(5),
            write_timeout: Duration::from_secs(10),
        }
    }
}

impl NetworkConfig {
    /// Save the config to a JSON file.
    pub fn save_to_file(&self, path: &Path) -> Result<(), String> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| format!("Failed to create directory: {e}"))?;
        }
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| format!("Failed to serialize config: {e}"))?;
        std::fs::write(path, json).map_err(|e| format!("Failed to write config file: {e}"))
    }

    /// Load config from a JSON file, or return defaults if the file is missing.
    pub fn load_or_default(path: &Path) -> Self {
        if path.exists() {
            match std::fs::read_to_string(path) {
                Ok(data) => match serde_json::from_str::<NetworkConfig>(&data) {
                    Ok(config) => return config,
                    Err(e) => {
                        tracing::warn!("Corrupt config file, using defaults: {e}");
                    }
                },
                Err(e) => {
                    tracing::warn!("Cannot read config file, using defaults: {e}");
                }
            }
        }
        Self::default()
    }
}

// ---------------------------------------------------------------------------
// Serde helpers
// ---------------------------------------------------------------------------

mod duration_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(dur: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(dur.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = u64::deserialize(d)?;
        Ok(Duration::from_secs(secs))
    }
}

mod opt_duration_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(dur: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match dur {
            Some(d) => s.serialize_some(&d.as_secs()),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        let secs = Option::<u64>::deserialize(d)?;
        Ok(secs.filter(|s| *s > 0).map(Duration::from_secs))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
