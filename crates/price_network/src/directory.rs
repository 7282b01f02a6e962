//! Server directory: the persisted list of known price-sharing servers.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::NetworkError;

/// A known server a node can dial.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerEntry {
    pub name: String,
    pub host: String,
    pub port: u16,
    /// Use `https` for the health probe.
    #[serde(default, alias = "isSecure")]
    pub secure: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    /// Result of the last health probe.
    #[serde(default, alias = "isActive")]
    pub active: bool,
    #[serde(default)]
    pub last_seen: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl ServerEntry {
    pub fn new(name: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            name: name.into(),
            host: host.into(),
            port,
            secure: false,
            region: None,
            active: false,
            last_seen: DateTime::<Utc>::default(),
            description: None,
        }
    }

    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.region = Some(region.into());
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn in_region(&self, region: &str) -> bool {
        self.region
            .as_deref()
            .is_some_and(|r| r.eq_ignore_ascii_case(region))
    }
}

/// The built-in server list.
pub fn default_servers() -> Vec<ServerEntry> {
    vec![
        ServerEntry::new("AusPriceShare-Sydney", "price.aus.example.com", 8080)
            .with_region("NSW")
            .with_description("Community price server for New South Wales"),
        ServerEntry::new("AusPriceShare-Melbourne", "price.vic.example.com", 8080)
            .with_region("VIC")
            .with_description("Community price server for Victoria"),
        ServerEntry::new("LocalTestServer", "localhost", 8081)
            .with_region("Local")
            .with_description("Node running on this machine"),
    ]
}

/// Known servers, backed by a JSON file. Every mutation rewrites the file.
#[derive(Debug)]
pub struct ServerDirectory {
    path: PathBuf,
    servers: Vec<ServerEntry>,
}

impl ServerDirectory {
    /// Load the directory at `path`.
    ///
    /// A missing or unreadable file is replaced by the defaults, which are
    /// written back immediately.
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let loaded = match std::fs::read_to_string(&path) {
            Ok(data) => match serde_json::from_str::<Vec<ServerEntry>>(&data) {
                Ok(servers) => Some(servers),
                Err(e) => {
                    warn!("Corrupt server directory {}, using defaults: {e}", path.display());
                    None
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => {
                warn!("Cannot read server directory {}, using defaults: {e}", path.display());
                None
            }
        };

        let fresh = loaded.is_none();
        let directory = Self {
            path,
            servers: loaded.unwrap_or_else(default_servers),
        };
        if fresh {
            if let Err(e) = directory.save() {
                warn!("Failed to persist default server directory: {e}");
            }
        }
        info!(
            "Server directory loaded from {} ({} entries)",
            directory.path.display(),
            directory.servers.len()
        );
        directory
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn save(&self) -> Result<(), NetworkError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| NetworkError::Directory(format!("Failed to create directory: {e}")))?;
        }
        let json = serde_json::to_string_pretty(&self.servers)?;
        std::fs::write(&self.path, json).map_err(|e| {
            NetworkError::Directory(format!("Failed to write {}: {e}", self.path.display()))
        })
    }

    /// Every entry.
    pub fn all(&self) -> &[ServerEntry] {
        &self.servers
    }

    /// Entries whose last probe succeeded.
    pub fn active(&self) -> Vec<ServerEntry> {
        self.servers.iter().filter(|s| s.active).cloned().collect()
    }

    /// Active entries in `region`.
    pub fn by_region(&self, region: &str) -> Vec<ServerEntry> {
        self.servers
            .iter()
            .filter(|s| s.active && s.in_region(region))
            .cloned()
            .collect()
    }

    pub fn get_by_name(&self, name: &str) -> Option<&ServerEntry> {
        self.servers.iter().find(|s| s.name.eq_ignore_ascii_case(name))
    }

    /// Replace the entry with the same name, or append it.
    pub fn add_or_update(&mut self, entry: ServerEntry) -> Result<(), NetworkError> {
        match self.servers.iter_mut().find(|s| s.name == entry.name) {
            Some(existing) => *existing = entry,
            None => self.servers.push(entry),
        }
        self.save()
    }

    /// Record a probe result. Returns `false` if no entry has that name.
    pub fn update_status(
        &mut self,
        name: &str,
        active: bool,
        last_seen: Option<DateTime<Utc>>,
    ) -> Result<bool, NetworkError> {
        let Some(entry) = self
            .servers
            .iter_mut()
            .find(|s| s.name.eq_ignore_ascii_case(name))
        else {
            return Ok(false);
        };
        entry.active = active;
        entry.last_seen = last_seen.unwrap_or_else(Utc::now);
        self.save()?;
        Ok(true)
    }

    /// Remove an entry. Returns `false` if no entry has that name.
    pub fn remove(&mut self, name: &str) -> Result<bool, NetworkError> {
        let before = self.servers.len();
        self.servers.retain(|s| !s.name.eq_ignore_ascii_case(name));
        if self.servers.len() == before {
            return Ok(false);
        }
        self.save()?;
        Ok(true)
    }

    pub fn reset_to_defaults(&mut self) -> Result<(), NetworkError> {
        self.servers = default_servers();
        self.save()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
