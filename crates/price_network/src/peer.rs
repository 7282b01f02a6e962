//! Peer registry: the live table of connected peers and their sockets.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::identity::PeerId;
use crate::transport::PeerConnection;

/// Which side opened the socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PeerRole {
    /// Accepted by our server.
    Inbound,
    /// Dialed by us.
    Outbound,
}

/// Connection state of a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PeerState {
    Connected,
    /// Terminal; only ever seen on the snapshot carried by a disconnect event.
    Disconnected,
}

/// Information about a connected peer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerInfo {
    pub id: PeerId,
    pub host: String,
    /// Dial port for outbound peers; the remote socket port for inbound ones.
    pub port: u16,
    pub role: PeerRole,
    pub state: PeerState,
    pub connected_at: DateTime<Utc>,
    /// Last time we received any message from this peer.
    pub last_seen: DateTime<Utc>,
    pub protocol_version: String,
    pub region: Option<String>,
}

impl PeerInfo {
    /// A freshly connected peer.
    pub fn connected(id: PeerId, host: impl Into<String>, port: u16, role: PeerRole) -> Self {
        let now = Utc::now();
        Self {
            id,
            host: host.into(),
            port,
            role,
            state: PeerState::Connected,
            connected_at: now,
            last_seen: now,
            protocol_version: crate::identity::PROTOCOL_VERSION.to_string(),
            region: None,
        }
    }

    pub fn with_region(mut self, region: Option<String>) -> Self {
        self.region = region;
        self
    }
}

/// A registry row: peer metadata plus the handle used to write to it.
#[derive(Debug, Clone)]
pub struct PeerEntry {
    pub info: PeerInfo,
    pub connection: PeerConnection,
}

/// Registry of connected peers, keyed by [`PeerId`].
///
/// A peer lives here for exactly one socket lifetime. Callers share it as
/// `Arc<RwLock<PeerRegistry>>`.
#[derive(Debug, Default)]
pub struct PeerRegistry {
    peers: HashMap<PeerId, PeerEntry>,
}

impl PeerRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            peers: HashMap::new(),
        }
    }

    /// Add a peer. Returns `false`, leaving the registry untouched, if the
    /// id is already taken.
    pub fn insert(&mut self, info: PeerInfo, connection: PeerConnection) -> bool {
        if self.peers.contains_key(&info.id) {
            return false;
        }
        self.peers
            .insert(info.id.clone(), PeerEntry { info, connection });
        true
    }

    pub fn contains(&self, peer_id: &PeerId) -> bool {
        self.peers.contains_key(peer_id)
    }

    /// Remove a peer by ID.
    pub fn remove_peer(&mut self, peer_id: &PeerId) -> Option<PeerEntry> {
        self.peers.remove(peer_id)
    }

    /// Remove a peer only if it is still backed by socket `conn_id`.
    ///
    /// A read loop that outlives its registry row must not evict a newer
    /// connection that reused the same dial key.
    pub fn remove_connection(&mut self, peer_id: &PeerId, conn_id: u64) -> Option<PeerEntry> {
        match self.peers.get(peer_id) {
            Some(entry) if entry.connection.conn_id() == conn_id => self.peers.remove(peer_id),
            _ => None,
        }
    }

    /// Get a peer by ID.
    pub fn get_peer(&self, peer_id: &PeerId) -> Option<&PeerInfo> {
        self.peers.get(peer_id).map(|e| &e.info)
    }

    /// Id of the peer at `host:port`: the dial key for outbound peers, or an
    /// inbound peer whose remote address matches.
    pub fn find_by_endpoint(&self, host: &str, port: u16) -> Option<PeerId> {
        let dial_key = PeerId::for_dial(host, port);
        if self.peers.contains_key(&dial_key) {
            return Some(dial_key);
        }
        self.peers
            .values()
            .find(|e| e.info.port == port && e.info.host.eq_ignore_ascii_case(host))
            .map(|e| e.info.id.clone())
    }

    /// Write handle for a peer.
    pub fn connection(&self, peer_id: &PeerId) -> Option<PeerConnection> {
        self.peers.get(peer_id).map(|e| e.connection.clone())
    }

    /// List all peers that are currently connected.
    pub fn list_connected(&self) -> Vec<&PeerInfo> {
        self.peers
            .values()
            .filter(|e| e.info.state == PeerState::Connected)
            .map(|e| &e.info)
            .collect()
    }

    /// Snapshot of write handles for every connected peer.
    pub fn connected_handles(&self) -> Vec<(PeerId, PeerConnection)> {
        self.peers
            .values()
            .filter(|e| e.info.state == PeerState::Connected && !e.connection.is_closed())
            .map(|e| (e.info.id.clone(), e.connection.clone()))
            .collect()
    }

    /// List all peers.
    pub fn list_all(&self) -> Vec<&PeerInfo> {
        self.peers.values().map(|e| &e.info).collect()
    }

    /// Return the number of connected peers.
    pub fn connected_count(&self) -> usize {
        self.list_connected().len()
    }

    /// Return the total number of peers.
    pub fn total_count(&self) -> usize {
        self.peers.len()
    }

    /// Update the last-seen timestamp for a peer.
    pub fn update_last_seen(&mut self, peer_id: &PeerId) {
        if let Some(entry) = self.peers.get_mut(peer_id) {
            entry.info.last_seen = Utc::now();
        }
    }

    /// Remove every peer and hand the rows back.
    pub fn drain(&mut self) -> Vec<PeerEntry> {
        self.peers.drain().map(|(_, entry)| entry).collect()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
