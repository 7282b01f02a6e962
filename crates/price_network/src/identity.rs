//! Node and peer identifiers.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Protocol version advertised by this build.
pub const PROTOCOL_VERSION: &str = "1.0";

/// Registry key for a peer.
///
/// Dialed peers use their `host:port` dial key; accepted peers get a
/// generated `peer_<uuid>` id because their listening port is unknown.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerId(pub String);

impl PeerId {
    /// Key for an outbound connection to `host:port`.
    pub fn for_dial(host: &str, port: u16) -> Self {
        Self(format!("{host}:{port}"))
    }

    /// Fresh opaque id for an accepted connection.
    pub fn generate_inbound() -> Self {
        Self(format!("peer_{}", uuid::Uuid::new_v4().simple()))
    }

    /// Create a PeerId from an existing string.
    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Return the inner string representation.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// How this node introduces itself in the `senderId` of every envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeIdentity {
    /// Unique node id, `<name>_<8 hex chars>`.
    pub node_id: String,
    /// Human-readable name for the node (e.g. hostname).
    pub name: String,
    /// Wire protocol version.
    pub protocol_version: String,
}

impl NodeIdentity {
    /// Create a new identity with a fresh random suffix.
    pub fn generate(name: impl Into<String>) -> Self {
        let name = name.into();
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        Self {
            node_id: format!("{name}_{}", &suffix[..8]),
            name,
            protocol_version: PROTOCOL_VERSION.to_string(),
        }
    }
}
