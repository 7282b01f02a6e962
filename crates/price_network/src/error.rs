//! Network error types.

use std::time::Duration;

/// Errors that can occur in the price_network crate.
#[derive(Debug, thiserror::Error)]
pub enum NetworkError {
    /// A transport-level error (bind, accept, connect, read, write).
    #[error("Transport error: {0}")]
    Transport(String),

    /// A received frame could not be turned into an envelope.
    #[error("Decode error: {0}")]
    Decode(String),

    /// JSON serialization / deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The local data store rejected a lookup or write.
    #[error("Store error: {0}")]
    Store(String),

    /// The server directory could not be read or written.
    #[error("Directory error: {0}")]
    Directory(String),

    /// The requested peer is not in the registry.
    #[error("Peer not found: {0}")]
    PeerNotFound(String),

    /// The message type is not one this node knows.
    #[error("Unknown message type: {0}")]
    UnknownType(String),

    /// A send to a peer did not finish in time.
    #[error("Timeout after {0:?}")]
    Timeout(Duration),
}

impl NetworkError {
    /// Wraps a store-side failure, keeping its full cause chain in the message.
    pub fn store(err: impl std::fmt::Display) -> Self {
        Self::Store(format!("{err:#}"))
    }
}
