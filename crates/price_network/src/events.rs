//! Notifications published by a node to its subscribers.

use std::net::SocketAddr;

use crate::identity::PeerId;
use crate::message::PriceFact;
use crate::peer::PeerInfo;

/// Something observable happened on the node.
///
/// Delivered on a `tokio::sync::broadcast` channel; slow subscribers may
/// miss events (`RecvError::Lagged`).
#[derive(Debug, Clone)]
pub enum NodeEvent {
    /// The listening socket is bound.
    ServerStarted { addr: SocketAddr },
    ServerStopped,
    PeerConnected(PeerInfo),
    /// Carries the final snapshot, with state `Disconnected`.
    PeerDisconnected(PeerInfo),
    /// A fact from a peer was stored locally.
    PriceReceived { from: PeerId, fact: PriceFact },
    /// A sync response was processed.
    SyncCompleted {
        from: PeerId,
        received: usize,
        ingested: usize,
    },
    /// A non-fatal failure scoped to one operation or connection.
    Error { context: String, message: String },
}

impl NodeEvent {
    pub fn error(context: impl Into<String>, message: impl std::fmt::Display) -> Self {
        Self::Error {
            context: context.into(),
            message: message.to_string(),
        }
    }
}
