//! Price Network: peer-to-peer sharing of grocery prices.
//!
//! Nodes exchange observed prices over plain TCP so that every node can
//! keep a local copy of what others have seen, without a central server.
//!
//! # Architecture
//!
//! - **Transport**: TCP sockets carrying newline-delimited JSON frames.
//! - **Protocol**: typed envelopes (`PriceShare`, `SyncRequest`,
//!   `SyncResponse`, `Heartbeat`) whose payload is decoded by type.
//! - **Sync**: received prices are mapped onto local items and stores by
//!   natural key; sync requests are answered from recent local records.
//! - **Discovery**: a JSON server directory with HTTP health probes.
//!
//! # Quick start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use price_network::{NetworkConfig, NodeIdentity, PriceNode, ServerDirectory, SqliteStore};
//!
//! # async fn example() -> Result<(), price_network::NetworkError> {
//! let store = Arc::new(SqliteStore::open_in_memory()?);
//! let directory = ServerDirectory::load("servers.json");
//! let node = PriceNode::new(
//!     NodeIdentity::generate("my-node"),
//!     NetworkConfig::default(),
//!     store,
//!     directory,
//! );
//!
//! node.start_server(8081).await;
//! node.connect("192.168.1.20", 8081).await;
//! node.request_sync(Some("NSW")).await?;
//! node.stop_server().await;
//! # Ok(())
//! # }
//! ```

pub mod broadcast;
pub mod codec;
pub mod config;
mod connection;
pub mod directory;
pub mod discovery;
mod dispatcher;
pub mod error;
pub mod events;
pub mod identity;
pub mod message;
pub mod node;
pub mod peer;
pub mod store;
pub mod sync;
pub mod transport;

// ── Re-exports for convenience ──────────────────────────────────────────

pub use broadcast::BroadcastReport;
pub use config::NetworkConfig;
pub use directory::{ServerDirectory, ServerEntry};
pub use error::NetworkError;
pub use events::NodeEvent;
pub use identity::{NodeIdentity, PeerId};
pub use message::{Envelope, HeartbeatPayload, Message, MessageType, PriceFact, SyncBundle, SyncQuery};
pub use node::PriceNode;
pub use peer::{PeerInfo, PeerRegistry, PeerRole, PeerState};
pub use store::{LocalRef, PriceStore, SqliteStore};
pub use sync::IngestOutcome;
