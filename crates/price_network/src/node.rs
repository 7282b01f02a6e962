//! PriceNode: top-level coordinator for the price-sharing network.
//!
//! [`PriceNode`] is the primary public API for price_network. It manages:
//! - the TCP server (accepting peers) and outbound connections
//! - the peer registry and per-peer read loops
//! - price sharing, sync requests and heartbeats
//! - discovery of, and health probes against, the server directory

use std::net::SocketAddr;
use std::sync::Arc;

use chrono::Utc;
use futures::future::join_all;
use price_core::PriceObservation;
use tokio::sync::{Mutex, RwLock, broadcast};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::broadcast::{BroadcastReport, fan_out};
use crate::codec;
use crate::config::NetworkConfig;
use crate::connection;
use crate::directory::{ServerDirectory, ServerEntry};
use crate::discovery;
use crate::error::NetworkError;
use crate::events::NodeEvent;
use crate::identity::{NodeIdentity, PeerId};
use crate::message::{HeartbeatPayload, Message, PriceFact, SyncQuery};
use crate::peer::{PeerInfo, PeerRegistry, PeerState};
use crate::store::{LocalRef, PriceStore};

/// Capacity of the event channel.
const EVENT_CHANNEL_CAPACITY: usize = 256;

// ---------------------------------------------------------------------------
// Shared state
// ---------------------------------------------------------------------------

/// State shared by the node and its background tasks.
pub(crate) struct NodeContext {
    pub identity: NodeIdentity,
    pub config: NetworkConfig,
    pub registry: Arc<RwLock<PeerRegistry>>,
    pub store: Arc<dyn PriceStore>,
    pub directory: Arc<parking_lot::RwLock<ServerDirectory>>,
    pub events: broadcast::Sender<NodeEvent>,
    /// Read loops, the accept loop and the heartbeat loop.
    pub tasks: TaskTracker,
    /// Node-wide root; cancelled when the node is dropped.
    pub shutdown: CancellationToken,
    /// Parent of every peer's token. Replaced after each `stop_server`.
    peers_token: parking_lot::Mutex<CancellationToken>,
}

impl NodeContext {
    pub(crate) fn new(
        identity: NodeIdentity,
        config: NetworkConfig,
        store: Arc<dyn PriceStore>,
        directory: Arc<parking_lot::RwLock<ServerDirectory>>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let shutdown = CancellationToken::new();
        Self {
            identity,
            config,
            registry: Arc::new(RwLock::new(PeerRegistry::new())),
            store,
            directory,
            events,
            tasks: TaskTracker::new(),
            peers_token: parking_lot::Mutex::new(shutdown.child_token()),
            shutdown,
        }
    }

    /// Publish an event. Having no subscribers is fine.
    pub(crate) fn emit(&self, event: NodeEvent) {
        let _ = self.events.send(event);
    }

    pub(crate) fn report_error(&self, context: impl Into<String>, err: &dyn std::fmt::Display) {
        self.emit(NodeEvent::error(context, err));
    }

    /// Token for a new peer connection.
    pub(crate) fn peer_token(&self) -> CancellationToken {
        self.peers_token.lock().child_token()
    }

    fn encode(&self, message: Message) -> Result<String, NetworkError> {
        codec::encode_message(&self.identity.node_id, message)
    }

    /// Send one message to one peer.
    pub(crate) async fn send_to(&self, peer_id: &PeerId, message: Message) -> Result<(), NetworkError> {
        let conn = self
            .registry
            .read()
            .await
            .connection(peer_id)
            .ok_or_else(|| NetworkError::PeerNotFound(peer_id.to_string()))?;
        let frame = self.encode(message)?;
        conn.send_frame(&frame).await
    }

    /// Send one message to every connected peer.
    pub(crate) async fn broadcast(&self, message: Message) -> Result<BroadcastReport, NetworkError> {
        let kind = message.message_type();
        let frame = self.encode(message)?;
        let targets = self.registry.read().await.connected_handles();
        debug!("Broadcasting {kind} to {} peers", targets.len());

        let (report, errors) = fan_out(targets, &frame).await;
        for (peer_id, e) in errors {
            self.report_error(format!("broadcast {kind} to {peer_id}"), &e);
        }
        Ok(report)
    }
}

// ---------------------------------------------------------------------------
// PriceNode
// ---------------------------------------------------------------------------

struct ServerHandle {
    token: CancellationToken,
    local_addr: SocketAddr,
}

/// A node in the price-sharing network.
///
/// Create one per application instance and call
/// [`start_server()`](PriceNode::start_server) to accept peers. Outbound
/// connections work whether or not the server runs.
pub struct PriceNode {
    ctx: Arc<NodeContext>,
    server: Mutex<Option<ServerHandle>>,
}

impl PriceNode {
    /// Create a node over the given store and server directory.
    pub fn new(
        identity: NodeIdentity,
        config: NetworkConfig,
        store: Arc<dyn PriceStore>,
        directory: ServerDirectory,
    ) -> Self {
        Self {
            ctx: Arc::new(NodeContext::new(
                identity,
                config,
                store,
                Arc::new(parking_lot::RwLock::new(directory)),
            )),
            server: Mutex::new(None),
        }
    }

    /// Return the node id used as `senderId`.
    pub fn node_id(&self) -> &str {
        &self.ctx.identity.node_id
    }

    /// Return the node's full identity.
    pub fn identity(&self) -> &NodeIdentity {
        &self.ctx.identity
    }

    /// Return the node's configuration.
    pub fn config(&self) -> &NetworkConfig {
        &self.ctx.config
    }

    /// Subscribe to node events.
    pub fn subscribe(&self) -> broadcast::Receiver<NodeEvent> {
        self.ctx.events.subscribe()
    }

    /// The server directory.
    pub fn directory(&self) -> Arc<parking_lot::RwLock<ServerDirectory>> {
        Arc::clone(&self.ctx.directory)
    }

    /// The local price store.
    pub fn store(&self) -> Arc<dyn PriceStore> {
        Arc::clone(&self.ctx.store)
    }

    pub async fn is_server_running(&self) -> bool {
        self.server.lock().await.is_some()
    }

    /// Address the server is bound to, if running.
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        self.server.lock().await.as_ref().map(|s| s.local_addr)
    }

    // -----------------------------------------------------------------------
    // Server lifecycle
    // -----------------------------------------------------------------------

    /// Start accepting peers on `port` (0 picks a free port).
    ///
    /// Returns `true` if the server is running afterwards. A bind failure is
    /// reported as an [`NodeEvent::Error`] and returns `false`.
    pub async fn start_server(&self, port: u16) -> bool {
        let mut server = self.server.lock().await;
        if server.is_some() {
            debug!("Server already running");
            return true;
        }

        let host = &self.ctx.config.bind_host;
        let listener = match crate::transport::bind(host, port).await {
            Ok(listener) => listener,
            Err(e) => {
                error!("Failed to start server on {host}:{port}: {e}");
                self.ctx.report_error("start_server", &e);
                return false;
            }
        };
        let local_addr = match listener.local_addr() {
            Ok(addr) => addr,
            Err(e) => {
                error!("Bound listener has no local address: {e}");
                self.ctx.report_error("start_server", &e);
                return false;
            }
        };

        let token = self.ctx.shutdown.child_token();
        self.ctx.tasks.spawn(connection::accept_loop(
            Arc::clone(&self.ctx),
            listener,
            token.clone(),
        ));
        if let Some(period) = self.ctx.config.heartbeat_interval {
            self.ctx.tasks.spawn(connection::heartbeat_loop(
                Arc::clone(&self.ctx),
                period,
                token.clone(),
            ));
        }

        *server = Some(ServerHandle { token, local_addr });
        info!(
            "PriceNode '{}' listening on {local_addr} (node id {})",
            self.ctx.identity.name, self.ctx.identity.node_id
        );
        self.ctx.emit(NodeEvent::ServerStarted { addr: local_addr });
        true
    }

    /// Start the server on the configured port.
    pub async fn start(&self) -> bool {
        self.start_server(self.ctx.config.listen_port).await
    }

    /// Stop the server and close every peer connection, inbound and
    /// outbound. Returns once all read loops have finished.
    pub async fn stop_server(&self) {
        let mut server = self.server.lock().await;
        let was_running = match server.take() {
            Some(handle) => {
                handle.token.cancel();
                true
            }
            None => false,
        };

        self.ctx.peers_token.lock().cancel();
        self.ctx.tasks.close();
        self.ctx.tasks.wait().await;
        self.ctx.tasks.reopen();

        let leftovers = self.ctx.registry.write().await.drain();
        for entry in leftovers {
            entry.connection.close().await;
            let mut info = entry.info;
            info.state = PeerState::Disconnected;
            self.ctx.emit(NodeEvent::PeerDisconnected(info));
        }
        *self.ctx.peers_token.lock() = self.ctx.shutdown.child_token();

        if was_running {
            info!("PriceNode '{}' stopped", self.ctx.identity.name);
            self.ctx.emit(NodeEvent::ServerStopped);
        }
    }

    // -----------------------------------------------------------------------
    // Connections
    // -----------------------------------------------------------------------

    /// Connect to a node. Connecting to an already connected `host:port` is
    /// a no-op that returns `true`.
    pub async fn connect(&self, host: &str, port: u16) -> bool {
        connection::dial_and_register(&self.ctx, host, port, None).await
    }

    /// Connect to a directory entry by name (case-insensitive).
    pub async fn connect_to_server(&self, name: &str) -> bool {
        let entry = self.ctx.directory.read().get_by_name(name).cloned();
        match entry {
            Some(entry) => {
                connection::dial_and_register(&self.ctx, &entry.host, entry.port, entry.region)
                    .await
            }
            None => {
                let e = NetworkError::Directory(format!("unknown server '{name}'"));
                warn!("{e}");
                self.ctx.report_error("connect_to_server", &e);
                false
            }
        }
    }

    /// Close the connection to `host:port`, if any.
    pub async fn disconnect(&self, host: &str, port: u16) {
        let removed = {
            let mut registry = self.ctx.registry.write().await;
            registry
                .find_by_endpoint(host, port)
                .and_then(|id| registry.remove_peer(&id))
        };
        let Some(entry) = removed else {
            debug!("disconnect: no peer at {host}:{port}");
            return;
        };

        entry.connection.close().await;
        let mut info = entry.info;
        info.state = PeerState::Disconnected;
        info!("Disconnected from {}", info.id);
        self.ctx.emit(NodeEvent::PeerDisconnected(info));
    }

    /// Get a snapshot of all peers.
    pub async fn peers(&self) -> Vec<PeerInfo> {
        let registry = self.ctx.registry.read().await;
        registry.list_all().into_iter().cloned().collect()
    }

    /// Get a snapshot of connected peers.
    pub async fn connected_peers(&self) -> Vec<PeerInfo> {
        let registry = self.ctx.registry.read().await;
        registry.list_connected().into_iter().cloned().collect()
    }

    pub async fn peer_count(&self) -> usize {
        self.ctx.registry.read().await.connected_count()
    }

    // -----------------------------------------------------------------------
    // Messaging
    // -----------------------------------------------------------------------

    /// Send a message to every connected peer.
    pub async fn broadcast(&self, message: Message) -> Result<BroadcastReport, NetworkError> {
        self.ctx.broadcast(message).await
    }

    /// Send a message to one peer.
    pub async fn send_to(&self, peer_id: &PeerId, message: Message) -> Result<(), NetworkError> {
        self.ctx.send_to(peer_id, message).await
    }

    /// Share one price with every connected peer.
    pub async fn share_price(&self, fact: PriceFact) -> Result<BroadcastReport, NetworkError> {
        info!(
            "Sharing {} @ {} = {:.2}",
            fact.item_name, fact.store_name, fact.price
        );
        self.broadcast(Message::PriceShare(fact)).await
    }

    /// Share a price for a locally stored item and place.
    pub async fn share_recorded_price(
        &self,
        item: &LocalRef,
        place: &LocalRef,
        observation: &PriceObservation,
    ) -> Result<BroadcastReport, NetworkError> {
        let (item_details, place_details) = self
            .ctx
            .store
            .fact_for(item, place)?
            .ok_or_else(|| NetworkError::Store(format!("unknown item {item} or place {place}")))?;
        self.share_price(PriceFact::from_parts(&item_details, &place_details, observation))
            .await
    }

    /// Ask every connected peer for prices recorded within the sync window.
    pub async fn request_sync(&self, region: Option<&str>) -> Result<BroadcastReport, NetworkError> {
        let query = SyncQuery::recent(self.ctx.config.sync_window, region.map(str::to_string));
        info!("Requesting sync since {} (region {:?})", query.since, query.region);
        self.broadcast(Message::SyncRequest(query)).await
    }

    /// Ask a single peer for prices matching `query`.
    pub async fn request_sync_from(
        &self,
        peer_id: &PeerId,
        query: SyncQuery,
    ) -> Result<(), NetworkError> {
        debug!("Requesting sync from {peer_id}");
        self.send_to(peer_id, Message::SyncRequest(query)).await
    }

    /// Broadcast a heartbeat now.
    pub async fn send_heartbeat(&self) -> Result<BroadcastReport, NetworkError> {
        self.broadcast(Message::Heartbeat(HeartbeatPayload::now()))
            .await
    }

    // -----------------------------------------------------------------------
    // Discovery & health
    // -----------------------------------------------------------------------

    /// Dial every active directory entry, optionally only those in `region`.
    /// Returns how many connections succeeded.
    pub async fn discover_and_connect(&self, region: Option<&str>) -> usize {
        let targets = {
            let directory = self.ctx.directory.read();
            match region {
                Some(region) => directory.by_region(region),
                None => directory.active(),
            }
        };
        info!(
            "Discovering peers: {} active servers (region {region:?})",
            targets.len()
        );

        let dials = targets.into_iter().map(|entry| async move {
            connection::dial_and_register(&self.ctx, &entry.host, entry.port, entry.region).await
        });
        let connected = join_all(dials).await.into_iter().filter(|ok| *ok).count();
        info!("Discovery connected to {connected} servers");
        connected
    }

    /// Probe an entry's health endpoint and record the result in the
    /// directory.
    pub async fn test_server_connection(&self, entry: &ServerEntry) -> bool {
        let active = discovery::probe_health(entry, self.ctx.config.health_timeout).await;
        let updated = self
            .ctx
            .directory
            .write()
            .update_status(&entry.name, active, Some(Utc::now()));
        if let Err(e) = updated {
            warn!("Failed to record status of {}: {e}", entry.name);
            self.ctx.report_error("directory", &e);
        }
        info!(
            "Server {} is {}",
            entry.name,
            if active { "active" } else { "inactive" }
        );
        active
    }

    /// Probe every directory entry concurrently. Returns `(name, active)`
    /// per entry.
    pub async fn test_all_servers(&self) -> Vec<(String, bool)> {
        let entries = self.ctx.directory.read().all().to_vec();
        let probes = entries.iter().map(|entry| async move {
            (entry.name.clone(), self.test_server_connection(entry).await)
        });
        join_all(probes).await
    }
}

impl Drop for PriceNode {
    fn drop(&mut self) {
        self.ctx.shutdown.cancel();
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
