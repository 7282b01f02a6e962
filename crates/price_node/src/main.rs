use std::sync::Arc;

use anyhow::{Context, Result};
use price_core::{AppPaths, Database, logging};
use price_network::{
    NetworkConfig, NodeEvent, NodeIdentity, PriceNode, ServerDirectory, SqliteStore,
};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, error, info, warn};

const VERSION: &str = env!("CARGO_PKG_VERSION");

// ---------------------------------------------------------------------------
// Setup
// ---------------------------------------------------------------------------

/// Open local state and build the node. Writes a default config on first run.
fn init_node(paths: &AppPaths) -> Result<PriceNode> {
    let config_path = paths.config_path();
    let config = NetworkConfig::load_or_default(&config_path);
    if !config_path.exists() {
        if let Err(e) = config.save_to_file(&config_path) {
            warn!("Could not write default config: {e}");
        }
    }
    info!(
        "Config loaded (port {}, region {:?})",
        config.listen_port, config.region
    );

    let db = Database::open_at(&paths.db_path())
        .inspect_err(|e| error!("Database open failed: {e:#}"))?;
    let stats = db.stats().context("Failed to read database stats")?;
    info!(
        "Database holds {} items, {} places, {} prices",
        stats.items, stats.places, stats.price_records
    );

    let directory = ServerDirectory::load(paths.servers_path());
    let identity = NodeIdentity::generate(config.node_name.clone());

    Ok(PriceNode::new(
        identity,
        config,
        Arc::new(SqliteStore::new(db)),
        directory,
    ))
}

fn log_event(event: &NodeEvent) {
    match event {
        NodeEvent::ServerStarted { addr } => info!("Server started on {addr}"),
        NodeEvent::ServerStopped => info!("Server stopped"),
        NodeEvent::PeerConnected(peer) => info!("Peer connected: {} ({:?})", peer.id, peer.role),
        NodeEvent::PeerDisconnected(peer) => info!("Peer disconnected: {}", peer.id),
        NodeEvent::PriceReceived { from, fact } => info!(
            "Price from {from}: {} @ {} = {:.2}",
            fact.item_name, fact.store_name, fact.price
        ),
        NodeEvent::SyncCompleted {
            from,
            received,
            ingested,
        } => info!("Sync with {from} done: {ingested}/{received} stored"),
        NodeEvent::Error { context, message } => warn!("{context}: {message}"),
    }
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    let paths = AppPaths::resolve()?;
    paths.ensure_dirs()?;
    let _log_guard = logging::init_logging(&paths.logs_dir(), logging::DEFAULT_FILTER)?;
    info!("Starting price-node v{VERSION} in {}", paths.root().display());

    let node = init_node(&paths)?;
    let mut events = node.subscribe();

    if !node.start().await {
        anyhow::bail!("Could not start server on port {}", node.config().listen_port);
    }

    let region = node.config().region.clone();
    let servers = node.test_all_servers().await;
    debug!("Health probes: {servers:?}");
    let connected = node.discover_and_connect(region.as_deref()).await;
    if connected > 0 {
        node.request_sync(region.as_deref()).await?;
    }

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(event) => log_event(&event),
                Err(RecvError::Lagged(n)) => warn!("Dropped {n} events"),
                Err(RecvError::Closed) => break,
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown requested");
                break;
            }
        }
    }

    node.stop_server().await;
    info!("price-node stopped");
    Ok(())
}
