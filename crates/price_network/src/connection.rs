//! Connection manager: accept loop, outbound dials and per-peer read loops.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::dispatcher;
use crate::events::NodeEvent;
use crate::identity::PeerId;
use crate::message::{HeartbeatPayload, Message};
use crate::node::NodeContext;
use crate::peer::{PeerInfo, PeerRole, PeerState};
use crate::transport::{self, FrameReader};

/// Accept inbound sockets until `token` is cancelled.
pub(crate) async fn accept_loop(
    ctx: Arc<NodeContext>,
    listener: TcpListener,
    token: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = token.cancelled() => {
                debug!("Accept loop shutting down");
                break;
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    debug!("Inbound connection from {addr}");
                    let info = PeerInfo::connected(
                        PeerId::generate_inbound(),
                        addr.ip().to_string(),
                        addr.port(),
                        PeerRole::Inbound,
                    );
                    register_and_spawn(&ctx, stream, info).await;
                }
                Err(e) => {
                    warn!("Accept failed: {e}");
                    ctx.report_error("accept", &e);
                }
            }
        }
    }
}

/// Dial `host:port` and register it as an outbound peer.
///
/// Returns `true` if a connection to that key exists afterwards, whether
/// this call created it or not.
pub(crate) async fn dial_and_register(
    ctx: &Arc<NodeContext>,
    host: &str,
    port: u16,
    region: Option<String>,
) -> bool {
    let peer_id = PeerId::for_dial(host, port);
    if ctx.registry.read().await.contains(&peer_id) {
        debug!("Already connected to {peer_id}");
        return true;
    }

    match transport::dial(host, port).await {
        Ok(stream) => {
            let info =
                PeerInfo::connected(peer_id, host, port, PeerRole::Outbound).with_region(region);
            register_and_spawn(ctx, stream, info).await;
            true
        }
        Err(e) => {
            warn!("Failed to connect to {host}:{port}: {e}");
            ctx.report_error(format!("connect {host}:{port}"), &e);
            false
        }
    }
}

/// Put a connected socket in the registry and start its read loop.
///
/// Returns `false` if the id is already registered; the new socket is then
/// closed and the existing connection kept.
async fn register_and_spawn(ctx: &Arc<NodeContext>, stream: TcpStream, info: PeerInfo) -> bool {
    let token = ctx.peer_token();
    let (conn, reader) = transport::split_stream(
        stream,
        ctx.config.max_frame_len,
        ctx.config.write_timeout,
        token.clone(),
    );
    let peer_id = info.id.clone();
    let conn_id = conn.conn_id();

    let inserted = ctx.registry.write().await.insert(info.clone(), conn.clone());
    if !inserted {
        debug!("Peer {peer_id} registered concurrently, dropping duplicate socket");
        conn.close().await;
        return false;
    }

    info!(
        "Peer {peer_id} connected ({:?}, {}:{})",
        info.role, info.host, info.port
    );
    ctx.emit(NodeEvent::PeerConnected(info));
    ctx.tasks
        .spawn(read_loop(Arc::clone(ctx), peer_id, conn_id, reader, token));
    true
}

/// Read frames from one peer until EOF, a read error or cancellation, then
/// deregister it.
async fn read_loop(
    ctx: Arc<NodeContext>,
    peer_id: PeerId,
    conn_id: u64,
    mut reader: FrameReader,
    token: CancellationToken,
) {
    loop {
        let next = tokio::select! {
            _ = token.cancelled() => {
                debug!("Read loop for {peer_id} cancelled");
                break;
            }
            next = reader.next() => next,
        };

        match next {
            Some(Ok(frame)) => dispatcher::dispatch_frame(&ctx, &peer_id, &frame).await,
            Some(Err(e)) => {
                warn!("Read error from {peer_id}: {e}");
                ctx.report_error(format!("read from {peer_id}"), &e);
                break;
            }
            None => {
                debug!("Peer {peer_id} closed the connection");
                break;
            }
        }
    }

    finish_peer(&ctx, &peer_id, conn_id).await;
}

/// Remove a peer whose socket has ended. Emits `PeerDisconnected` only if
/// this call removed it.
async fn finish_peer(ctx: &NodeContext, peer_id: &PeerId, conn_id: u64) {
    let removed = ctx
        .registry
        .write()
        .await
        .remove_connection(peer_id, conn_id);
    if let Some(entry) = removed {
        entry.connection.close().await;
        let mut info = entry.info;
        info.state = PeerState::Disconnected;
        info!("Peer {peer_id} disconnected");
        ctx.emit(NodeEvent::PeerDisconnected(info));
    }
}

/// Broadcast a heartbeat every `period` until `token` is cancelled.
pub(crate) async fn heartbeat_loop(ctx: Arc<NodeContext>, period: Duration, token: CancellationToken) {
    loop {
        tokio::select! {
            _ = tokio::time::sleep(period) => {
                if let Err(e) = ctx.broadcast(Message::Heartbeat(HeartbeatPayload::now())).await {
                    debug!("Heartbeat failed: {e}");
                }
            }
            _ = token.cancelled() => {
                debug!("Heartbeat loop shutting down");
                break;
            }
        }
    }
}
