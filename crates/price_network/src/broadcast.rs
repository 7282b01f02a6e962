//! Broadcast engine: concurrent fan-out of one frame to many peers.

use futures::future::join_all;
use tracing::{debug, warn};

use crate::error::NetworkError;
use crate::identity::PeerId;
use crate::transport::PeerConnection;

/// Per-peer result of a broadcast.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    /// Peers in the snapshot the broadcast was sent to.
    pub attempted: usize,
    pub delivered: usize,
    pub failed: Vec<PeerId>,
}

impl BroadcastReport {
    pub fn all_delivered(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Send `frame` to every target concurrently.
///
/// Returns the report plus the error of each failed send, so the caller
/// can surface them.
pub async fn fan_out(
    targets: Vec<(PeerId, PeerConnection)>,
    frame: &str,
) -> (BroadcastReport, Vec<(PeerId, NetworkError)>) {
    let attempted = targets.len();
    let sends = targets.into_iter().map(|(peer_id, conn)| async move {
        let result = conn.send_frame(frame).await;
        (peer_id, result)
    });

    let mut report = BroadcastReport {
        attempted,
        ..Default::default()
    };
    let mut errors = Vec::new();
    for (peer_id, result) in join_all(sends).await {
        match result {
            Ok(()) => report.delivered += 1,
            Err(e) => {
                warn!("Broadcast to {peer_id} failed: {e}");
                report.failed.push(peer_id.clone());
                errors.push((peer_id, e));
            }
        }
    }

    debug!(
        "Broadcast delivered to {}/{} peers",
        report.delivered, report.attempted
    );
    (report, errors)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
