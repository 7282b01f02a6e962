//! Discovery and health: probing directory entries over HTTP.
//!
//! A server is considered up when `GET /health` answers with a 2xx status
//! within the timeout. Peer dialing for discovery lives on
//! [`PriceNode::discover_and_connect`](crate::PriceNode::discover_and_connect).

use std::time::Duration;

use tracing::debug;

use crate::directory::ServerEntry;

/// Health endpoint of a directory entry.
pub fn health_url(entry: &ServerEntry) -> String {
    let scheme = if entry.secure { "https" } else { "http" };
    format!("{scheme}://{}:{}/health", entry.host, entry.port)
}

/// Probe an entry's health endpoint. Any error or non-2xx status is `false`.
pub async fn probe_health(entry: &ServerEntry, timeout: Duration) -> bool {
    let url = health_url(entry);
    let client = match reqwest::Client::builder().timeout(timeout).build() {
        Ok(client) => client,
        Err(e) => {
            debug!("Cannot build HTTP client for {url}: {e}");
            return false;
        }
    };

    match client.get(&url).send().await {
        Ok(resp) => {
            let ok = resp.status().is_success();
            debug!("Health probe {url} -> {}", resp.status());
            ok
        }
        Err(e) => {
            if e.is_timeout() {
                debug!("Health probe {url} timed out after {timeout:?}");
            } else {
                debug!("Health probe {url} failed: {e}");
            }
            false
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
