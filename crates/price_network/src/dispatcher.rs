//! Dispatcher: acts on each received frame in arrival order.

use std::sync::Arc;

use tracing::{debug, info, trace, warn};

use crate::codec;
use crate::error::NetworkError;
use crate::events::NodeEvent;
use crate::identity::PeerId;
use crate::message::{Envelope, Message, PriceFact};
use crate::node::NodeContext;
use crate::store::PriceStore;
use crate::sync;

/// Decode one raw frame from `from` and act on it.
///
/// A frame that fails to decode is logged and dropped; the connection
/// stays up.
pub(crate) async fn dispatch_frame(ctx: &NodeContext, from: &PeerId, frame: &[u8]) {
    if frame.trim_ascii().is_empty() {
        return;
    }
    match codec::decode(frame) {
        Ok(envelope) => {
            trace!("{} from {from}", envelope.message_type());
            dispatch(ctx, from, envelope).await;
        }
        Err(NetworkError::UnknownType(kind)) => {
            ctx.registry.write().await.update_last_seen(from);
            debug!("Ignoring message of unknown type {kind} from {from}");
        }
        Err(e) => warn!("Dropping undecodable message from {from}: {e}"),
    }
}

/// Handle one envelope received from `from`.
///
/// Every message refreshes the sender's `last_seen` before anything else.
pub(crate) async fn dispatch(ctx: &NodeContext, from: &PeerId, envelope: Envelope) {
    ctx.registry.write().await.update_last_seen(from);

    match envelope.message {
        Message::PriceShare(fact) => {
            ingest_all(ctx, from, vec![fact]).await;
        }
        Message::SyncRequest(query) => {
            let limit = ctx.config.sync_recent_limit;
            let wanted = query.clone();
            let built = on_store(ctx, move |store| sync::build_bundle(store, &wanted, limit))
                .await
                .and_then(|built| built);
            let bundle = match built {
                Ok(bundle) => bundle,
                Err(e) => {
                    warn!("Cannot answer sync request from {from}: {e}");
                    ctx.report_error(format!("sync request from {from}"), &e);
                    return;
                }
            };
            debug!(
                "Answering sync request from {from} with {} prices (since {}, region {:?})",
                bundle.count, query.since, query.region
            );
            if let Err(e) = ctx.send_to(from, Message::SyncResponse(bundle)).await {
                warn!("Failed to send sync response to {from}: {e}");
                ctx.report_error(format!("sync response to {from}"), &e);
            }
        }
        Message::SyncResponse(bundle) => {
            let received = bundle.facts.len();
            let ingested = ingest_all(ctx, from, bundle.facts).await;
            info!("Sync from {from}: {ingested}/{received} prices stored");
            ctx.emit(NodeEvent::SyncCompleted {
                from: from.clone(),
                received,
                ingested,
            });
        }
        Message::Heartbeat(beat) => {
            trace!("Heartbeat from {from} at {}", beat.timestamp);
        }
        Message::Reserved { kind, .. } => {
            debug!("Ignoring {kind} message from {from}");
        }
    }
}

/// Run synchronous store work on the blocking pool.
async fn on_store<T: Send + 'static>(
    ctx: &NodeContext,
    work: impl FnOnce(&dyn PriceStore) -> T + Send + 'static,
) -> Result<T, NetworkError> {
    let store = Arc::clone(&ctx.store);
    tokio::task::spawn_blocking(move || work(store.as_ref()))
        .await
        .map_err(|e| NetworkError::Store(format!("store task failed: {e}")))
}

/// Store facts, then announce each stored one. Returns how many were stored.
async fn ingest_all(ctx: &NodeContext, from: &PeerId, facts: Vec<PriceFact>) -> usize {
    let outcomes = on_store(ctx, move |store| {
        facts
            .into_iter()
            .map(|fact| {
                let outcome = sync::ingest_fact(store, &fact);
                (fact, outcome)
            })
            .collect::<Vec<_>>()
    })
    .await;
    let outcomes = match outcomes {
        Ok(outcomes) => outcomes,
        Err(e) => {
            warn!("Failed to store prices from {from}: {e}");
            ctx.report_error(format!("price from {from}"), &e);
            return 0;
        }
    };

    let mut stored = 0;
    for (fact, outcome) in outcomes {
        match outcome {
            Ok(_) => {
                stored += 1;
                ctx.emit(NodeEvent::PriceReceived {
                    from: from.clone(),
                    fact,
                });
            }
            Err(e) => {
                warn!(
                    "Failed to store price {} @ {} from {from}: {e}",
                    fact.item_name, fact.store_name
                );
                ctx.report_error(format!("price from {from}"), &e);
            }
        }
    }
    stored
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
