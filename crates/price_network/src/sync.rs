//! Price sync: ingesting facts received from peers and answering sync
//! requests from the local store.

use price_core::db::SOURCE_P2P_NETWORK;
use tracing::debug;

use crate::error::NetworkError;
use crate::message::{PriceFact, SyncBundle, SyncQuery};
use crate::store::{LocalRef, PriceStore};

/// What ingesting one fact changed locally.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestOutcome {
    pub item_created: bool,
    pub place_created: bool,
    /// Id of the new price record.
    pub record: LocalRef,
}

/// Map a received fact onto local items and places and record its price.
///
/// Items are matched by `(name, brand)` and places by `(name, chain)`;
/// unknown ones are created. The record is tagged as coming from the
/// network.
pub fn ingest_fact(store: &dyn PriceStore, fact: &PriceFact) -> Result<IngestOutcome, NetworkError> {
    if fact.item_name.trim().is_empty() {
        return Err(NetworkError::Store("price fact has no item name".into()));
    }
    if fact.store_name.trim().is_empty() {
        return Err(NetworkError::Store("price fact has no store name".into()));
    }

    let item = store.upsert_item(&fact.item_details())?;
    let place = store.upsert_place(&fact.place_details())?;
    let record = store.record_price(
        &item.local,
        &place.local,
        &fact.observation(),
        SOURCE_P2P_NETWORK,
    )?;

    debug!(
        "Ingested {} @ {} = {:.2} (new item: {}, new place: {})",
        fact.item_name, fact.store_name, fact.price, item.created, place.created
    );

    Ok(IngestOutcome {
        item_created: item.created,
        place_created: place.created,
        record,
    })
}

fn matches_any(value: Option<&str>, wanted: &Option<Vec<String>>) -> bool {
    match wanted {
        Some(list) if !list.is_empty() => {
            value.is_some_and(|v| list.iter().any(|w| w.eq_ignore_ascii_case(v)))
        }
        _ => true,
    }
}

/// Build the answer to a sync request.
///
/// Only the `limit` most recent records are considered; `since`, the region
/// and the category/chain filters then narrow that window.
pub fn build_bundle(
    store: &dyn PriceStore,
    query: &SyncQuery,
    limit: usize,
) -> Result<SyncBundle, NetworkError> {
    let facts = store
        .recent_records(limit)?
        .into_iter()
        .filter(|r| r.recorded_at >= query.since)
        .filter(|r| match &query.region {
            Some(region) => r
                .fact
                .store_state
                .as_deref()
                .is_some_and(|s| s.eq_ignore_ascii_case(region)),
            None => true,
        })
        .filter(|r| matches_any(r.fact.item_category.as_deref(), &query.categories))
        .filter(|r| matches_any(r.fact.store_chain.as_deref(), &query.chains))
        .map(|r| r.fact)
        .collect();

    Ok(SyncBundle::new(facts))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
