//! The boundary between the network engine and local price storage.
//!
//! The engine only talks to a [`PriceStore`]; [`SqliteStore`] backs it with
//! the `price_core` database.

use std::fmt;
use std::path::Path;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use price_core::{Database, ItemDetails, PlaceDetails, PriceObservation};

use crate::error::NetworkError;
use crate::message::PriceFact;

/// Opaque local identifier of an item, place or price record.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LocalRef(pub String);

impl LocalRef {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for LocalRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<i64> for LocalRef {
    fn from(id: i64) -> Self {
        Self(id.to_string())
    }
}

/// Result of a find-or-insert by natural key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Upserted {
    pub local: LocalRef,
    /// `true` if this call created the row.
    pub created: bool,
}

/// A stored price rendered as a shareable fact.
#[derive(Debug, Clone)]
pub struct StoredPrice {
    pub fact: PriceFact,
    pub recorded_at: DateTime<Utc>,
}

/// Local persistence used by the sync protocol.
///
/// `upsert_item` and `upsert_place` must be atomic: concurrent calls with
/// the same natural key resolve to one row.
pub trait PriceStore: Send + Sync {
    /// Find or insert an item by `(name, brand)`.
    fn upsert_item(&self, item: &ItemDetails) -> Result<Upserted, NetworkError>;

    /// Find or insert a place by `(name, chain)`.
    fn upsert_place(&self, place: &PlaceDetails) -> Result<Upserted, NetworkError>;

    /// Record one observation and return the record's id.
    fn record_price(
        &self,
        item: &LocalRef,
        place: &LocalRef,
        observation: &PriceObservation,
        source: &str,
    ) -> Result<LocalRef, NetworkError>;

    /// The `limit` most recent records, newest first.
    fn recent_records(&self, limit: usize) -> Result<Vec<StoredPrice>, NetworkError>;

    /// Descriptive details for an item and a place, if both exist.
    fn fact_for(
        &self,
        item: &LocalRef,
        place: &LocalRef,
    ) -> Result<Option<(ItemDetails, PlaceDetails)>, NetworkError>;
}

// ---------------------------------------------------------------------------
// SQLite
// ---------------------------------------------------------------------------

/// [`PriceStore`] over a `price_core` SQLite database.
pub struct SqliteStore {
    db: Mutex<Database>,
}

impl SqliteStore {
    pub fn new(db: Database) -> Self {
        Self { db: Mutex::new(db) }
    }

    /// Open (or create) the database file at `path`.
    pub fn open_at(path: &Path) -> Result<Self, NetworkError> {
        Database::open_at(path)
            .map(Self::new)
            .map_err(NetworkError::store)
    }

    pub fn open_in_memory() -> Result<Self, NetworkError> {
        Database::open_in_memory()
            .map(Self::new)
            .map_err(NetworkError::store)
    }

    /// Run `f` with the database locked.
    pub fn with_db<T>(&self, f: impl FnOnce(&Database) -> T) -> T {
        f(&self.db.lock())
    }
}

fn parse_ref(local: &LocalRef) -> Result<i64, NetworkError> {
    local
        .as_str()
        .parse()
        .map_err(|_| NetworkError::Store(format!("not a local id: {local}")))
}

impl PriceStore for SqliteStore {
    fn upsert_item(&self, item: &ItemDetails) -> Result<Upserted, NetworkError> {
        let (id, created) = self.db.lock().upsert_item(item).map_err(NetworkError::store)?;
        Ok(Upserted {
            local: id.into(),
            created,
        })
    }

    fn upsert_place(&self, place: &PlaceDetails) -> Result<Upserted, NetworkError> {
        let (id, created) = self
            .db
            .lock()
            .upsert_place(place)
            .map_err(NetworkError::store)?;
        Ok(Upserted {
            local: id.into(),
            created,
        })
    }

    fn record_price(
        &self,
        item: &LocalRef,
        place: &LocalRef,
        observation: &PriceObservation,
        source: &str,
    ) -> Result<LocalRef, NetworkError> {
        let item_id = parse_ref(item)?;
        let place_id = parse_ref(place)?;
        let id = self
            .db
            .lock()
            .record_price(item_id, place_id, observation, source, Utc::now())
            .map_err(NetworkError::store)?;
        Ok(id.into())
    }

    fn recent_records(&self, limit: usize) -> Result<Vec<StoredPrice>, NetworkError> {
        let rows = self
            .db
            .lock()
            .recent_price_updates(limit)
            .map_err(NetworkError::store)?;
        Ok(rows
            .into_iter()
            .map(|row| StoredPrice {
                fact: PriceFact::from_parts(&row.item, &row.place, &row.observation),
                recorded_at: row.date_recorded,
            })
            .collect())
    }

    fn fact_for(
        &self,
        item: &LocalRef,
        place: &LocalRef,
    ) -> Result<Option<(ItemDetails, PlaceDetails)>, NetworkError> {
        let item_id = parse_ref(item)?;
        let place_id = parse_ref(place)?;
        let db = self.db.lock();
        let item = db.get_item(item_id).map_err(NetworkError::store)?;
        let place = db.get_place(place_id).map_err(NetworkError::store)?;
        Ok(item.zip(place).map(|(i, p)| (i.details, p.details)))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn bread() -> ItemDetails {
        ItemDetails {
            name: "Wholemeal Bread".into(),
            brand: Some("Tip Top".into()),
            category: Some("Bakery".into()),
            ..Default::default()
        }
    }

    fn woolies() -> PlaceDetails {
        PlaceDetails {
            name: "Woolworths Bondi".into(),
            chain: Some("Woolworths".into()),
            suburb: Some("Bondi".into()),
            state: Some("NSW".into()),
        }
    }

    #[test]
    fn test_upsert_reports_creation_once() {
        let store = SqliteStore::open_in_memory().unwrap();
        let first = store.upsert_item(&bread()).unwrap();
        let second = store.upsert_item(&bread()).unwrap();
        assert!(first.created);
        assert!(!second.created);
        assert_eq!(first.local, second.local);
    }

    #[test]
    fn test_record_and_read_back_as_fact() {
        let store = SqliteStore::open_in_memory().unwrap();
        let item = store.upsert_item(&bread()).unwrap().local;
        let place = store.upsert_place(&woolies()).unwrap().local;
        let obs = PriceObservation {
            price: 4.5,
            ..Default::default()
        };
        store.record_price(&item, &place, &obs, "manual").unwrap();

        let recent = store.recent_records(10).unwrap();
        assert_eq!(recent.len(), 1);
        let fact = &recent[0].fact;
        assert_eq!(fact.item_name, "Wholemeal Bread");
        assert_eq!(fact.store_state.as_deref(), Some("NSW"));
        assert!((fact.price - 4.5).abs() < f64::EPSILON);
    }

    #[test]
    fn test_fact_for_unknown_ref_is_none() {
        let store = SqliteStore::open_in_memory().unwrap();
        let item = store.upsert_item(&bread()).unwrap().local;
        let place = store.upsert_place(&woolies()).unwrap().local;

        assert!(store.fact_for(&item, &place).unwrap().is_some());
        assert!(store.fact_for(&item, &LocalRef::from(999)).unwrap().is_none());
    }

    #[test]
    fn test_malformed_ref_is_store_error() {
        let store = SqliteStore::open_in_memory().unwrap();
        let err = store
            .fact_for(&LocalRef("abc".into()), &LocalRef::from(1))
            .unwrap_err();
        assert!(matches!(err, NetworkError::Store(_)));
    }
}
