use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{Connection, OptionalExtension, Row, params};
use std::path::Path;
use tracing::info;

/// Source tag for prices typed in by hand.
pub const SOURCE_MANUAL: &str = "manual";
/// Source tag for prices loaded from a catalogue import.
pub const SOURCE_CATALOGUE_IMPORT: &str = "catalogue-import";
/// Source tag for prices received from another node.
pub const SOURCE_P2P_NETWORK: &str = "p2p-network";

// ---------------------------------------------------------------------------
// Row types
// ---------------------------------------------------------------------------

/// Descriptive attributes of a grocery item. `(name, brand)` is the natural key.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ItemDetails {
    pub name: String,
    pub brand: Option<String>,
    pub category: Option<String>,
    pub barcode: Option<String>,
    pub package_size: Option<String>,
}

/// Descriptive attributes of a store. `(name, chain)` is the natural key.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PlaceDetails {
    pub name: String,
    pub chain: Option<String>,
    pub suburb: Option<String>,
    pub state: Option<String>,
}

/// One observed price, independent of which item or store it belongs to.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PriceObservation {
    pub price: f64,
    pub is_on_sale: bool,
    pub original_price: Option<f64>,
    pub sale_description: Option<String>,
    pub valid_from: Option<DateTime<Utc>>,
    pub valid_to: Option<DateTime<Utc>>,
}

/// A stored item row.
#[derive(Debug, Clone)]
pub struct ItemRow {
    pub id: i64,
    pub details: ItemDetails,
}

/// A stored place row.
#[derive(Debug, Clone)]
pub struct PlaceRow {
    pub id: i64,
    pub details: PlaceDetails,
}

/// A price record joined with its item and place.
#[derive(Debug, Clone)]
pub struct PriceRecordView {
    pub id: i64,
    pub item_id: i64,
    pub place_id: i64,
    pub item: ItemDetails,
    pub place: PlaceDetails,
    pub observation: PriceObservation,
    pub source: String,
    pub date_recorded: DateTime<Utc>,
}

/// Row counts per table.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub items: u64,
    pub places: u64,
    pub price_records: u64,
}

// ---------------------------------------------------------------------------
// Time helpers
// ---------------------------------------------------------------------------

/// Fixed-width RFC 3339 so that text ordering matches time ordering.
fn to_db_time(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn from_db_time(text: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(text)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
        })
}

fn opt_db_time(text: Option<String>) -> rusqlite::Result<Option<DateTime<Utc>>> {
    text.as_deref().map(from_db_time).transpose()
}

/// Empty key columns read back as `None`.
fn non_empty(value: String) -> Option<String> {
    if value.is_empty() { None } else { Some(value) }
}

// ---------------------------------------------------------------------------
// Database
// ---------------------------------------------------------------------------

/// SQLite store for items, places and price records.
pub struct Database {
    conn: Connection,
}

impl Database {
    /// Opens (or creates) the database at the given path.
    pub fn open_at(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database: {}", path.display()))?;

        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;

        let db = Self { conn };
        db.init_schema()?;
        info!("Price database opened at {}", path.display());
        Ok(db)
    }

    /// Opens an in-memory database (for tests).
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory database")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;

        let db = Self { conn };
        db.init_schema()?;
        Ok(db)
    }

    /// Creates all tables and indices if they do not already exist.
    ///
    /// `brand` and `chain` are stored as `''` when absent so the UNIQUE
    /// constraints also hold for unbranded items and independent stores.
    fn init_schema(&self) -> Result<()> {
        self.conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS items (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL,
                brand TEXT NOT NULL DEFAULT '',
                category TEXT,
                barcode TEXT,
                package_size TEXT,
                UNIQUE(name, brand)
            );

            CREATE TABLE IF NOT EXISTS places (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL,
                chain TEXT NOT NULL DEFAULT '',
                suburb TEXT,
                state TEXT,
                UNIQUE(name, chain)
            );

            CREATE TABLE IF NOT EXISTS price_records (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                item_id INTEGER NOT NULL REFERENCES items(id) ON DELETE CASCADE,
                place_id INTEGER NOT NULL REFERENCES places(id) ON DELETE CASCADE,
                price REAL NOT NULL,
                is_on_sale INTEGER NOT NULL DEFAULT 0,
                original_price REAL,
                sale_description TEXT,
                valid_from TEXT,
                valid_to TEXT,
                source TEXT NOT NULL,
                date_recorded TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_price_records_recorded
                ON price_records(date_recorded);
            CREATE INDEX IF NOT EXISTS idx_price_records_item
                ON price_records(item_id);
            ",
        )?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Items
    // -----------------------------------------------------------------------

    /// Finds the item with the same `(name, brand)` or inserts it.
    ///
    /// Returns the row id and whether a new row was created. Descriptive
    /// columns of an existing row are left untouched.
    pub fn upsert_item(&self, item: &ItemDetails) -> Result<(i64, bool)> {
        let brand = item.brand.as_deref().unwrap_or("");
        let inserted = self.conn.execute(
            "INSERT INTO items (name, brand, category, barcode, package_size)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(name, brand) DO NOTHING",
            params![
                item.name,
                brand,
                item.category,
                item.barcode,
                item.package_size
            ],
        )?;
        let id: i64 = self.conn.query_row(
            "SELECT id FROM items WHERE name = ?1 AND brand = ?2",
            params![item.name, brand],
            |row| row.get(0),
        )?;
        Ok((id, inserted == 1))
    }

    /// Looks up an item by its natural key.
    pub fn find_item(&self, name: &str, brand: Option<&str>) -> Result<Option<ItemRow>> {
        self.conn
            .query_row(
                "SELECT id, name, brand, category, barcode, package_size
                 FROM items WHERE name = ?1 AND brand = ?2",
                params![name, brand.unwrap_or("")],
                item_from_row,
            )
            .optional()
            .context("Failed to query item")
    }

    /// Fetches an item by id.
    pub fn get_item(&self, id: i64) -> Result<Option<ItemRow>> {
        self.conn
            .query_row(
                "SELECT id, name, brand, category, barcode, package_size
                 FROM items WHERE id = ?1",
                params![id],
                item_from_row,
            )
            .optional()
            .context("Failed to query item")
    }

    // -----------------------------------------------------------------------
    // Places
    // -----------------------------------------------------------------------

    /// Finds the place with the same `(name, chain)` or inserts it.
    pub fn upsert_place(&self, place: &PlaceDetails) -> Result<(i64, bool)> {
        let chain = place.chain.as_deref().unwrap_or("");
        let inserted = self.conn.execute(
            "INSERT INTO places (name, chain, suburb, state)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(name, chain) DO NOTHING",
            params![place.name, chain, place.suburb, place.state],
        )?;
        let id: i64 = self.conn.query_row(
            "SELECT id FROM places WHERE name = ?1 AND chain = ?2",
            params![place.name, chain],
            |row| row.get(0),
        )?;
        Ok((id, inserted == 1))
    }

    /// Looks up a place by its natural key.
    pub fn find_place(&self, name: &str, chain: Option<&str>) -> Result<Option<PlaceRow>> {
        self.conn
            .query_row(
                "SELECT id, name, chain, suburb, state FROM places WHERE name = ?1 AND chain = ?2",
                params![name, chain.unwrap_or("")],
                place_from_row,
            )
            .optional()
            .context("Failed to query place")
    }

    /// Fetches a place by id.
    pub fn get_place(&self, id: i64) -> Result<Option<PlaceRow>> {
        self.conn
            .query_row(
                "SELECT id, name, chain, suburb, state FROM places WHERE id = ?1",
                params![id],
                place_from_row,
            )
            .optional()
            .context("Failed to query place")
    }

    // -----------------------------------------------------------------------
    // Price records
    // -----------------------------------------------------------------------

    /// Records a price observation and returns the new row id.
    pub fn record_price(
        &self,
        item_id: i64,
        place_id: i64,
        observation: &PriceObservation,
        source: &str,
        recorded_at: DateTime<Utc>,
    ) -> Result<i64> {
        self.conn
            .execute(
                "INSERT INTO price_records
                    (item_id, place_id, price, is_on_sale, original_price, sale_description,
                     valid_from, valid_to, source, date_recorded)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    item_id,
                    place_id,
                    observation.price,
                    observation.is_on_sale,
                    observation.original_price,
                    observation.sale_description,
                    observation.valid_from.as_ref().map(to_db_time),
                    observation.valid_to.as_ref().map(to_db_time),
                    source,
                    to_db_time(&recorded_at),
                ],
            )
            .with_context(|| format!("Failed to record price for item {item_id} at place {place_id}"))?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Returns the `limit` most recently recorded prices, newest first.
    /// Records whose item or place no longer exists are skipped.
    pub fn recent_price_updates(&self, limit: usize) -> Result<Vec<PriceRecordView>> {
        let mut stmt = self.conn.prepare(
            "SELECT r.id, r.item_id, r.place_id,
                    i.name, i.brand, i.category, i.barcode, i.package_size,
                    p.name, p.chain, p.suburb, p.state,
                    r.price, r.is_on_sale, r.original_price, r.sale_description,
                    r.valid_from, r.valid_to, r.source, r.date_recorded
             FROM price_records r
             JOIN items i ON i.id = r.item_id
             JOIN places p ON p.id = r.place_id
             ORDER BY r.date_recorded DESC, r.id DESC
             LIMIT ?1",
        )?;

        let rows = stmt.query_map(params![limit as i64], |row| {
            Ok(PriceRecordView {
                id: row.get(0)?,
                item_id: row.get(1)?,
                place_id: row.get(2)?,
                item: ItemDetails {
                    name: row.get(3)?,
                    brand: non_empty(row.get(4)?),
                    category: row.get(5)?,
                    barcode: row.get(6)?,
                    package_size: row.get(7)?,
                },
                place: PlaceDetails {
                    name: row.get(8)?,
                    chain: non_empty(row.get(9)?),
                    suburb: row.get(10)?,
                    state: row.get(11)?,
                },
                observation: PriceObservation {
                    price: row.get(12)?,
                    is_on_sale: row.get(13)?,
                    original_price: row.get(14)?,
                    sale_description: row.get(15)?,
                    valid_from: opt_db_time(row.get(16)?)?,
                    valid_to: opt_db_time(row.get(17)?)?,
                },
                source: row.get(18)?,
                date_recorded: from_db_time(&row.get::<_, String>(19)?)?,
            })
        })?;

        let mut result = Vec::new();
        for row in rows {
            result.push(row.context("Failed to read price record row")?);
        }
        Ok(result)
    }

    /// Returns row counts for items, places and price records.
    pub fn stats(&self) -> Result<StoreStats> {
        let count = |table: &str| -> Result<u64> {
            let n: i64 = self
                .conn
                .query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| row.get(0))?;
            Ok(n as u64)
        };
        Ok(StoreStats {
            items: count("items")?,
            places: count("places")?,
            price_records: count("price_records")?,
        })
    }
}

fn item_from_row(row: &Row<'_>) -> rusqlite::Result<ItemRow> {
    Ok(ItemRow {
        id: row.get(0)?,
        details: ItemDetails {
            name: row.get(1)?,
            brand: non_empty(row.get(2)?),
            category: row.get(3)?,
            barcode: row.get(4)?,
            package_size: row.get(5)?,
        },
    })
}

fn place_from_row(row: &Row<'_>) -> rusqlite::Result<PlaceRow> {
    Ok(PlaceRow {
        id: row.get(0)?,
        details: PlaceDetails {
            name: row.get(1)?,
            chain: non_empty(row.get(2)?),
            suburb: row.get(3)?,
            state: row.get(4)?,
        },
    })
}
