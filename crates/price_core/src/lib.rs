//! Local services shared by price-sharing nodes: on-disk locations, logging
//! setup and the SQLite store for items, places and price records.

pub mod db;
pub mod logging;
pub mod paths;

pub use db::{
    Database, ItemDetails, ItemRow, PlaceDetails, PlaceRow, PriceObservation, PriceRecordView,
    StoreStats,
};
pub use paths::AppPaths;
