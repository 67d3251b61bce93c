//! Core domain model for the stocking report ingest.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// One scraped table row: source column name to cell text.
pub type RawRow = BTreeMap<String, String>;

/// Column names of the published stocking report, as the page collaborator emits them.
pub mod columns {
    pub const DATE: &str = "date";
    pub const WATER: &str = "water";
    pub const SPECIES: &str = "species";
    pub const HATCHERY: &str = "hatchery";
    pub const COUNT: &str = "count";
    /// Fish per pound. Optional in the source.
    pub const WEIGHT: &str = "weight";
}

/// Date layouts the source has used for the stock date column, tried in order.
pub const SOURCE_DATE_FORMATS: &[&str] = &["%m/%d/%Y", "%b %d, %Y", "%B %d, %Y", "%Y-%m-%d"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LocationId(pub i64);

impl fmt::Display for LocationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Typed, canonical view of a raw row. Only produced by the field normalizer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedRow {
    pub event_date: NaiveDate,
    pub water_name_raw: String,
    pub water_name_cleaned: String,
    pub species: String,
    pub hatchery: String,
    pub stocked_fish: u32,
    pub weight: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinates {
    pub latitude: f64,
    pub longitude: f64,
}

/// A physical water body known to the registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WaterLocation {
    pub id: LocationId,
    pub water_name_cleaned: String,
    /// Raw names this location has been published under.
    pub aliases: BTreeSet<String>,
    pub coordinates: Option<Coordinates>,
    pub directions: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewWaterLocation {
    pub water_name_cleaned: String,
    pub original_name: String,
    pub coordinates: Option<Coordinates>,
    pub directions: Option<String>,
}

/// Identity of a single stocking event; unique in the store.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NaturalKey {
    pub event_date: NaiveDate,
    pub water_location_id: LocationId,
    pub species: String,
    pub hatchery: String,
}

impl NaturalKey {
    pub fn for_row(row: &NormalizedRow, water_location_id: LocationId) -> Self {
        Self {
            event_date: row.event_date,
            water_location_id,
            species: row.species.clone(),
            hatchery: row.hatchery.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StockingReport {
    pub id: i64,
    pub key: NaturalKey,
    pub stocked_fish: u32,
    pub weight: Option<f64>,
    pub derby_participant: bool,
}

impl StockingReport {
    pub fn same_counts(&self, stocked_fish: u32, weight: Option<f64>) -> bool {
        self.stocked_fish == stocked_fish && self.weight == weight
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewStockingReport {
    pub key: NaturalKey,
    pub stocked_fish: u32,
    pub weight: Option<f64>,
}

/// Bookkeeping row written once per completed run (`utility` table).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunMetadata {
    pub updated: DateTime<Utc>,
    pub run_started_at: DateTime<Utc>,
    pub run_finished_at: DateTime<Utc>,
    pub rows_seen: u32,
    pub rows_inserted: u32,
    pub rows_updated: u32,
    pub rows_unchanged: u32,
    pub rows_skipped: u32,
    pub rows_rejected: u32,
    pub rows_unmatched: u32,
    pub locations_matched: u32,
    pub locations_created: u32,
    pub geocode_warnings: u32,
    pub source_url: Option<String>,
    pub scraper_version: Option<String>,
    pub status: String,
}

impl RunMetadata {
    pub fn run_seconds(&self) -> f64 {
        (self.run_finished_at - self.run_started_at).num_milliseconds() as f64 / 1000.0
    }
}
