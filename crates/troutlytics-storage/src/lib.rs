//! Persistence and geocoding collaborators for the ingest pipeline.
//!
//! The pipeline only talks to the traits in this crate. `InMemoryStore` backs tests,
//! `PgStore` backs production runs, and `HttpGeocoder` wraps the external geocoding API.
//! Row writes go through a `RowTransaction` so a row lands completely or not at all.

mod geocode;
mod memory;
mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use troutlytics_core::{
    LocationId, NaturalKey, NewStockingReport, NewWaterLocation, RunMetadata, StockingReport,
    WaterLocation,
};

pub use geocode::{
    classify_status, BackoffPolicy, GeocodeError, Geocoder, GeocoderConfig, HttpGeocoder,
    RetryDisposition, GOOGLE_GEOCODE_ENDPOINT,
};
pub use memory::{InMemoryStore, MemoryRowTransaction};
pub use postgres::{PgRowTransaction, PgStore};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("unknown water location {0}")]
    UnknownLocation(LocationId),
    #[error("unknown stocking report {0}")]
    UnknownReport(i64),
    #[error("stored row is not representable: {0}")]
    InvalidRow(String),
    #[error("database error: {0}")]
    Database(#[source] sqlx::Error),
    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed => StoreError::Unavailable(err.to_string()),
            other => StoreError::Database(other),
        }
    }
}

/// Registry of known water bodies, keyed by surrogate id.
#[async_trait]
pub trait LocationRegistry: Send + Sync {
    /// Full registry snapshot; loaded once per run.
    async fn all_locations(&self) -> Result<Vec<WaterLocation>, StoreError>;

    async fn find_by_canonical_name(
        &self,
        water_name_cleaned: &str,
    ) -> Result<Option<WaterLocation>, StoreError>;

    async fn find_by_alias(&self, alias: &str) -> Result<Option<WaterLocation>, StoreError>;

    async fn insert_location(&self, new: NewWaterLocation) -> Result<WaterLocation, StoreError>;

    /// Records a raw name variant. Appending a known alias is a no-op.
    async fn append_alias(&self, id: LocationId, alias: &str) -> Result<(), StoreError>;
}

#[async_trait]
pub trait StockingStore: Send + Sync {
    async fn find_by_key(&self, key: &NaturalKey) -> Result<Option<StockingReport>, StoreError>;

    async fn insert_report(&self, new: NewStockingReport) -> Result<StockingReport, StoreError>;

    async fn update_counts(
        &self,
        id: i64,
        stocked_fish: u32,
        weight: Option<f64>,
    ) -> Result<(), StoreError>;
}

#[async_trait]
pub trait RunMetadataStore: Send + Sync {
    async fn record_run(&self, meta: &RunMetadata) -> Result<(), StoreError>;

    async fn latest_updated(&self) -> Result<Option<DateTime<Utc>>, StoreError>;
}

/// Writes belonging to one source row. Dropping it without `commit` rolls them back.
#[async_trait]
pub trait RowTransaction: LocationRegistry + StockingStore {
    async fn commit(self: Box<Self>) -> Result<(), StoreError>;
}

#[async_trait]
pub trait TransactionalStore: Send + Sync {
    async fn begin_row<'a>(&'a self) -> Result<Box<dyn RowTransaction + 'a>, StoreError>;
}

/// Everything one ingest run needs from persistence.
pub trait IngestStore:
    LocationRegistry + StockingStore + RunMetadataStore + TransactionalStore
{
}

impl<T> IngestStore for T where
    T: LocationRegistry + StockingStore + RunMetadataStore + TransactionalStore
{
}
