use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::debug;
use troutlytics_core::{
    LocationId, NaturalKey, NewStockingReport, NewWaterLocation, RunMetadata, StockingReport,
    WaterLocation,
};

use crate::{
    LocationRegistry, RowTransaction, RunMetadataStore, StockingStore, StoreError,
    TransactionalStore,
};

#[derive(Debug, Default, Clone)]
struct MemoryState {
    locations: BTreeMap<LocationId, WaterLocation>,
    reports: BTreeMap<i64, StockingReport>,
    runs: Vec<RunMetadata>,
    next_location_id: i64,
    next_report_id: i64,
}

impl MemoryState {
    fn find_by_canonical_name(&self, water_name_cleaned: &str) -> Option<WaterLocation> {
        self.locations
            .values()
            .find(|l| l.water_name_cleaned == water_name_cleaned)
            .cloned()
    }

    fn find_by_alias(&self, alias: &str) -> Option<WaterLocation> {
        self.locations
            .values()
            .find(|l| l.aliases.contains(alias))
            .cloned()
    }

    fn insert_location(&mut self, new: NewWaterLocation) -> WaterLocation {
        self.next_location_id += 1;
        let id = LocationId(self.next_location_id);
        let location = WaterLocation {
            id,
            water_name_cleaned: new.water_name_cleaned,
            aliases: BTreeSet::from([new.original_name]),
            coordinates: new.coordinates,
            directions: new.directions,
            created_at: Some(Utc::now()),
        };
        self.locations.insert(id, location.clone());
        debug!(%id, name = %location.water_name_cleaned, "created water location");
        location
    }

    fn append_alias(&mut self, id: LocationId, alias: &str) -> Result<(), StoreError> {
        let location = self
            .locations
            .get_mut(&id)
            .ok_or(StoreError::UnknownLocation(id))?;
        location.aliases.insert(alias.to_string());
        Ok(())
    }

    fn find_by_key(&self, key: &NaturalKey) -> Option<StockingReport> {
        self.reports.values().find(|r| &r.key == key).cloned()
    }

    fn insert_report(&mut self, new: NewStockingReport) -> Result<StockingReport, StoreError> {
        if !self.locations.contains_key(&new.key.water_location_id) {
            return Err(StoreError::UnknownLocation(new.key.water_location_id));
        }
        if self.reports.values().any(|r| r.key == new.key) {
            return Err(StoreError::InvalidRow(format!(
                "duplicate natural key {:?}",
                new.key
            )));
        }
        self.next_report_id += 1;
        let report = StockingReport {
            id: self.next_report_id,
            key: new.key,
            stocked_fish: new.stocked_fish,
            weight: new.weight,
            derby_participant: false,
        };
        self.reports.insert(report.id, report.clone());
        Ok(report)
    }

    fn update_counts(
        &mut self,
        id: i64,
        stocked_fish: u32,
        weight: Option<f64>,
    ) -> Result<(), StoreError> {
        let report = self
            .reports
            .get_mut(&id)
            .ok_or(StoreError::UnknownReport(id))?;
        report.stocked_fish = stocked_fish;
        report.weight = weight;
        Ok(())
    }
}

/// In-process store used by tests and dry runs.
///
/// Supports simulated outages: either switched on directly or scheduled to start after
/// a number of successful writes.
#[derive(Debug)]
pub struct InMemoryStore {
    state: Mutex<MemoryState>,
    available: AtomicBool,
    writes_before_outage: AtomicUsize,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MemoryState::default()),
            available: AtomicBool::new(true),
            writes_before_outage: AtomicUsize::new(usize::MAX),
        }
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Every call after `writes` successful writes fails with `StoreError::Unavailable`.
    pub fn fail_after_writes(&self, writes: usize) {
        self.writes_before_outage.store(writes, Ordering::SeqCst);
    }

    /// Seeds a location the way an earlier run would have left it.
    pub async fn seed_location(&self, water_name_cleaned: &str, aliases: &[&str]) -> LocationId {
        let mut state = self.state.lock().await;
        state.next_location_id += 1;
        let id = LocationId(state.next_location_id);
        state.locations.insert(
            id,
            WaterLocation {
                id,
                water_name_cleaned: water_name_cleaned.to_string(),
                aliases: aliases.iter().map(|a| a.to_string()).collect(),
                coordinates: None,
                directions: None,
                created_at: None,
            },
        );
        id
    }

    pub async fn locations(&self) -> Vec<WaterLocation> {
        self.state.lock().await.locations.values().cloned().collect()
    }

    pub async fn reports(&self) -> Vec<StockingReport> {
        self.state.lock().await.reports.values().cloned().collect()
    }

    pub async fn runs(&self) -> Vec<RunMetadata> {
        self.state.lock().await.runs.clone()
    }

    fn check_read(&self) -> Result<(), StoreError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::Unavailable("in-memory store switched off".into()))
        }
    }

    fn check_write(&self) -> Result<(), StoreError> {
        self.check_read()?;
        let remaining = self.writes_before_outage.load(Ordering::SeqCst);
        if remaining == 0 {
            self.available.store(false, Ordering::SeqCst);
            return Err(StoreError::Unavailable(
                "in-memory store lost its connection".into(),
            ));
        }
        if remaining != usize::MAX {
            self.writes_before_outage.store(remaining - 1, Ordering::SeqCst);
        }
        Ok(())
    }
}

#[async_trait]
impl LocationRegistry for InMemoryStore {
    async fn all_locations(&self) -> Result<Vec<WaterLocation>, StoreError> {
        self.check_read()?;
        Ok(self.locations().await)
    }

    async fn find_by_canonical_name(
        &self,
        water_name_cleaned: &str,
    ) -> Result<Option<WaterLocation>, StoreError> {
        self.check_read()?;
        Ok(self.state.lock().await.find_by_canonical_name(water_name_cleaned))
    }

    async fn find_by_alias(&self, alias: &str) -> Result<Option<WaterLocation>, StoreError> {
        self.check_read()?;
        Ok(self.state.lock().await.find_by_alias(alias))
    }

    async fn insert_location(&self, new: NewWaterLocation) -> Result<WaterLocation, StoreError> {
        self.check_write()?;
        Ok(self.state.lock().await.insert_location(new))
    }

    async fn append_alias(&self, id: LocationId, alias: &str) -> Result<(), StoreError> {
        self.check_write()?;
        self.state.lock().await.append_alias(id, alias)
    }
}

#[async_trait]
impl StockingStore for InMemoryStore {
    async fn find_by_key(&self, key: &NaturalKey) -> Result<Option<StockingReport>, StoreError> {
        self.check_read()?;
        Ok(self.state.lock().await.find_by_key(key))
    }

    async fn insert_report(&self, new: NewStockingReport) -> Result<StockingReport, StoreError> {
        self.check_write()?;
        self.state.lock().await.insert_report(new)
    }

    async fn update_counts(
        &self,
        id: i64,
        stocked_fish: u32,
        weight: Option<f64>,
    ) -> Result<(), StoreError> {
        self.check_write()?;
        self.state.lock().await.update_counts(id, stocked_fish, weight)
    }
}

#[async_trait]
impl RunMetadataStore for InMemoryStore {
    async fn record_run(&self, meta: &RunMetadata) -> Result<(), StoreError> {
        self.check_write()?;
        self.state.lock().await.runs.push(meta.clone());
        Ok(())
    }

    async fn latest_updated(&self) -> Result<Option<DateTime<Utc>>, StoreError> {
        self.check_read()?;
        let state = self.state.lock().await;
        Ok(state.runs.iter().map(|r| r.updated).max())
    }
}

#[async_trait]
impl TransactionalStore for InMemoryStore {
    async fn begin_row<'a>(&'a self) -> Result<Box<dyn RowTransaction + 'a>, StoreError> {
        self.check_read()?;
        let staged = self.state.lock().await.clone();
        Ok(Box::new(MemoryRowTransaction {
            store: self,
            staged: Mutex::new(staged),
        }))
    }
}

/// Works on a copy of the store state; `commit` swaps the copy in.
#[derive(Debug)]
pub struct MemoryRowTransaction<'a> {
    store: &'a InMemoryStore,
    staged: Mutex<MemoryState>,
}

#[async_trait]
impl LocationRegistry for MemoryRowTransaction<'_> {
    async fn all_locations(&self) -> Result<Vec<WaterLocation>, StoreError> {
        self.store.check_read()?;
        Ok(self.staged.lock().await.locations.values().cloned().collect())
    }

    async fn find_by_canonical_name(
        &self,
        water_name_cleaned: &str,
    ) -> Result<Option<WaterLocation>, StoreError> {
        self.store.check_read()?;
        Ok(self.staged.lock().await.find_by_canonical_name(water_name_cleaned))
    }

    async fn find_by_alias(&self, alias: &str) -> Result<Option<WaterLocation>, StoreError> {
        self.store.check_read()?;
        Ok(self.staged.lock().await.find_by_alias(alias))
    }

    async fn insert_location(&self, new: NewWaterLocation) -> Result<WaterLocation, StoreError> {
        self.store.check_write()?;
        Ok(self.staged.lock().await.insert_location(new))
    }

    async fn append_alias(&self, id: LocationId, alias: &str) -> Result<(), StoreError> {
        self.store.check_write()?;
        self.staged.lock().await.append_alias(id, alias)
    }
}

#[async_trait]
impl StockingStore for MemoryRowTransaction<'_> {
    async fn find_by_key(&self, key: &NaturalKey) -> Result<Option<StockingReport>, StoreError> {
        self.store.check_read()?;
        Ok(self.staged.lock().await.find_by_key(key))
    }

    async fn insert_report(&self, new: NewStockingReport) -> Result<StockingReport, StoreError> {
        self.store.check_write()?;
        self.staged.lock().await.insert_report(new)
    }

    async fn update_counts(
        &self,
        id: i64,
        stocked_fish: u32,
        weight: Option<f64>,
    ) -> Result<(), StoreError> {
        self.store.check_write()?;
        self.staged.lock().await.update_counts(id, stocked_fish, weight)
    }
}

#[async_trait]
impl RowTransaction for MemoryRowTransaction<'_> {
    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        let this = *self;
        this.store.check_read()?;
        *this.store.state.lock().await = this.staged.into_inner();
        Ok(())
    }
}
