//! Dedup/upsert of stocking events keyed by (date, location, species, hatchery).

use std::collections::HashSet;

use serde::Serialize;
use tracing::debug;
use troutlytics_core::{LocationId, NaturalKey, NewStockingReport, NormalizedRow};
use troutlytics_storage::{StockingStore, StoreError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UpsertOutcome {
    Inserted,
    Updated,
    Unchanged,
    /// No location to attach the report to.
    Skipped,
}

/// Per-run upsert state. The first sighting of a key within a run is authoritative; repeats
/// are reported as `Unchanged` without touching the store.
#[derive(Debug, Default)]
pub struct UpsertEngine {
    seen_this_run: HashSet<NaturalKey>,
    duplicates_in_run: usize,
}

impl UpsertEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn duplicates_in_run(&self) -> usize {
        self.duplicates_in_run
    }

    pub async fn upsert<S>(
        &mut self,
        store: &S,
        row: &NormalizedRow,
        location_id: Option<LocationId>,
    ) -> Result<UpsertOutcome, StoreError>
    where
        S: StockingStore + ?Sized,
    {
        let Some(location_id) = location_id else {
            return Ok(UpsertOutcome::Skipped);
        };
        let key = NaturalKey::for_row(row, location_id);

        if self.seen_this_run.contains(&key) {
            self.duplicates_in_run += 1;
            debug!(?key, "natural key repeated within run; first sighting kept");
            return Ok(UpsertOutcome::Unchanged);
        }

        let outcome = match store.find_by_key(&key).await? {
            None => {
                store
                    .insert_report(NewStockingReport {
                        key: key.clone(),
                        stocked_fish: row.stocked_fish,
                        weight: row.weight,
                    })
                    .await?;
                UpsertOutcome::Inserted
            }
            Some(existing) if existing.same_counts(row.stocked_fish, row.weight) => {
                UpsertOutcome::Unchanged
            }
            Some(existing) => {
                store
                    .update_counts(existing.id, row.stocked_fish, row.weight)
                    .await?;
                debug!(
                    id = existing.id,
                    from = existing.stocked_fish,
                    to = row.stocked_fish,
                    "stocking report revised"
                );
                UpsertOutcome::Updated
            }
        };
        self.seen_this_run.insert(key);
        Ok(outcome)
    }
}
