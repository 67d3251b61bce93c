use std::collections::BTreeSet;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgConnection, PgPoolOptions, PgRow};
use sqlx::{PgPool, Postgres, Row, Transaction};
use tokio::sync::Mutex;
use tracing::{debug, info};
use troutlytics_core::{
    Coordinates, LocationId, NaturalKey, NewStockingReport, NewWaterLocation, RunMetadata,
    StockingReport, WaterLocation,
};

use crate::{
    LocationRegistry, RowTransaction, RunMetadataStore, StockingStore, StoreError,
    TransactionalStore,
};

const LOCATION_SELECT: &str = r#"
    SELECT wl.id,
           wl.water_name_cleaned,
           wl.original_html_name,
           wl.latitude,
           wl.longitude,
           wl.directions,
           wl.created_at,
           COALESCE(array_agg(a.alias) FILTER (WHERE a.alias IS NOT NULL), ARRAY[]::TEXT[]) AS aliases
      FROM water_location wl
      LEFT JOIN water_location_alias a ON a.location_id = wl.id
"#;

/// Postgres-backed store. Calls made on the store itself autocommit; row writes go through
/// `begin_row`, which wraps them in one transaction.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(4)
            .acquire_timeout(Duration::from_secs(20))
            .connect(database_url)
            .await?;
        Ok(Self::new(pool))
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        info!("database migrations applied");
        Ok(())
    }
}

fn location_from_row(row: &PgRow) -> Result<WaterLocation, StoreError> {
    let original: Option<String> = row.try_get("original_html_name")?;
    let extra: Vec<String> = row.try_get("aliases")?;
    let aliases = original.into_iter().chain(extra).collect::<BTreeSet<_>>();

    let latitude: Option<f64> = row.try_get("latitude")?;
    let longitude: Option<f64> = row.try_get("longitude")?;
    let coordinates = match (latitude, longitude) {
        (Some(latitude), Some(longitude)) => Some(Coordinates {
            latitude,
            longitude,
        }),
        _ => None,
    };

    Ok(WaterLocation {
        id: LocationId(row.try_get("id")?),
        water_name_cleaned: row.try_get("water_name_cleaned")?,
        aliases,
        coordinates,
        directions: row.try_get("directions")?,
        created_at: row.try_get("created_at")?,
    })
}

fn count_from_db(value: i64) -> Result<u32, StoreError> {
    u32::try_from(value).map_err(|_| StoreError::InvalidRow(format!("stocked_fish={value}")))
}

async fn all_locations(conn: &mut PgConnection) -> Result<Vec<WaterLocation>, StoreError> {
    let sql = format!("{LOCATION_SELECT} GROUP BY wl.id ORDER BY wl.id");
    let rows = sqlx::query(&sql).fetch_all(conn).await?;
    rows.iter().map(location_from_row).collect()
}

async fn find_by_canonical_name(
    conn: &mut PgConnection,
    water_name_cleaned: &str,
) -> Result<Option<WaterLocation>, StoreError> {
    let sql = format!(
        "{LOCATION_SELECT} WHERE wl.water_name_cleaned = $1 GROUP BY wl.id ORDER BY wl.id LIMIT 1"
    );
    let row = sqlx::query(&sql)
        .bind(water_name_cleaned)
        .fetch_optional(conn)
        .await?;
    row.as_ref().map(location_from_row).transpose()
}

async fn find_by_alias(
    conn: &mut PgConnection,
    alias: &str,
) -> Result<Option<WaterLocation>, StoreError> {
    let sql = format!(
        r#"{LOCATION_SELECT}
         WHERE wl.original_html_name = $1
            OR EXISTS (
                SELECT 1 FROM water_location_alias x
                 WHERE x.location_id = wl.id AND x.alias = $1
            )
         GROUP BY wl.id ORDER BY wl.id LIMIT 1"#
    );
    let row = sqlx::query(&sql).bind(alias).fetch_optional(conn).await?;
    row.as_ref().map(location_from_row).transpose()
}

async fn insert_location(
    conn: &mut PgConnection,
    new: NewWaterLocation,
) -> Result<WaterLocation, StoreError> {
    let row = sqlx::query(
        r#"
        INSERT INTO water_location
            (original_html_name, water_name_cleaned, latitude, longitude, directions, created_at, derby_participant)
        VALUES ($1, $2, $3, $4, $5, NOW(), FALSE)
        RETURNING id, created_at
        "#,
    )
    .bind(&new.original_name)
    .bind(&new.water_name_cleaned)
    .bind(new.coordinates.map(|c| c.latitude))
    .bind(new.coordinates.map(|c| c.longitude))
    .bind(&new.directions)
    .fetch_one(conn)
    .await?;

    let id = LocationId(row.try_get("id")?);
    debug!(%id, name = %new.water_name_cleaned, "inserted water_location");
    Ok(WaterLocation {
        id,
        water_name_cleaned: new.water_name_cleaned,
        aliases: BTreeSet::from([new.original_name]),
        coordinates: new.coordinates,
        directions: new.directions,
        created_at: row.try_get("created_at")?,
    })
}

async fn append_alias(
    conn: &mut PgConnection,
    id: LocationId,
    alias: &str,
) -> Result<(), StoreError> {
    let result = sqlx::query(
        r#"
        INSERT INTO water_location_alias (location_id, alias)
        SELECT id, $2 FROM water_location WHERE id = $1
        ON CONFLICT (location_id, alias) DO NOTHING
        "#,
    )
    .bind(id.0)
    .bind(alias)
    .execute(&mut *conn)
    .await?;

    if result.rows_affected() == 0 {
        let exists: bool =
            sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM water_location WHERE id = $1)")
                .bind(id.0)
                .fetch_one(&mut *conn)
                .await?;
        if !exists {
            return Err(StoreError::UnknownLocation(id));
        }
    }
    Ok(())
}

async fn find_by_key(
    conn: &mut PgConnection,
    key: &NaturalKey,
) -> Result<Option<StockingReport>, StoreError> {
    let row = sqlx::query(
        r#"
        SELECT id, stocked_fish, weight, derby_participant
          FROM stocking_report
         WHERE date = $1
           AND water_location_id = $2
           AND species = $3
           AND hatchery = $4
        "#,
    )
    .bind(key.event_date)
    .bind(key.water_location_id.0)
    .bind(&key.species)
    .bind(&key.hatchery)
    .fetch_optional(conn)
    .await?;

    let Some(row) = row else {
        return Ok(None);
    };
    Ok(Some(StockingReport {
        id: row.try_get("id")?,
        key: key.clone(),
        stocked_fish: count_from_db(row.try_get("stocked_fish")?)?,
        weight: row.try_get("weight")?,
        derby_participant: row.try_get("derby_participant")?,
    }))
}

async fn insert_report(
    conn: &mut PgConnection,
    new: NewStockingReport,
) -> Result<StockingReport, StoreError> {
    let id: i64 = sqlx::query_scalar(
        r#"
        INSERT INTO stocking_report (date, water_location_id, species, hatchery, stocked_fish, weight)
        VALUES ($1, $2, $3, $4, $5, $6)
        RETURNING id
        "#,
    )
    .bind(new.key.event_date)
    .bind(new.key.water_location_id.0)
    .bind(&new.key.species)
    .bind(&new.key.hatchery)
    .bind(i64::from(new.stocked_fish))
    .bind(new.weight)
    .fetch_one(conn)
    .await?;

    Ok(StockingReport {
        id,
        key: new.key,
        stocked_fish: new.stocked_fish,
        weight: new.weight,
        derby_participant: false,
    })
}

async fn update_counts(
    conn: &mut PgConnection,
    id: i64,
    stocked_fish: u32,
    weight: Option<f64>,
) -> Result<(), StoreError> {
    let result = sqlx::query("UPDATE stocking_report SET stocked_fish = $2, weight = $3 WHERE id = $1")
        .bind(id)
        .bind(i64::from(stocked_fish))
        .bind(weight)
        .execute(conn)
        .await?;
    if result.rows_affected() == 0 {
        return Err(StoreError::UnknownReport(id));
    }
    Ok(())
}

#[async_trait]
impl LocationRegistry for PgStore {
    async fn all_locations(&self) -> Result<Vec<WaterLocation>, StoreError> {
        all_locations(&mut *self.pool.acquire().await?).await
    }

    async fn find_by_canonical_name(
        &self,
        water_name_cleaned: &str,
    ) -> Result<Option<WaterLocation>, StoreError> {
        find_by_canonical_name(&mut *self.pool.acquire().await?, water_name_cleaned).await
    }

    async fn find_by_alias(&self, alias: &str) -> Result<Option<WaterLocation>, StoreError> {
        find_by_alias(&mut *self.pool.acquire().await?, alias).await
    }

    async fn insert_location(&self, new: NewWaterLocation) -> Result<WaterLocation, StoreError> {
        insert_location(&mut *self.pool.acquire().await?, new).await
    }

    async fn append_alias(&self, id: LocationId, alias: &str) -> Result<(), StoreError> {
        append_alias(&mut *self.pool.acquire().await?, id, alias).await
    }
}

#[async_trait]
impl StockingStore for PgStore {
    async fn find_by_key(&self, key: &NaturalKey) -> Result<Option<StockingReport>, StoreError> {
        find_by_key(&mut *self.pool.acquire().await?, key).await
    }

    async fn insert_report(&self, new: NewStockingReport) -> Result<StockingReport, StoreError> {
        insert_report(&mut *self.pool.acquire().await?, new).await
    }

    async fn update_counts(
        &self,
        id: i64,
        stocked_fish: u32,
        weight: Option<f64>,
    ) -> Result<(), StoreError> {
        update_counts(&mut *self.pool.acquire().await?, id, stocked_fish, weight).await
    }
}

#[async_trait]
impl TransactionalStore for PgStore {
    async fn begin_row<'a>(&'a self) -> Result<Box<dyn RowTransaction + 'a>, StoreError> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(PgRowTransaction { tx: Mutex::new(tx) }))
    }
}

/// One source row's writes inside a database transaction. Dropped uncommitted, sqlx rolls it back.
pub struct PgRowTransaction {
    tx: Mutex<Transaction<'static, Postgres>>,
}

#[async_trait]
impl LocationRegistry for PgRowTransaction {
    async fn all_locations(&self) -> Result<Vec<WaterLocation>, StoreError> {
        all_locations(&mut **self.tx.lock().await).await
    }

    async fn find_by_canonical_name(
        &self,
        water_name_cleaned: &str,
    ) -> Result<Option<WaterLocation>, StoreError> {
        find_by_canonical_name(&mut **self.tx.lock().await, water_name_cleaned).await
    }

    async fn find_by_alias(&self, alias: &str) -> Result<Option<WaterLocation>, StoreError> {
        find_by_alias(&mut **self.tx.lock().await, alias).await
    }

    async fn insert_location(&self, new: NewWaterLocation) -> Result<WaterLocation, StoreError> {
        insert_location(&mut **self.tx.lock().await, new).await
    }

    async fn append_alias(&self, id: LocationId, alias: &str) -> Result<(), StoreError> {
        append_alias(&mut **self.tx.lock().await, id, alias).await
    }
}

#[async_trait]
impl StockingStore for PgRowTransaction {
    async fn find_by_key(&self, key: &NaturalKey) -> Result<Option<StockingReport>, StoreError> {
        find_by_key(&mut **self.tx.lock().await, key).await
    }

    async fn insert_report(&self, new: NewStockingReport) -> Result<StockingReport, StoreError> {
        insert_report(&mut **self.tx.lock().await, new).await
    }

    async fn update_counts(
        &self,
        id: i64,
        stocked_fish: u32,
        weight: Option<f64>,
    ) -> Result<(), StoreError> {
        update_counts(&mut **self.tx.lock().await, id, stocked_fish, weight).await
    }
}

#[async_trait]
impl RowTransaction for PgRowTransaction {
    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        self.tx.into_inner().commit().await?;
        Ok(())
    }
}

#[async_trait]
impl RunMetadataStore for PgStore {
    async fn record_run(&self, meta: &RunMetadata) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO utility (
                updated, updated_at, run_started_at, run_finished_at, run_seconds,
                rows_scraped, rows_inserted, rows_updated, rows_unchanged, rows_skipped,
                rows_rejected, rows_unmatched, water_locations_matched, water_locations_created,
                geocode_warnings, source_url, scraper_version, status
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18)
            "#,
        )
        .bind(meta.updated.date_naive())
        .bind(meta.updated)
        .bind(meta.run_started_at)
        .bind(meta.run_finished_at)
        .bind(meta.run_seconds())
        .bind(i64::from(meta.rows_seen))
        .bind(i64::from(meta.rows_inserted))
        .bind(i64::from(meta.rows_updated))
        .bind(i64::from(meta.rows_unchanged))
        .bind(i64::from(meta.rows_skipped))
        .bind(i64::from(meta.rows_rejected))
        .bind(i64::from(meta.rows_unmatched))
        .bind(i64::from(meta.locations_matched))
        .bind(i64::from(meta.locations_created))
        .bind(i64::from(meta.geocode_warnings))
        .bind(&meta.source_url)
        .bind(&meta.scraper_version)
        .bind(&meta.status)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn latest_updated(&self) -> Result<Option<DateTime<Utc>>, StoreError> {
        let latest: Option<DateTime<Utc>> =
            sqlx::query_scalar("SELECT updated_at FROM utility ORDER BY updated_at DESC, id DESC LIMIT 1")
                .fetch_optional(&self.pool)
                .await?;
        Ok(latest)
    }
}
