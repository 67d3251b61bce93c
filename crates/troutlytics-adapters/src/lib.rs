//! Raw-row source contracts.
//!
//! Fetching and parsing the published report page happens upstream; what reaches the
//! pipeline is a `SnapshotBundle`: one capture of the report as column-name-to-text rows.

use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use troutlytics_core::RawRow;

pub const WDFW_TROUT_PLANTS_URL: &str = "https://wdfw.wa.gov/fishing/reports/stocking/trout-plants/all?lake_stocked=&county=&species=&hatchery=&region=&items_per_page=250";

/// One capture of the stocking report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotBundle {
    pub source_url: String,
    pub fetched_at: DateTime<Utc>,
    #[serde(default)]
    pub notes: Option<String>,
    pub rows: Vec<RawRow>,
}

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("reading snapshot {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing snapshot {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

#[async_trait]
pub trait RowSource: Send + Sync {
    fn describe(&self) -> String;

    async fn load(&self) -> Result<SnapshotBundle, SnapshotError>;
}

/// Reads a snapshot bundle written as JSON by the page collaborator.
#[derive(Debug, Clone)]
pub struct JsonSnapshotSource {
    path: PathBuf,
}

impl JsonSnapshotSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl RowSource for JsonSnapshotSource {
    fn describe(&self) -> String {
        format!("json snapshot {}", self.path.display())
    }

    async fn load(&self) -> Result<SnapshotBundle, SnapshotError> {
        let text = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|source| SnapshotError::Read {
                path: self.path.clone(),
                source,
            })?;
        parse_snapshot(&text).map_err(|source| SnapshotError::Parse {
            path: self.path.clone(),
            source,
        })
    }
}

/// Accepts either a full bundle or a bare array of rows.
pub fn parse_snapshot(text: &str) -> Result<SnapshotBundle, serde_json::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum SnapshotShape {
        Bundle(SnapshotBundle),
        Rows(Vec<RawRow>),
    }

    Ok(match serde_json::from_str(text)? {
        SnapshotShape::Bundle(bundle) => bundle,
        SnapshotShape::Rows(rows) => SnapshotBundle {
            source_url: WDFW_TROUT_PLANTS_URL.to_string(),
            fetched_at: Utc::now(),
            notes: None,
            rows,
        },
    })
}

/// Rows already in memory, e.g. handed over by an embedding scraper.
#[derive(Debug, Clone)]
pub struct StaticRowSource {
    bundle: SnapshotBundle,
}

impl StaticRowSource {
    pub fn new(source_url: impl Into<String>, rows: Vec<RawRow>) -> Self {
        Self {
            bundle: SnapshotBundle {
                source_url: source_url.into(),
                fetched_at: Utc::now(),
                notes: None,
                rows,
            },
        }
    }
}

#[async_trait]
impl RowSource for StaticRowSource {
    fn describe(&self) -> String {
        format!("{} in-memory rows", self.bundle.rows.len())
    }

    async fn load(&self) -> Result<SnapshotBundle, SnapshotError> {
        Ok(self.bundle.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_row_arrays_get_the_default_source() {
        let bundle = parse_snapshot(
            r#"[{"date": "03/15/2024", "water": "Battle Ground Lk", "count": "1500"}]"#,
        )
        .unwrap();
        assert_eq!(bundle.source_url, WDFW_TROUT_PLANTS_URL);
        assert_eq!(bundle.rows.len(), 1);
        assert_eq!(bundle.rows[0]["water"], "Battle Ground Lk");
    }

    #[test]
    fn full_bundles_keep_their_metadata() {
        let bundle = parse_snapshot(
            r#"{
                "source_url": "https://example.test/report",
                "fetched_at": "2024-03-16T06:00:00Z",
                "rows": []
            }"#,
        )
        .unwrap();
        assert_eq!(bundle.source_url, "https://example.test/report");
        assert!(bundle.rows.is_empty());
        assert!(bundle.notes.is_none());
    }

    #[tokio::test]
    async fn static_rows_load_as_a_bundle() {
        let row: RawRow = [("water".to_string(), "Mineral Lk".to_string())].into();
        let source = StaticRowSource::new("https://example.test/report", vec![row]);
        assert_eq!(source.describe(), "1 in-memory rows");

        let bundle = source.load().await.unwrap();
        assert_eq!(bundle.source_url, "https://example.test/report");
        assert_eq!(bundle.rows[0]["water"], "Mineral Lk");
    }

    #[tokio::test]
    async fn missing_file_reports_its_path() {
        let source = JsonSnapshotSource::new("does/not/exist.json");
        let err = source.load().await.unwrap_err();
        assert!(err.to_string().contains("does/not/exist.json"));
    }
}
