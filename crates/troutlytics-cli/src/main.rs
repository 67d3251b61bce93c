use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;
use troutlytics_storage::{PgStore, RunMetadataStore};
use troutlytics_sync::{run_ingest_from_env, IngestConfig};

const DEFAULT_SNAPSHOT: &str = "fixtures/wdfw/sample/rows.json";

#[derive(Debug, Parser)]
#[command(name = "troutlytics")]
#[command(about = "Trout stocking report ingest")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Ingest one snapshot of the stocking report.
    Ingest {
        #[arg(long, default_value = DEFAULT_SNAPSHOT)]
        snapshot: PathBuf,
    },
    /// Apply pending database migrations.
    Migrate,
    /// Print when the data was last refreshed.
    LastUpdated,
}

/// `LOG_LEVEL` wins over `RUST_LOG`; neither set means `info`.
fn log_filter() -> EnvFilter {
    std::env::var("LOG_LEVEL")
        .ok()
        .and_then(|level| EnvFilter::try_new(level).ok())
        .or_else(|| EnvFilter::try_from_default_env().ok())
        .unwrap_or_else(|| EnvFilter::new("info"))
}

fn init_logging() {
    let filter = log_filter();
    let json = std::env::var("LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json"));
    if json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    init_logging();
    let cli = Cli::parse();

    let command = cli.command.unwrap_or(Commands::Ingest {
        snapshot: PathBuf::from(DEFAULT_SNAPSHOT),
    });
    match command {
        Commands::Ingest { snapshot } => {
            let summary = run_ingest_from_env(snapshot).await?;
            let c = &summary.counters;
            println!(
                "ingest {:?}: run_id={} rows={} inserted={} updated={} unchanged={} skipped={} rejected={} created={} geocode_warnings={}",
                summary.state,
                summary.run_id,
                c.rows_seen,
                c.inserted,
                c.updated,
                c.unchanged,
                c.skipped,
                c.rows_rejected(),
                c.locations_created,
                c.geocode_warnings
            );
            if summary.is_failed() {
                match &summary.failure {
                    Some(failure) => bail!(
                        "ingest failed at row {} after {} rows: {}",
                        failure.row_index,
                        failure.rows_processed,
                        failure.error
                    ),
                    None => bail!("ingest failed"),
                }
            }
        }
        Commands::Migrate => {
            let config = IngestConfig::from_env();
            let store = PgStore::connect(&config.database_url)
                .await
                .context("connecting to postgres")?;
            store.migrate().await.context("running migrations")?;
            info!("migrations applied");
        }
        Commands::LastUpdated => {
            let config = IngestConfig::from_env();
            let store = PgStore::connect(&config.database_url)
                .await
                .context("connecting to postgres")?;
            match store.latest_updated().await? {
                Some(updated) => println!("{}", updated.to_rfc3339()),
                None => println!("never"),
            }
        }
    }

    Ok(())
}
