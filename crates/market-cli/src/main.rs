//! `market` command-line interface.
//!
//! Every command prints JSON on stdout; logs go to stderr.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use market::{
    AssetType, DataOrigin, DateRange, FetchOptions, HistoricalData, MarketConfig, MarketData,
    PriceQuote, PriceRequest, RecordStore, SourceRegistry, SqliteStore, Symbol,
};

#[derive(Parser)]
#[command(name = "market")]
#[command(about = "Historical market data with gap-filling backfill", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// SQLite database file
    #[arg(long, global = true, env = "MARKET_DB", default_value = "market.db")]
    db: PathBuf,

    /// JSON configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Backfill the full history of a symbol
    Update {
        /// Asset type (pk-equity, crypto, kse100, spx500, ...)
        asset_type: AssetType,
        /// Symbol
        symbol: Symbol,
        /// Fetch and rewrite the whole history, stored days included
        #[arg(long)]
        force: bool,
    },

    /// Read a date range, fetching missing days
    History {
        /// Asset type
        asset_type: AssetType,
        /// Symbol
        symbol: Symbol,
        /// First day (YYYY-MM-DD)
        #[arg(long)]
        from: NaiveDate,
        /// Last day (YYYY-MM-DD)
        #[arg(long)]
        to: NaiveDate,
        /// Bypass the cache and revalidate the latest trading day
        #[arg(long)]
        refresh: bool,
        /// Print a table instead of JSON
        #[arg(long)]
        table: bool,
    },

    /// Latest stored price of a symbol
    Price {
        /// Asset type
        asset_type: AssetType,
        /// Symbol
        symbol: Symbol,
    },

    /// Current prices of many symbols
    Batch {
        /// Items as asset-type:SYMBOL
        #[arg(required = true)]
        items: Vec<PriceRequest>,
        /// Treat every stored row as stale
        #[arg(long)]
        refresh: bool,
    },
}

/// Summary printed by `update`.
#[derive(Serialize)]
struct UpdateReport {
    status: &'static str,
    message: String,
    records_count: usize,
    new_records_count: usize,
    latest_date: Option<NaiveDate>,
}

impl UpdateReport {
    fn new(symbol: &Symbol, data: &HistoricalData) -> Self {
        let (status, message) = match (data.fetched, data.failed.is_empty()) {
            (0, false) => ("error", "Failed to fetch data from API".to_string()),
            (0, true) => ("success", format!("{symbol} is up to date")),
            (n, true) => ("success", format!("Fetched {n} records for {symbol}")),
            (n, false) => (
                "partial",
                format!("Fetched {n} records for {symbol}, some ranges failed"),
            ),
        };
        Self {
            status,
            message,
            records_count: data.len(),
            new_records_count: data.fetched,
            latest_date: data.latest().map(|r| r.date),
        }
    }
}

#[derive(Serialize)]
struct ErrorReport {
    error: String,
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let config = match &cli.config {
        Some(path) => MarketConfig::from_path(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => MarketConfig::default(),
    };
    let store: Arc<dyn RecordStore> = Arc::new(
        SqliteStore::new(&cli.db)
            .with_context(|| format!("opening database {}", cli.db.display()))?,
    );
    tracing::debug!(db = %cli.db.display(), "Store opened");

    let market = MarketData::new(Arc::clone(&store), SourceRegistry::with_defaults(), config);

    match cli.command {
        Commands::Update {
            asset_type,
            symbol,
            force,
        } => {
            let historical = market.historical();
            let data = if force {
                historical.full_refetch(asset_type, &symbol).await?
            } else {
                historical
                    .full_backfill(asset_type, &symbol, FetchOptions::default())
                    .await?
            };

            let report = UpdateReport::new(&symbol, &data);
            print_json(&report)?;
            if report.status == "error" {
                std::process::exit(1);
            }
        }
        Commands::History {
            asset_type,
            symbol,
            from,
            to,
            refresh,
            table,
        } => {
            let range = DateRange::new(from, to)?;
            let cached = market
                .historical()
                .ensure_historical_data(asset_type, &symbol, range, FetchOptions { refresh })
                .await?;
            tracing::info!(
                cache = cached.status(),
                records = cached.value.len(),
                "History served"
            );

            if table {
                println!("{}", cached.value.to_frame()?);
            } else {
                print_json(&cached.value)?;
            }
        }
        Commands::Price { asset_type, symbol } => {
            match store.read_latest(asset_type, &symbol).await? {
                Some(record) => {
                    print_json(&PriceQuote::from_record(&record, DataOrigin::Database))?;
                }
                None => {
                    print_json(&ErrorReport {
                        error: format!("No data for {asset_type}:{symbol}"),
                    })?;
                    std::process::exit(1);
                }
            }
        }
        Commands::Batch { items, refresh } => {
            let results = market
                .batch()
                .fetch_batch(&items, FetchOptions { refresh })
                .await;
            print_json(&results)?;
        }
    }

    Ok(())
}
