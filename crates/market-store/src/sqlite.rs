//! SQLite-backed store implementation.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use market_core::{
    AssetType, Clock, DataError, RecordStore, Result, Symbol, SystemClock, TimeSeriesRecord,
    TodayPrice, UpsertSummary,
};
use rusqlite::{Connection, OptionalExtension, Row, params};
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::{debug, instrument};

use crate::merge::{Merge, merge};

const SELECT_COLUMNS: &str =
    "asset_type, symbol, date, open, high, low, close, volume, adjusted_close, change_pct";

/// SQLite-backed time-series store.
///
/// One table keyed by `(asset_type, symbol, date)`. Each upsert runs in a
/// single transaction.
#[derive(Debug)]
pub struct SqliteStore {
    conn: Mutex<Connection>,
    clock: Arc<dyn Clock>,
}

impl SqliteStore {
    /// Open (or create) a store at the given path.
    ///
    /// # Errors
    /// Returns an error if the database cannot be opened or schema creation fails.
    pub fn new(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path).map_err(|e| DataError::Store(e.to_string()))?;
        Self::from_connection(conn)
    }

    /// Create an in-memory store.
    ///
    /// Useful for testing; data is lost when the store is dropped.
    ///
    /// # Errors
    /// Returns an error if schema creation fails.
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(|e| DataError::Store(e.to_string()))?;
        Self::from_connection(conn)
    }

    /// Stamp writes with `clock` instead of the system clock.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        let store = Self {
            conn: Mutex::new(conn),
            clock: Arc::new(SystemClock),
        };
        store.initialize_schema()?;
        Ok(store)
    }

    /// Initialize the database schema.
    fn initialize_schema(&self) -> Result<()> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| DataError::Store(e.to_string()))?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS time_series (
                asset_type TEXT NOT NULL,
                symbol TEXT NOT NULL,
                date TEXT NOT NULL,
                open REAL,
                high REAL,
                low REAL,
                close REAL NOT NULL,
                volume REAL,
                adjusted_close REAL,
                change_pct REAL,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (asset_type, symbol, date)
            )",
            [],
        )
        .map_err(|e| DataError::Store(e.to_string()))?;

        debug!("SQLite store schema initialized");
        Ok(())
    }
}

/// Column values of one row before conversion into domain types.
struct RawRow {
    asset_type: String,
    symbol: String,
    date: String,
    open: Option<f64>,
    high: Option<f64>,
    low: Option<f64>,
    close: f64,
    volume: Option<f64>,
    adjusted_close: Option<f64>,
    change_pct: Option<f64>,
}

impl RawRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            asset_type: row.get(0)?,
            symbol: row.get(1)?,
            date: row.get(2)?,
            open: row.get(3)?,
            high: row.get(4)?,
            low: row.get(5)?,
            close: row.get(6)?,
            volume: row.get(7)?,
            adjusted_close: row.get(8)?,
            change_pct: row.get(9)?,
        })
    }

    fn into_record(self) -> Result<TimeSeriesRecord> {
        Ok(TimeSeriesRecord {
            asset_type: self.asset_type.parse()?,
            symbol: Symbol::new(self.symbol),
            date: parse_date(&self.date)?,
            open: self.open,
            high: self.high,
            low: self.low,
            close: self.close,
            volume: self.volume,
            adjusted_close: self.adjusted_close,
            change_pct: self.change_pct,
        })
    }
}

fn parse_date(s: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .map_err(|e| DataError::Store(format!("Invalid stored date {s}: {e}")))
}

fn select_one(
    conn: &Connection,
    asset_type: AssetType,
    symbol: &Symbol,
    date: NaiveDate,
) -> Result<Option<TimeSeriesRecord>> {
    conn.query_row(
        &format!(
            "SELECT {SELECT_COLUMNS} FROM time_series
             WHERE asset_type = ?1 AND symbol = ?2 AND date = ?3"
        ),
        params![asset_type.as_str(), symbol.as_str(), date.to_string()],
        RawRow::from_row,
    )
    .optional()
    .map_err(|e| DataError::Store(e.to_string()))?
    .map(RawRow::into_record)
    .transpose()
}

#[async_trait]
impl RecordStore for SqliteStore {
    #[instrument(skip(self), fields(asset_type = %asset_type, symbol = %symbol))]
    async fn read_range(
        &self,
        asset_type: AssetType,
        symbol: &Symbol,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<TimeSeriesRecord>> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| DataError::Store(e.to_string()))?;

        let mut stmt = conn
            .prepare(&format!(
                "SELECT {SELECT_COLUMNS} FROM time_series
                 WHERE asset_type = ?1 AND symbol = ?2 AND date >= ?3 AND date <= ?4
                 ORDER BY date ASC"
            ))
            .map_err(|e| DataError::Store(e.to_string()))?;

        let rows = stmt
            .query_map(
                params![
                    asset_type.as_str(),
                    symbol.as_str(),
                    start.to_string(),
                    end.to_string()
                ],
                RawRow::from_row,
            )
            .map_err(|e| DataError::Store(e.to_string()))?;

        let mut records = Vec::new();
        for row in rows {
            let raw = row.map_err(|e| DataError::Store(e.to_string()))?;
            records.push(raw.into_record()?);
        }

        debug!("Read {} stored rows", records.len());
        Ok(records)
    }

    #[instrument(skip(self, records), fields(count = records.len()))]
    async fn upsert(&self, records: &[TimeSeriesRecord]) -> Result<UpsertSummary> {
        let updated_at = self.clock.now().to_rfc3339();
        let conn = self
            .conn
            .lock()
            .map_err(|e| DataError::Store(e.to_string()))?;
        let tx = conn
            .unchecked_transaction()
            .map_err(|e| DataError::Store(e.to_string()))?;

        let mut summary = UpsertSummary::default();
        for record in records {
            let stored = select_one(&tx, record.asset_type, &record.symbol, record.date)?;
            let row = match merge(stored.as_ref(), record) {
                Merge::Insert(row) => {
                    summary.inserted += 1;
                    row
                }
                Merge::Update(row) => {
                    summary.updated += 1;
                    row
                }
                Merge::Skip => {
                    tx.execute(
                        "UPDATE time_series SET updated_at = ?4
                         WHERE asset_type = ?1 AND symbol = ?2 AND date = ?3",
                        params![
                            record.asset_type.as_str(),
                            record.symbol.as_str(),
                            record.date.to_string(),
                            updated_at,
                        ],
                    )
                    .map_err(|e| DataError::Store(e.to_string()))?;
                    summary.skipped += 1;
                    continue;
                }
            };

            tx.execute(
                "INSERT OR REPLACE INTO time_series
                 (asset_type, symbol, date, open, high, low, close, volume,
                  adjusted_close, change_pct, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                params![
                    row.asset_type.as_str(),
                    row.symbol.as_str(),
                    row.date.to_string(),
                    row.open,
                    row.high,
                    row.low,
                    row.close,
                    row.volume,
                    row.adjusted_close,
                    row.change_pct,
                    updated_at,
                ],
            )
            .map_err(|e| DataError::Store(e.to_string()))?;
        }

        tx.commit().map_err(|e| DataError::Store(e.to_string()))?;

        debug!(
            inserted = summary.inserted,
            updated = summary.updated,
            skipped = summary.skipped,
            "Upserted rows"
        );
        Ok(summary)
    }

    #[instrument(skip(self), fields(asset_type = %asset_type, symbol = %symbol))]
    async fn read_latest(
        &self,
        asset_type: AssetType,
        symbol: &Symbol,
    ) -> Result<Option<TimeSeriesRecord>> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| DataError::Store(e.to_string()))?;

        conn.query_row(
            &format!(
                "SELECT {SELECT_COLUMNS} FROM time_series
                 WHERE asset_type = ?1 AND symbol = ?2
                 ORDER BY date DESC LIMIT 1"
            ),
            params![asset_type.as_str(), symbol.as_str()],
            RawRow::from_row,
        )
        .optional()
        .map_err(|e| DataError::Store(e.to_string()))?
        .map(RawRow::into_record)
        .transpose()
    }

    #[instrument(skip(self), fields(asset_type = %asset_type, symbol = %symbol))]
    async fn read_today(
        &self,
        asset_type: AssetType,
        symbol: &Symbol,
        today: NaiveDate,
    ) -> Result<Option<TodayPrice>> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| DataError::Store(e.to_string()))?;

        let row = conn
            .query_row(
                "SELECT close, updated_at FROM time_series
                 WHERE asset_type = ?1 AND symbol = ?2 AND date = ?3",
                params![asset_type.as_str(), symbol.as_str(), today.to_string()],
                |row| Ok((row.get::<_, f64>(0)?, row.get::<_, String>(1)?)),
            )
            .optional()
            .map_err(|e| DataError::Store(e.to_string()))?;

        row.map(|(price, updated_at)| {
            let updated_at = DateTime::parse_from_rfc3339(&updated_at)
                .map_err(|e| DataError::Store(e.to_string()))?
                .with_timezone(&Utc);
            Ok(TodayPrice { price, updated_at })
        })
        .transpose()
    }
}
