//! In-memory store implementation.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use market_core::{
    AssetType, Clock, RecordStore, Result, Symbol, SystemClock, TimeSeriesRecord, TodayPrice,
    UpsertSummary,
};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, instrument};

use crate::merge::{Merge, merge};

type RowKey = (AssetType, Symbol, NaiveDate);

#[derive(Debug, Clone)]
struct StoredRow {
    record: TimeSeriesRecord,
    updated_at: DateTime<Utc>,
}

/// In-memory store for tests and ephemeral use.
///
/// Rows live in a `RwLock`-protected `BTreeMap` ordered by natural key and
/// are lost when the store is dropped. An upsert holds the write lock for
/// its whole batch, so it applies atomically.
#[derive(Debug)]
pub struct MemoryStore {
    rows: RwLock<BTreeMap<RowKey, StoredRow>>,
    clock: Arc<dyn Clock>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// Create a new empty store stamping writes with the system clock.
    #[must_use]
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Create a new empty store stamping writes with `clock`.
    #[must_use]
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            rows: RwLock::new(BTreeMap::new()),
            clock,
        }
    }

    /// Number of stored rows.
    pub async fn len(&self) -> usize {
        self.rows.read().await.len()
    }

    /// Returns true if no rows are stored.
    pub async fn is_empty(&self) -> bool {
        self.rows.read().await.is_empty()
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    #[instrument(skip(self), fields(asset_type = %asset_type, symbol = %symbol))]
    async fn read_range(
        &self,
        asset_type: AssetType,
        symbol: &Symbol,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<TimeSeriesRecord>> {
        if start > end {
            return Ok(Vec::new());
        }
        let rows = self.rows.read().await;
        let records: Vec<TimeSeriesRecord> = rows
            .range((asset_type, symbol.clone(), start)..=(asset_type, symbol.clone(), end))
            .map(|(_, row)| row.record.clone())
            .collect();
        debug!("Read {} stored rows", records.len());
        Ok(records)
    }

    #[instrument(skip(self, records), fields(count = records.len()))]
    async fn upsert(&self, records: &[TimeSeriesRecord]) -> Result<UpsertSummary> {
        let now = self.clock.now();
        let mut rows = self.rows.write().await;
        let mut summary = UpsertSummary::default();

        for record in records {
            let key = (record.asset_type, record.symbol.clone(), record.date);
            match merge(rows.get(&key).map(|row| &row.record), record) {
                Merge::Insert(record) => {
                    rows.insert(key, StoredRow { record, updated_at: now });
                    summary.inserted += 1;
                }
                Merge::Update(record) => {
                    rows.insert(key, StoredRow { record, updated_at: now });
                    summary.updated += 1;
                }
                Merge::Skip => {
                    if let Some(row) = rows.get_mut(&key) {
                        row.updated_at = now;
                    }
                    summary.skipped += 1;
                }
            }
        }

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
        let rows = self.rows.read().await;
        Ok(rows
            .range(
                (asset_type, symbol.clone(), NaiveDate::MIN)
                    ..=(asset_type, symbol.clone(), NaiveDate::MAX),
            )
            .next_back()
            .map(|(_, row)| row.record.clone()))
    }

    #[instrument(skip(self), fields(asset_type = %asset_type, symbol = %symbol))]
    async fn read_today(
        &self,
        asset_type: AssetType,
        symbol: &Symbol,
        today: NaiveDate,
    ) -> Result<Option<TodayPrice>> {
        let rows = self.rows.read().await;
        Ok(rows
            .get(&(asset_type, symbol.clone(), today))
            .map(|row| TodayPrice {
                price: row.record.close,
                updated_at: row.updated_at,
            }))
    }
}
