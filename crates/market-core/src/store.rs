//! Persistent store abstraction.
//!
//! A [`RecordStore`] holds [`TimeSeriesRecord`]s addressed by their natural key
//! `(asset_type, symbol, date)`. Upsert is the only mutation path; rows are
//! never deleted.

use async_trait::async_trait;
use chrono::NaiveDate;
use std::fmt::Debug;

use crate::asset::AssetType;
use crate::error::Result;
use crate::types::{Symbol, TimeSeriesRecord, TodayPrice, UpsertSummary};

/// Record-level persistent store.
///
/// Every call is atomic: an upsert either applies all of its rows or none.
#[async_trait]
pub trait RecordStore: Send + Sync + Debug {
    /// Reads the records of one series within `start..=end`, ascending by date.
    async fn read_range(
        &self,
        asset_type: AssetType,
        symbol: &Symbol,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<TimeSeriesRecord>>;

    /// Inserts new rows and replaces rows whose values changed.
    ///
    /// Re-applying the same records leaves the values alone and is reported
    /// as `skipped`; the row's write time still moves to now, so a confirmed
    /// price reads as fresh.
    async fn upsert(&self, records: &[TimeSeriesRecord]) -> Result<UpsertSummary>;

    /// Returns the most recent record of a series.
    async fn read_latest(
        &self,
        asset_type: AssetType,
        symbol: &Symbol,
    ) -> Result<Option<TimeSeriesRecord>>;

    /// Returns the row for `today` with the time it was last written.
    async fn read_today(
        &self,
        asset_type: AssetType,
        symbol: &Symbol,
        today: NaiveDate,
    ) -> Result<Option<TodayPrice>>;
}
