//! Core data types for the market-data layer.
//!
//! This module defines the fundamental data structures:
//!
//! - [`Symbol`] - Trading symbol/ticker
//! - [`DateRange`] - Inclusive calendar-day range
//! - [`TimeSeriesRecord`] - One daily row keyed by (asset type, symbol, date)
//! - [`PriceQuote`] - A price tagged with the [`DataOrigin`] it was served from
//! - [`LiveQuote`] / [`TodayPrice`] - Source and store views of the current price
//! - [`UpsertSummary`] - Outcome of an idempotent upsert
//! - [`FetchOptions`] - Per-call options threaded through every layer
//! - [`HistoricalData`] - Result of a gap-filling historical read

use chrono::{DateTime, NaiveDate, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::asset::AssetType;
use crate::error::DataError;

/// A trading symbol/ticker.
///
/// Symbols are automatically uppercased on creation.
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Symbol(String);

impl Symbol {
    /// Creates a new symbol from a string, converting to uppercase.
    #[must_use]
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into().trim().to_uppercase())
    }

    /// Returns the symbol as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Symbol {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self::new(s))
    }
}

impl From<&str> for Symbol {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for Symbol {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

/// Inclusive range of calendar days. `start <= end` always holds.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DateRange {
    start: NaiveDate,
    end: NaiveDate,
}

impl DateRange {
    /// Creates a range, rejecting `start > end`.
    pub fn new(start: NaiveDate, end: NaiveDate) -> crate::Result<Self> {
        if start > end {
            return Err(DataError::InvalidParameter(format!(
                "Start date {start} is after end date {end}"
            )));
        }
        Ok(Self { start, end })
    }

    /// Creates a one-day range.
    #[must_use]
    pub const fn single(date: NaiveDate) -> Self {
        Self {
            start: date,
            end: date,
        }
    }

    /// Creates the smallest range containing both dates, in either order.
    #[must_use]
    pub fn spanning(a: NaiveDate, b: NaiveDate) -> Self {
        Self {
            start: a.min(b),
            end: a.max(b),
        }
    }

    /// First day of the range.
    #[must_use]
    pub const fn start(&self) -> NaiveDate {
        self.start
    }

    /// Last day of the range.
    #[must_use]
    pub const fn end(&self) -> NaiveDate {
        self.end
    }

    /// Number of calendar days covered.
    #[must_use]
    pub fn num_days(&self) -> usize {
        usize::try_from((self.end - self.start).num_days() + 1).unwrap_or(0)
    }

    /// Returns true if `date` falls inside the range.
    #[must_use]
    pub fn contains(&self, date: NaiveDate) -> bool {
        self.start <= date && date <= self.end
    }

    /// Returns the range cut off at `last`, or `None` if it starts after `last`.
    #[must_use]
    pub fn clamp_end(&self, last: NaiveDate) -> Option<Self> {
        (self.start <= last).then(|| Self {
            start: self.start,
            end: self.end.min(last),
        })
    }

    /// Iterates over every day of the range in ascending order.
    pub fn days(&self) -> impl Iterator<Item = NaiveDate> + use<> {
        let end = self.end;
        self.start
            .iter_days()
            .take_while(move |d| *d <= end)
    }
}

impl fmt::Display for DateRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}..={}", self.start, self.end)
    }
}

/// One daily row of a time series.
///
/// The natural key is `(asset_type, symbol, date)`. Only `close` is required;
/// liquidity-flow rows store their net value there.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TimeSeriesRecord {
    /// Asset class.
    pub asset_type: AssetType,
    /// Instrument symbol.
    pub symbol: Symbol,
    /// Trading day in the market's timezone.
    pub date: NaiveDate,
    /// Opening price.
    pub open: Option<f64>,
    /// Highest price of the day.
    pub high: Option<f64>,
    /// Lowest price of the day.
    pub low: Option<f64>,
    /// Closing (or latest) price.
    pub close: f64,
    /// Traded volume.
    pub volume: Option<f64>,
    /// Split/dividend adjusted close.
    pub adjusted_close: Option<f64>,
    /// Day-over-day change in percent, when the source reports it.
    pub change_pct: Option<f64>,
}

impl TimeSeriesRecord {
    /// Creates a record with only a closing value.
    #[must_use]
    pub fn new(asset_type: AssetType, symbol: Symbol, date: NaiveDate, close: f64) -> Self {
        Self {
            asset_type,
            symbol,
            date,
            open: None,
            high: None,
            low: None,
            close,
            volume: None,
            adjusted_close: None,
            change_pct: None,
        }
    }

    /// Sets open, high and low.
    #[must_use]
    pub const fn with_ohl(mut self, open: f64, high: f64, low: f64) -> Self {
        self.open = Some(open);
        self.high = Some(high);
        self.low = Some(low);
        self
    }

    /// Sets the traded volume.
    #[must_use]
    pub const fn with_volume(mut self, volume: f64) -> Self {
        self.volume = Some(volume);
        self
    }

    /// Sets the adjusted close.
    #[must_use]
    pub const fn with_adjusted_close(mut self, adjusted_close: f64) -> Self {
        self.adjusted_close = Some(adjusted_close);
        self
    }

    /// Returns true if `other` has the same natural key.
    #[must_use]
    pub fn same_key(&self, other: &Self) -> bool {
        self.asset_type == other.asset_type
            && self.symbol == other.symbol
            && self.date == other.date
    }
}

/// Where a served value came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataOrigin {
    /// Fresh data read from the persistent store.
    Database,
    /// Live data from an external source.
    Api,
    /// Older stored data served because the live fetch failed.
    DatabaseFallback,
}

impl fmt::Display for DataOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Database => "database",
            Self::Api => "api",
            Self::DatabaseFallback => "database_fallback",
        })
    }
}

/// A price together with its provenance.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PriceQuote {
    /// Asset class.
    pub asset_type: AssetType,
    /// Instrument symbol.
    pub symbol: Symbol,
    /// Price.
    pub price: f64,
    /// Trading day the price belongs to.
    pub date: NaiveDate,
    /// Provenance tag.
    pub source: DataOrigin,
}

impl PriceQuote {
    /// Builds a quote from a stored record.
    #[must_use]
    pub fn from_record(record: &TimeSeriesRecord, source: DataOrigin) -> Self {
        Self {
            asset_type: record.asset_type,
            symbol: record.symbol.clone(),
            price: record.close,
            date: record.date,
            source,
        }
    }
}

/// A live price as reported by a quote source.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LiveQuote {
    /// Price.
    pub price: f64,
    /// Trading day the price belongs to.
    pub date: NaiveDate,
    /// When the source observed the price.
    pub as_of: DateTime<Utc>,
}

/// Today's stored price and when it was written.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TodayPrice {
    /// Stored close.
    pub price: f64,
    /// Time of the last write.
    pub updated_at: DateTime<Utc>,
}

impl TodayPrice {
    /// Age of the row at `now`.
    #[must_use]
    pub fn age(&self, now: DateTime<Utc>) -> std::time::Duration {
        (now - self.updated_at)
            .max(TimeDelta::zero())
            .to_std()
            .unwrap_or_default()
    }
}

/// Outcome of an upsert.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpsertSummary {
    /// Rows created.
    pub inserted: usize,
    /// Existing rows replaced with revised values.
    pub updated: usize,
    /// Incoming rows identical to the stored row.
    pub skipped: usize,
}

impl UpsertSummary {
    /// Rows that changed the store.
    #[must_use]
    pub const fn written(&self) -> usize {
        self.inserted + self.updated
    }
}

impl std::ops::AddAssign for UpsertSummary {
    fn add_assign(&mut self, rhs: Self) {
        self.inserted += rhs.inserted;
        self.updated += rhs.updated;
        self.skipped += rhs.skipped;
    }
}

/// Per-call options.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchOptions {
    /// Bypass cached reads and revalidate the most recent trading day.
    pub refresh: bool,
}

impl FetchOptions {
    /// Options with `refresh` set.
    #[must_use]
    pub const fn refresh() -> Self {
        Self { refresh: true }
    }
}

/// Result of a gap-filling historical read.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HistoricalData {
    /// Asset class.
    pub asset_type: AssetType,
    /// Instrument symbol.
    pub symbol: Symbol,
    /// Records in ascending date order.
    pub records: Vec<TimeSeriesRecord>,
    /// Ranges fetched from a source and stored by this call.
    pub filled_gaps: Vec<DateRange>,
    /// Ranges that are still missing after the best-effort fetch.
    pub unfilled: Vec<DateRange>,
    /// Ranges whose fetch failed or timed out; a later call retries them.
    pub failed: Vec<DateRange>,
    /// Number of records fetched from the source.
    pub fetched: usize,
    /// `Api` when anything was fetched, `Database` otherwise.
    pub source: DataOrigin,
}

impl HistoricalData {
    /// Result served entirely from the store.
    #[must_use]
    pub const fn from_store(
        asset_type: AssetType,
        symbol: Symbol,
        records: Vec<TimeSeriesRecord>,
    ) -> Self {
        Self {
            asset_type,
            symbol,
            records,
            filled_gaps: Vec::new(),
            unfilled: Vec::new(),
            failed: Vec::new(),
            fetched: 0,
            source: DataOrigin::Database,
        }
    }

    /// Number of records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Returns true if there are no records.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Most recent record.
    #[must_use]
    pub fn latest(&self) -> Option<&TimeSeriesRecord> {
        self.records.last()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn test_symbol_is_uppercased() {
        assert_eq!(Symbol::new(" ogdc ").as_str(), "OGDC");
        assert_eq!(Symbol::from("btc"), Symbol::new("BTC"));
    }

    #[test]
    fn test_date_range_rejects_inverted_bounds() {
        assert!(DateRange::new(date(2024, 1, 10), date(2024, 1, 1)).is_err());
        let range = DateRange::new(date(2024, 1, 1), date(2024, 1, 10)).unwrap();
        assert_eq!(range.num_days(), 10);
        assert_eq!(range.days().count(), 10);
        assert!(range.contains(date(2024, 1, 10)));
        assert!(!range.contains(date(2024, 1, 11)));
    }

    #[test]
    fn test_date_range_clamp_end() {
        let range = DateRange::new(date(2024, 1, 1), date(2024, 1, 10)).unwrap();
        assert_eq!(
            range.clamp_end(date(2024, 1, 5)),
            Some(DateRange::new(date(2024, 1, 1), date(2024, 1, 5)).unwrap())
        );
        assert_eq!(range.clamp_end(date(2023, 12, 31)), None);
        assert_eq!(range.clamp_end(date(2024, 2, 1)), Some(range));
    }

    #[test]
    fn test_origin_serializes_snake_case() {
        let json = serde_json::to_string(&DataOrigin::DatabaseFallback).unwrap();
        assert_eq!(json, "\"database_fallback\"");
        assert_eq!(DataOrigin::Api.to_string(), "api");
    }

    #[test]
    fn test_today_price_age_never_negative() {
        let now = Utc::now();
        let row = TodayPrice {
            price: 1.0,
            updated_at: now + TimeDelta::minutes(5),
        };
        assert_eq!(row.age(now), std::time::Duration::ZERO);
    }

    #[test]
    fn test_upsert_summary_accumulates() {
        let mut total = UpsertSummary::default();
        total += UpsertSummary {
            inserted: 2,
            updated: 1,
            skipped: 0,
        };
        total += UpsertSummary {
            inserted: 0,
            updated: 0,
            skipped: 3,
        };
        assert_eq!(total.written(), 3);
        assert_eq!(total.skipped, 3);
    }
}
