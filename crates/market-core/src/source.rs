//! External source traits.
//!
//! This module defines the traits implemented by data-source adapters:
//!
//! - [`DataSource`] - Base trait with metadata shared by all sources
//! - [`HistorySource`] - Daily history per day or per date range
//! - [`QuoteSource`] - Live prices, optionally many in one call

use async_trait::async_trait;
use chrono::NaiveDate;
use std::collections::HashMap;
use std::fmt::Debug;

use crate::asset::AssetType;
use crate::error::{DataError, Result};
use crate::types::{DateRange, LiveQuote, Symbol, TimeSeriesRecord};

/// Base trait for all external sources.
pub trait DataSource: Send + Sync + Debug {
    /// Returns the name of this source (e.g., "Binance").
    fn name(&self) -> &str;

    /// Returns a description of this source.
    fn description(&self) -> &str;

    /// Returns the asset types this source serves.
    fn asset_types(&self) -> &[AssetType];

    /// Returns true if the source serves `asset_type`.
    fn supports(&self, asset_type: AssetType) -> bool {
        self.asset_types().contains(&asset_type)
    }
}

/// Source of daily history.
#[async_trait]
pub trait HistorySource: DataSource {
    /// Fetches the records of a single trading day.
    ///
    /// An empty result means the source has no row for that day.
    async fn fetch_day(
        &self,
        asset_type: AssetType,
        symbol: &Symbol,
        date: NaiveDate,
    ) -> Result<Vec<TimeSeriesRecord>>;

    /// Fetches the records inside `range`.
    ///
    /// Default implementation calls `fetch_day` sequentially for each day.
    /// Days the source does not know are skipped; any other error aborts.
    async fn fetch_range(
        &self,
        asset_type: AssetType,
        symbol: &Symbol,
        range: DateRange,
    ) -> Result<Vec<TimeSeriesRecord>> {
        let mut records = Vec::with_capacity(range.num_days());

        for date in range.days() {
            match self.fetch_day(asset_type, symbol, date).await {
                Ok(mut day) => records.append(&mut day),
                Err(DataError::SymbolNotFound(_) | DataError::DataNotAvailable { .. }) => continue,
                Err(e) => return Err(e),
            }
        }

        Ok(records)
    }

    /// Largest number of days one `fetch_range` call should cover.
    fn max_days_per_request(&self) -> usize {
        1
    }

    /// Earliest date the source has data for, if known.
    fn earliest_date(&self, _asset_type: AssetType) -> Option<NaiveDate> {
        None
    }
}

/// Source of live prices.
#[async_trait]
pub trait QuoteSource: DataSource {
    /// Fetches the current price of one symbol, `None` if the source has none.
    async fn fetch_quote(&self, asset_type: AssetType, symbol: &Symbol)
    -> Result<Option<LiveQuote>>;

    /// Returns true if `fetch_bulk` is implemented.
    fn supports_bulk(&self) -> bool {
        false
    }

    /// Fetches current prices for many symbols in one call.
    ///
    /// Symbols the source does not know are absent from the map.
    async fn fetch_bulk(
        &self,
        asset_type: AssetType,
        symbols: &[Symbol],
    ) -> Result<HashMap<Symbol, f64>> {
        let _ = symbols;
        Err(DataError::NotSupported(format!(
            "{} has no bulk endpoint for {asset_type}",
            self.name()
        )))
    }
}
