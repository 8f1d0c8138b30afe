//! DataFrame export of time-series records.

use chrono::NaiveDate;
use polars::prelude::*;

use crate::error::{DataError, Result};
use crate::types::{HistoricalData, TimeSeriesRecord};

/// Converts records into a DataFrame with columns
/// `symbol, date, open, high, low, close, volume, adjusted_close`.
pub fn records_to_frame(records: &[TimeSeriesRecord]) -> Result<DataFrame> {
    let epoch = NaiveDate::default();

    let symbols: Vec<&str> = records.iter().map(|r| r.symbol.as_str()).collect();
    let dates: Vec<i32> = records
        .iter()
        .map(|r| i32::try_from((r.date - epoch).num_days()).unwrap_or(i32::MAX))
        .collect();
    let opens: Vec<Option<f64>> = records.iter().map(|r| r.open).collect();
    let highs: Vec<Option<f64>> = records.iter().map(|r| r.high).collect();
    let lows: Vec<Option<f64>> = records.iter().map(|r| r.low).collect();
    let closes: Vec<f64> = records.iter().map(|r| r.close).collect();
    let volumes: Vec<Option<f64>> = records.iter().map(|r| r.volume).collect();
    let adj_closes: Vec<Option<f64>> = records
        .iter()
        .map(|r| r.adjusted_close.or(Some(r.close)))
        .collect();

    let date_col = Column::new("date".into(), dates)
        .cast(&DataType::Date)
        .map_err(|e| DataError::Other(e.to_string()))?;

    DataFrame::new(vec![
        Column::new("symbol".into(), symbols),
        date_col,
        Column::new("open".into(), opens),
        Column::new("high".into(), highs),
        Column::new("low".into(), lows),
        Column::new("close".into(), closes),
        Column::new("volume".into(), volumes),
        Column::new("adjusted_close".into(), adj_closes),
    ])
    .map_err(|e| DataError::Other(e.to_string()))
}

impl HistoricalData {
    /// Exports the records as a DataFrame.
    pub fn to_frame(&self) -> Result<DataFrame> {
        records_to_frame(&self.records)
    }
}
