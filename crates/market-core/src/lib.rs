#![doc = include_str!("../README.md")]
#![doc(issue_tracker_base_url = "https://github.com/factordynamics/market/issues/")]
#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]
#![warn(missing_docs)]
#![forbid(unsafe_code)]

//! Core traits and types for the market-data layer.
//!
//! This crate provides the foundational abstractions shared by every other crate:
//!
//! - [`AssetType`](asset::AssetType) and [`Market`](asset::Market) - What is tracked and where it trades
//! - [`MarketCalendar`](calendar::MarketCalendar) - Trading days and sessions per market
//! - [`Clock`](clock::Clock) - Injectable source of "now"
//! - [`RecordStore`](store::RecordStore) - Persistent store abstraction
//! - [`HistorySource`](source::HistorySource) / [`QuoteSource`](source::QuoteSource) - External sources

/// Asset types, markets and staleness rules.
pub mod asset;
/// Market calendar.
pub mod calendar;
/// Clock abstraction.
pub mod clock;
/// Error types for data operations.
pub mod error;
/// DataFrame export.
pub mod frame;
/// External source traits.
pub mod source;
/// Persistent store trait.
pub mod store;
/// Core data types (Symbol, DateRange, TimeSeriesRecord, etc.).
pub mod types;

// Re-export commonly used items at crate root
pub use asset::{AssetType, Market, Staleness};
pub use calendar::{MarketCalendar, Session};
pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{DataError, Result};
pub use frame::records_to_frame;
pub use source::{DataSource, HistorySource, QuoteSource};
pub use store::RecordStore;
pub use types::{
    DataOrigin, DateRange, FetchOptions, HistoricalData, LiveQuote, PriceQuote, Symbol,
    TimeSeriesRecord, TodayPrice, UpsertSummary,
};
