#![doc = include_str!("../README.md")]
#![doc(issue_tracker_base_url = "https://github.com/factordynamics/market/issues/")]
#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]
#![warn(missing_docs)]
#![forbid(unsafe_code)]

//! Historical market-data acquisition and caching.
//!
//! This crate ties the store, cache and sources together. It re-exports the
//! core types and the bundled adapters, and provides:
//!
//! - [`HistoricalDataService`] - Gap detection and paced backfill
//! - [`BatchPriceService`] - Batch and single current prices with fallback
//! - [`DailyCheckGate`] - Once-per-day markers
//! - [`SourceRegistry`] - Sources per asset type
//! - [`MarketData`] - All of the above wired around one cache
//!
//! # Features
//!
//! - `binance` - Binance crypto source
//! - `stockanalysis` - StockAnalysis PSX source
//! - `investing` - Investing.com S&P 500 source
//! - `sqlite` - SQLite-backed persistent store
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use market::{AssetType, FetchOptions, MarketConfig, MarketData, MemoryStore, PriceRequest, SourceRegistry};
//!
//! #[tokio::main]
//! async fn main() {
//!     let market = MarketData::new(
//!         Arc::new(MemoryStore::new()),
//!         SourceRegistry::with_defaults(),
//!         MarketConfig::default(),
//!     );
//!
//!     let prices = market
//!         .batch()
//!         .fetch_batch(&[PriceRequest::new(AssetType::Crypto, "BTC")], FetchOptions::default())
//!         .await;
//!     println!("{}", serde_json::to_string_pretty(&prices).unwrap());
//! }
//! ```

// Core types and traits
pub use market_core::*;

// Cache
pub use market_cache::{
    CacheStore, Cached, TtlConfig, TtlContext, TtlDecision, TtlPolicy, cache_key, range_key,
};

// Stores
pub use market_store::MemoryStore;
#[cfg(feature = "sqlite")]
pub use market_store::SqliteStore;

// Sources
#[cfg(feature = "binance")]
pub use market_binance::BinanceProvider;
#[cfg(feature = "investing")]
pub use market_investing::InvestingProvider;
#[cfg(feature = "stockanalysis")]
pub use market_stockanalysis::StockAnalysisProvider;

mod batch;
mod config;
mod daily;
pub mod gaps;
mod historical;
mod registry;
mod service;

pub use batch::{BatchPriceService, PriceOutcome, PriceRequest};
pub use config::{BackfillConfig, BatchConfig, MarketConfig};
pub use daily::DailyCheckGate;
pub use gaps::FetchChunk;
pub use historical::HistoricalDataService;
pub use registry::SourceRegistry;
pub use service::MarketData;
