#![doc = include_str!("../README.md")]
#![doc(issue_tracker_base_url = "https://github.com/factordynamics/market/issues/")]
#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]
#![warn(missing_docs)]
#![forbid(unsafe_code)]

//! StockAnalysis data source for Pakistan Stock Exchange listings.
//!
//! This crate provides a source for PSX equities and the KSE-100 index backed
//! by the history endpoint of stockanalysis.com. One request returns the full
//! daily history of a ticker; callers receive the slice they asked for.
//!
//! # Example
//!
//! ```no_run
//! use market_stockanalysis::StockAnalysisProvider;
//! use market_core::{AssetType, QuoteSource, Symbol};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let provider = StockAnalysisProvider::new();
//!
//!     if let Some(quote) = provider
//!         .fetch_quote(AssetType::PkEquity, &Symbol::new("OGDC"))
//!         .await?
//!     {
//!         println!("OGDC closed at {} on {}", quote.price, quote.date);
//!     }
//!
//!     Ok(())
//! }
//! ```

use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use market_core::{
    AssetType, DataError, DataSource, DateRange, HistorySource, LiveQuote, QuoteSource, Result,
    Symbol, TimeSeriesRecord,
};
use reqwest::header::{ACCEPT, HeaderMap, HeaderValue, REFERER};
use serde::Deserialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio::time::sleep;
use tracing::{debug, instrument};

/// StockAnalysis API base URL.
const API_BASE_URL: &str = "https://stockanalysis.com";

/// Default minimum interval between requests.
const DEFAULT_RATE_LIMIT: Duration = Duration::from_millis(500);

/// User agent for HTTP requests.
const USER_AGENT: &str = "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/138.0.0.0 Safari/537.36";

const PROVIDER: &str = "StockAnalysis";

/// Rate limiter keeping a minimum interval between requests.
#[derive(Debug)]
struct RateLimiter {
    last_request: Option<Instant>,
    min_interval: Duration,
}

impl RateLimiter {
    const fn new(min_interval: Duration) -> Self {
        Self {
            last_request: None,
            min_interval,
        }
    }

    async fn wait(&mut self) {
        if let Some(last) = self.last_request {
            let elapsed = last.elapsed();
            if elapsed < self.min_interval {
                sleep(self.min_interval - elapsed).await;
            }
        }
        self.last_request = Some(Instant::now());
    }
}

/// StockAnalysis data source.
///
/// Serves [`AssetType::PkEquity`] and [`AssetType::Kse100`].
#[derive(Debug)]
pub struct StockAnalysisProvider {
    client: reqwest::Client,
    base_url: String,
    rate_limiter: Arc<Mutex<RateLimiter>>,
}

impl StockAnalysisProvider {
    /// Create a new source with default settings.
    #[must_use]
    pub fn new() -> Self {
        Self::with_rate_limit(DEFAULT_RATE_LIMIT)
    }

    /// Create a new source with a custom HTTP client.
    #[must_use]
    pub fn with_client(client: reqwest::Client) -> Self {
        Self {
            client,
            base_url: API_BASE_URL.to_string(),
            rate_limiter: Arc::new(Mutex::new(RateLimiter::new(DEFAULT_RATE_LIMIT))),
        }
    }

    /// Create a new source with a custom minimum interval between requests.
    #[must_use]
    pub fn with_rate_limit(min_interval: Duration) -> Self {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("*/*"));
        headers.insert(REFERER, HeaderValue::from_static("https://stockanalysis.com/"));

        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .default_headers(headers)
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        Self {
            client,
            base_url: API_BASE_URL.to_string(),
            rate_limiter: Arc::new(Mutex::new(RateLimiter::new(min_interval))),
        }
    }

    /// Point the source at another host (tests).
    #[must_use]
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    /// Fetch the full daily history of a ticker, ascending by date.
    #[instrument(skip(self), fields(symbol = %symbol))]
    pub async fn fetch_history(
        &self,
        asset_type: AssetType,
        symbol: &Symbol,
    ) -> Result<Vec<TimeSeriesRecord>> {
        ensure_supported(asset_type)?;
        self.rate_limiter.lock().await.wait().await;

        let url = format!("{}/api/symbol/a/PSX-{}/history", self.base_url, symbol.as_str());
        debug!("Fetching history: {}", url);

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| DataError::Network(e.to_string()))?;

        if response.status() == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(DataError::RateLimited {
                provider: PROVIDER.to_string(),
                retry_after: Some(Duration::from_secs(60)),
            });
        }

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(DataError::SymbolNotFound(symbol.to_string()));
        }

        if !response.status().is_success() {
            return Err(DataError::Network(format!(
                "HTTP {} for {}",
                response.status(),
                symbol
            )));
        }

        let body: HistoryResponse = response
            .json()
            .await
            .map_err(|e| DataError::Parse(e.to_string()))?;

        let records = parse_history(asset_type, symbol, body)?;
        debug!("Fetched {} rows", records.len());
        Ok(records)
    }
}

impl Default for StockAnalysisProvider {
    fn default() -> Self {
        Self::new()
    }
}

fn ensure_supported(asset_type: AssetType) -> Result<()> {
    match asset_type {
        AssetType::PkEquity | AssetType::Kse100 => Ok(()),
        other => Err(DataError::NotSupported(format!(
            "{PROVIDER} does not serve {other}"
        ))),
    }
}

/// Convert an API response into records sorted by date.
fn parse_history(
    asset_type: AssetType,
    symbol: &Symbol,
    body: HistoryResponse,
) -> Result<Vec<TimeSeriesRecord>> {
    let rows = match body {
        HistoryResponse::Rows(rows) => rows,
        HistoryResponse::Wrapped {
            data: Some(rows), ..
        } => rows,
        HistoryResponse::Wrapped { status, data: None } => {
            return Err(DataError::Other(format!(
                "{PROVIDER} returned status {} for {symbol}",
                status.as_deref().unwrap_or("unknown")
            )));
        }
    };

    let mut records = Vec::with_capacity(rows.len());
    for row in rows {
        // Rows without a close carry no price.
        let Some(close) = row.c else {
            continue;
        };
        let date = parse_date(&row.t)?;
        records.push(TimeSeriesRecord {
            asset_type,
            symbol: symbol.clone(),
            date,
            open: row.o,
            high: row.h,
            low: row.l,
            close,
            volume: row.v,
            adjusted_close: row.a,
            change_pct: row.ch,
        });
    }

    records.sort_by_key(|r| r.date);
    records.dedup_by_key(|r| r.date);
    Ok(records)
}

/// Dates come as `YYYY-MM-DD`, sometimes with a time suffix.
fn parse_date(s: &str) -> Result<NaiveDate> {
    let day = s.get(..10).unwrap_or(s);
    NaiveDate::parse_from_str(day, "%Y-%m-%d")
        .map_err(|e| DataError::Parse(format!("Invalid date {s}: {e}")))
}

impl DataSource for StockAnalysisProvider {
    fn name(&self) -> &str {
        PROVIDER
    }

    fn description(&self) -> &str {
        "stockanalysis.com daily history for Pakistan Stock Exchange listings"
    }

    fn asset_types(&self) -> &[AssetType] {
        &[AssetType::PkEquity, AssetType::Kse100]
    }
}

#[async_trait]
impl HistorySource for StockAnalysisProvider {
    async fn fetch_day(
        &self,
        asset_type: AssetType,
        symbol: &Symbol,
        date: NaiveDate,
    ) -> Result<Vec<TimeSeriesRecord>> {
        self.fetch_range(asset_type, symbol, DateRange::single(date))
            .await
    }

    async fn fetch_range(
        &self,
        asset_type: AssetType,
        symbol: &Symbol,
        range: DateRange,
    ) -> Result<Vec<TimeSeriesRecord>> {
        let mut records = self.fetch_history(asset_type, symbol).await?;
        records.retain(|r| range.contains(r.date));
        Ok(records)
    }

    /// The endpoint always returns the whole history.
    fn max_days_per_request(&self) -> usize {
        usize::MAX
    }
}

#[async_trait]
impl QuoteSource for StockAnalysisProvider {
    async fn fetch_quote(
        &self,
        asset_type: AssetType,
        symbol: &Symbol,
    ) -> Result<Option<LiveQuote>> {
        let history = self.fetch_history(asset_type, symbol).await?;
        Ok(history.last().map(|latest| LiveQuote {
            price: latest.close,
            date: latest.date,
            as_of: Utc::now(),
        }))
    }
}

// ============================================================================
// StockAnalysis API Response Types
// ============================================================================

/// History response: either a bare array or `{status, data}`.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum HistoryResponse {
    Rows(Vec<HistoryRow>),
    Wrapped {
        status: Option<String>,
        data: Option<Vec<HistoryRow>>,
    },
}

#[derive(Debug, Deserialize)]
struct HistoryRow {
    t: String,
    o: Option<f64>,
    h: Option<f64>,
    l: Option<f64>,
    c: Option<f64>,
    a: Option<f64>,
    v: Option<f64>,
    ch: Option<f64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    const WRAPPED: &str = r#"{
        "status": "success",
        "data": [
            {"t": "2024-01-09", "o": 121.0, "h": 123.5, "l": 120.1, "c": 122.8, "a": 122.8, "v": 5300000, "ch": 1.49},
            {"t": "2024-01-08", "o": 119.0, "h": 121.2, "l": 118.7, "c": 121.0, "a": 121.0, "v": 4100000, "ch": -0.41},
            {"t": "2024-01-05", "c": null}
        ]
    }"#;

    fn provider(server: &mockito::Server) -> StockAnalysisProvider {
        StockAnalysisProvider::with_rate_limit(Duration::ZERO).with_base_url(server.url())
    }

    #[test]
    fn test_parse_wrapped_and_bare_responses() {
        let body: HistoryResponse = serde_json::from_str(WRAPPED).unwrap();
        let records = parse_history(AssetType::PkEquity, &Symbol::new("OGDC"), body).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].date, NaiveDate::from_ymd_opt(2024, 1, 8).unwrap());
        assert_eq!(records[1].change_pct, Some(1.49));
        assert_eq!(records[1].volume, Some(5_300_000.0));

        let bare: HistoryResponse =
            serde_json::from_str(r#"[{"t": "2024-01-08T00:00:00", "c": 4.5}]"#).unwrap();
        let records = parse_history(AssetType::Kse100, &Symbol::new("KSE100"), bare).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].open, None);
    }

    #[test]
    fn test_error_status_is_reported() {
        let body: HistoryResponse = serde_json::from_str(r#"{"status": "error"}"#).unwrap();
        let err = parse_history(AssetType::PkEquity, &Symbol::new("OGDC"), body).unwrap_err();
        assert!(err.to_string().contains("status error"));
    }

    #[tokio::test]
    async fn test_fetch_range_filters_full_history() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/api/symbol/a/PSX-OGDC/history")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(WRAPPED)
            .create_async()
            .await;

        let range = DateRange::single(NaiveDate::from_ymd_opt(2024, 1, 9).unwrap());
        let records = provider(&server)
            .fetch_range(AssetType::PkEquity, &Symbol::new("ogdc"), range)
            .await
            .unwrap();

        mock.assert_async().await;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].close, 122.8);
    }

    #[tokio::test]
    async fn test_fetch_quote_uses_latest_row() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/api/symbol/a/PSX-OGDC/history")
            .with_status(200)
            .with_body(WRAPPED)
            .create_async()
            .await;

        let quote = provider(&server)
            .fetch_quote(AssetType::PkEquity, &Symbol::new("OGDC"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(quote.price, 122.8);
        assert_eq!(quote.date, NaiveDate::from_ymd_opt(2024, 1, 9).unwrap());
    }

    #[tokio::test]
    async fn test_not_found() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/api/symbol/a/PSX-NOPE/history")
            .with_status(404)
            .create_async()
            .await;

        let err = provider(&server)
            .fetch_history(AssetType::PkEquity, &Symbol::new("NOPE"))
            .await
            .unwrap_err();
        assert_eq!(err, DataError::SymbolNotFound("NOPE".into()));
    }

    #[test]
    fn test_provider_info() {
        let provider = StockAnalysisProvider::default();
        assert_eq!(provider.name(), "StockAnalysis");
        assert!(provider.supports(AssetType::Kse100));
        assert!(!provider.supports(AssetType::Crypto));
    }
}
