#![doc = include_str!("../README.md")]
#![doc(issue_tracker_base_url = "https://github.com/factordynamics/market/issues/")]
#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]
#![warn(missing_docs)]
#![forbid(unsafe_code)]

//! Investing.com index data source.
//!
//! This crate provides a source for index history (the S&P 500 by default)
//! backed by the historical-data API of investing.com.
//!
//! The API sits behind an anti-bot layer. When it answers with an HTML
//! challenge page instead of JSON the call fails with
//! [`DataError::Blocked`], a transient error: the affected days stay missing
//! and are picked up by a later call.
//!
//! # Example
//!
//! ```no_run
//! use market_investing::InvestingProvider;
//! use market_core::{AssetType, DateRange, HistorySource, Symbol};
//! use chrono::NaiveDate;
//!
//! # async fn example() -> market_core::Result<()> {
//! let provider = InvestingProvider::new();
//! let range = DateRange::new(
//!     NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
//!     NaiveDate::from_ymd_opt(2024, 1, 31).unwrap(),
//! )?;
//! let records = provider
//!     .fetch_range(AssetType::Spx500, &Symbol::new("SPX500"), range)
//!     .await?;
//! println!("Fetched {} rows", records.len());
//! # Ok(())
//! # }
//! ```

use async_trait::async_trait;
use chrono::{NaiveDate, TimeDelta, Utc};
use market_core::{
    AssetType, DataError, DataSource, DateRange, HistorySource, LiveQuote, QuoteSource, Result,
    Symbol, TimeSeriesRecord,
};
use reqwest::Client;
use reqwest::header::{
    ACCEPT, ACCEPT_LANGUAGE, CONTENT_TYPE, HeaderMap, HeaderValue, ORIGIN, REFERER,
};
use serde::Deserialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, instrument, warn};

/// Base URL for the investing.com API.
const API_BASE_URL: &str = "https://api.investing.com";

/// Instrument id of the S&P 500 index.
pub const SPX500_INSTRUMENT_ID: &str = "166";

/// Default minimum interval between requests in milliseconds.
const DEFAULT_RATE_LIMIT_MS: u64 = 1000;

/// Days looked back when reading the latest close.
const QUOTE_LOOKBACK_DAYS: i64 = 10;

/// User agent for HTTP requests.
const USER_AGENT: &str = "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/138.0.0.0 Safari/537.36";

const PROVIDER: &str = "Investing";

/// Investing.com data source.
///
/// Maps symbols to investing.com instrument ids. `SPX500` and `SPX` map to
/// the S&P 500 out of the box; more can be added with
/// [`InvestingProvider::with_instrument`].
pub struct InvestingProvider {
    client: Client,
    base_url: String,
    instruments: HashMap<Symbol, String>,
    rate_limit_ms: u64,
    last_request_time: AtomicU64,
}

impl fmt::Debug for InvestingProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InvestingProvider")
            .field("base_url", &self.base_url)
            .field("instruments", &self.instruments)
            .field("rate_limit_ms", &self.rate_limit_ms)
            .finish()
    }
}

impl InvestingProvider {
    /// Create a new source with default settings.
    #[must_use]
    pub fn new() -> Self {
        Self::with_client(default_client())
    }

    /// Create a new source with a custom HTTP client.
    ///
    /// The client should send browser-like headers; requests without them
    /// are usually answered with a challenge page.
    #[must_use]
    pub fn with_client(client: Client) -> Self {
        let instruments = [
            (Symbol::new("SPX500"), SPX500_INSTRUMENT_ID.to_string()),
            (Symbol::new("SPX"), SPX500_INSTRUMENT_ID.to_string()),
        ]
        .into_iter()
        .collect();

        Self {
            client,
            base_url: API_BASE_URL.to_string(),
            instruments,
            rate_limit_ms: DEFAULT_RATE_LIMIT_MS,
            last_request_time: AtomicU64::new(0),
        }
    }

    /// Create a new source with a custom minimum interval between requests.
    #[must_use]
    pub fn with_rate_limit(rate_limit: Duration) -> Self {
        let mut provider = Self::new();
        provider.rate_limit_ms = u64::try_from(rate_limit.as_millis()).unwrap_or(u64::MAX);
        provider
    }

    /// Point the source at another host (tests).
    #[must_use]
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    /// Register an instrument id for a symbol.
    #[must_use]
    pub fn with_instrument(
        mut self,
        symbol: impl Into<Symbol>,
        instrument_id: impl Into<String>,
    ) -> Self {
        self.instruments.insert(symbol.into(), instrument_id.into());
        self
    }

    fn instrument(&self, symbol: &Symbol) -> Result<&str> {
        self.instruments
            .get(symbol)
            .map(String::as_str)
            .ok_or_else(|| DataError::SymbolNotFound(symbol.to_string()))
    }

    /// Apply rate limiting before making a request.
    async fn apply_rate_limit(&self) {
        let now = epoch_millis();
        let last = self.last_request_time.load(Ordering::Relaxed);
        let elapsed = now.saturating_sub(last);

        if elapsed < self.rate_limit_ms {
            let wait_time = self.rate_limit_ms - elapsed;
            debug!("Rate limiting: waiting {}ms", wait_time);
            sleep(Duration::from_millis(wait_time)).await;
        }

        self.last_request_time.store(epoch_millis(), Ordering::Relaxed);
    }

    /// Fetch raw daily rows of an instrument within `range`.
    async fn get_history(&self, instrument_id: &str, range: DateRange) -> Result<HistoryResponse> {
        self.apply_rate_limit().await;

        let url = format!(
            "{}/api/financialdata/historical/{instrument_id}",
            self.base_url
        );
        debug!("Investing request: {} {}", url, range);

        let response = self
            .client
            .get(&url)
            .query(&[
                ("start-date", range.start().to_string()),
                ("end-date", range.end().to_string()),
                ("time-frame", "Daily".to_string()),
                ("add-missing-rows", "false".to_string()),
            ])
            .send()
            .await
            .map_err(|e| DataError::Network(e.to_string()))?;

        if response.status() == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(DataError::RateLimited {
                provider: PROVIDER.to_string(),
                retry_after: None,
            });
        }

        let is_html = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.contains("text/html"));
        if is_html {
            warn!(status = %response.status(), "Received HTML challenge page");
            return Err(DataError::Blocked {
                provider: PROVIDER.to_string(),
            });
        }

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(DataError::SymbolNotFound(instrument_id.to_string()));
        }

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(DataError::Network(format!("HTTP {status}: {text}")));
        }

        let text = response
            .text()
            .await
            .map_err(|e| DataError::Network(e.to_string()))?;

        serde_json::from_str(&text).map_err(|e| DataError::Parse(format!("{e}: {text}")))
    }
}

impl Default for InvestingProvider {
    fn default() -> Self {
        Self::new()
    }
}

fn default_client() -> Client {
    let mut headers = HeaderMap::new();
    headers.insert(ACCEPT, HeaderValue::from_static("*/*"));
    headers.insert(ACCEPT_LANGUAGE, HeaderValue::from_static("en-GB,en-US;q=0.9,en;q=0.8"));
    headers.insert(ORIGIN, HeaderValue::from_static("https://www.investing.com"));
    headers.insert(REFERER, HeaderValue::from_static("https://www.investing.com/"));
    headers.insert("domain-id", HeaderValue::from_static("www"));

    Client::builder()
        .user_agent(USER_AGENT)
        .default_headers(headers)
        .timeout(Duration::from_secs(30))
        .build()
        .unwrap_or_else(|_| Client::new())
}

fn epoch_millis() -> u64 {
    u64::try_from(Utc::now().timestamp_millis()).unwrap_or_default()
}

fn ensure_supported(asset_type: AssetType) -> Result<()> {
    if asset_type == AssetType::Spx500 {
        Ok(())
    } else {
        Err(DataError::NotSupported(format!(
            "{PROVIDER} does not serve {asset_type}"
        )))
    }
}

/// Convert API rows into records sorted by date, keeping those inside `range`.
fn parse_rows(
    asset_type: AssetType,
    symbol: &Symbol,
    rows: Vec<HistoryRow>,
    range: DateRange,
) -> Vec<TimeSeriesRecord> {
    let mut records: Vec<TimeSeriesRecord> = rows
        .into_iter()
        .filter_map(|row| {
            let date = row.date()?;
            let close = parse_number(row.last_close_raw.as_ref(), row.last_close.as_ref())?;
            Some(TimeSeriesRecord {
                asset_type,
                symbol: symbol.clone(),
                date,
                open: parse_number(row.last_open_raw.as_ref(), row.last_open.as_ref()),
                high: parse_number(row.last_max_raw.as_ref(), row.last_max.as_ref()),
                low: parse_number(row.last_min_raw.as_ref(), row.last_min.as_ref()),
                close,
                volume: row.volume.as_ref().and_then(parse_volume),
                adjusted_close: None,
                change_pct: row.change_precent_raw.as_ref().and_then(Number::as_f64),
            })
        })
        .filter(|r| range.contains(r.date))
        .collect();

    records.sort_by_key(|r| r.date);
    records.dedup_by_key(|r| r.date);
    records
}

/// Dates come as `2014-11-24T00:00:00.000Z` or `Nov 24, 2014`.
fn parse_row_date(s: &str) -> Option<NaiveDate> {
    if s.contains('T') {
        NaiveDate::parse_from_str(s.get(..10)?, "%Y-%m-%d").ok()
    } else {
        NaiveDate::parse_from_str(s.trim(), "%b %d, %Y").ok()
    }
}

/// Prefers the raw value, falling back to the formatted text.
fn parse_number(raw: Option<&Number>, formatted: Option<&Number>) -> Option<f64> {
    raw.and_then(Number::as_f64)
        .or_else(|| formatted.and_then(Number::as_f64))
}

/// Parses volumes like `2.5B`, `830.5M`, `12K` or `1,234`.
fn parse_volume(volume: &Number) -> Option<f64> {
    let text = match volume {
        Number::Float(v) => return Some(*v),
        Number::Text(s) => s.replace(',', "").trim().to_uppercase(),
    };

    let (digits, multiplier) = match text.chars().last()? {
        'B' => (&text[..text.len() - 1], 1_000_000_000.0),
        'M' => (&text[..text.len() - 1], 1_000_000.0),
        'K' => (&text[..text.len() - 1], 1_000.0),
        _ => (text.as_str(), 1.0),
    };
    digits.trim().parse::<f64>().ok().map(|v| v * multiplier)
}

impl DataSource for InvestingProvider {
    fn name(&self) -> &str {
        PROVIDER
    }

    fn description(&self) -> &str {
        "investing.com daily index history"
    }

    fn asset_types(&self) -> &[AssetType] {
        &[AssetType::Spx500]
    }
}

#[async_trait]
impl HistorySource for InvestingProvider {
    async fn fetch_day(
        &self,
        asset_type: AssetType,
        symbol: &Symbol,
        date: NaiveDate,
    ) -> Result<Vec<TimeSeriesRecord>> {
        self.fetch_range(asset_type, symbol, DateRange::single(date))
            .await
    }

    #[instrument(skip(self), fields(symbol = %symbol, range = %range))]
    async fn fetch_range(
        &self,
        asset_type: AssetType,
        symbol: &Symbol,
        range: DateRange,
    ) -> Result<Vec<TimeSeriesRecord>> {
        ensure_supported(asset_type)?;
        let instrument_id = self.instrument(symbol)?;
        let rows = self.get_history(instrument_id, range).await?.into_rows();
        let records = parse_rows(asset_type, symbol, rows, range);
        debug!("Fetched {} rows", records.len());
        Ok(records)
    }

    fn max_days_per_request(&self) -> usize {
        usize::MAX
    }

    fn earliest_date(&self, asset_type: AssetType) -> Option<NaiveDate> {
        (asset_type == AssetType::Spx500)
            .then(|| NaiveDate::from_ymd_opt(1996, 1, 1))
            .flatten()
    }
}

#[async_trait]
impl QuoteSource for InvestingProvider {
    async fn fetch_quote(
        &self,
        asset_type: AssetType,
        symbol: &Symbol,
    ) -> Result<Option<LiveQuote>> {
        let today = Utc::now().date_naive();
        let range = DateRange::new(today - TimeDelta::days(QUOTE_LOOKBACK_DAYS), today)?;
        let records = self.fetch_range(asset_type, symbol, range).await?;
        Ok(records.last().map(|latest| LiveQuote {
            price: latest.close,
            date: latest.date,
            as_of: Utc::now(),
        }))
    }
}

// ============================================================================
// Investing.com API Response Types
// ============================================================================

/// History response: `{"data": [...]}` or a bare array.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum HistoryResponse {
    Rows(Vec<HistoryRow>),
    Wrapped { data: Option<Vec<HistoryRow>> },
}

impl HistoryResponse {
    fn into_rows(self) -> Vec<HistoryRow> {
        match self {
            Self::Rows(rows) | Self::Wrapped { data: Some(rows) } => rows,
            Self::Wrapped { data: None } => Vec::new(),
        }
    }
}

/// A number sent either as JSON number or as formatted text (`"2,067.56"`).
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum Number {
    Float(f64),
    Text(String),
}

impl Number {
    fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Float(v) => Some(*v),
            Self::Text(s) => s.replace(',', "").trim().parse().ok(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct HistoryRow {
    #[serde(rename = "rowDate")]
    row_date: Option<String>,
    #[serde(rename = "rowDateTimestamp")]
    row_date_timestamp: Option<String>,
    last_close: Option<Number>,
    last_open: Option<Number>,
    last_max: Option<Number>,
    last_min: Option<Number>,
    #[serde(rename = "last_closeRaw")]
    last_close_raw: Option<Number>,
    #[serde(rename = "last_openRaw")]
    last_open_raw: Option<Number>,
    #[serde(rename = "last_maxRaw")]
    last_max_raw: Option<Number>,
    #[serde(rename = "last_minRaw")]
    last_min_raw: Option<Number>,
    volume: Option<Number>,
    #[serde(rename = "change_precentRaw")]
    change_precent_raw: Option<Number>,
}

impl HistoryRow {
    fn date(&self) -> Option<NaiveDate> {
        self.row_date_timestamp
            .as_deref()
            .and_then(parse_row_date)
            .or_else(|| self.row_date.as_deref().and_then(parse_row_date))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Matcher;

    const BODY: &str = r#"{"data": [
        {"rowDate": "Jan 03, 2024", "rowDateTimestamp": "2024-01-03T00:00:00Z",
         "last_close": "4,704.81", "last_open": "4,725.07", "last_max": "4,729.29", "last_min": "4,699.71",
         "volume": "2.5B", "last_closeRaw": 4704.81, "change_precentRaw": -0.8},
        {"rowDate": "Jan 02, 2024",
         "last_close": "4,742.83", "last_open": "4,745.20", "last_max": "4,754.33", "last_min": "4,722.67",
         "volume": "830.5M"},
        {"rowDate": "not a date", "last_close": "1.0"}
    ]}"#;

    fn date(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 1, d).unwrap()
    }

    fn provider(server: &mockito::Server) -> InvestingProvider {
        InvestingProvider::with_rate_limit(Duration::ZERO).with_base_url(server.url())
    }

    #[test]
    fn test_parse_rows() {
        let body: HistoryResponse = serde_json::from_str(BODY).unwrap();
        let range = DateRange::new(date(1), date(5)).unwrap();
        let symbol = Symbol::new("SPX500");
        let records = parse_rows(AssetType::Spx500, &symbol, body.into_rows(), range);

        assert_eq!(records.len(), 2);
        assert_eq!(records[0].date, date(2));
        assert_eq!(records[0].close, 4742.83);
        assert_eq!(records[0].volume, Some(830_500_000.0));
        assert_eq!(records[1].open, Some(4725.07));
        assert_eq!(records[1].volume, Some(2_500_000_000.0));
        assert_eq!(records[1].change_pct, Some(-0.8));
    }

    #[test]
    fn test_parse_helpers() {
        assert_eq!(parse_row_date("Nov 24, 2014"), NaiveDate::from_ymd_opt(2014, 11, 24));
        assert_eq!(
            parse_row_date("2014-11-24T00:00:00.000Z"),
            NaiveDate::from_ymd_opt(2014, 11, 24)
        );
        assert_eq!(parse_volume(&Number::Text("12K".into())), Some(12_000.0));
        assert_eq!(parse_volume(&Number::Text("1,234".into())), Some(1234.0));
        assert_eq!(parse_volume(&Number::Text("-".into())), None);
        let empty = Number::Text(String::new());
        let text = Number::Text("2,067.56".into());
        assert_eq!(parse_number(Some(&empty), Some(&text)), Some(2067.56));
    }

    #[tokio::test]
    async fn test_fetch_range_sends_query() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/api/financialdata/historical/166")
            .match_query(Matcher::AllOf(vec![
                Matcher::UrlEncoded("start-date".into(), "2024-01-01".into()),
                Matcher::UrlEncoded("end-date".into(), "2024-01-05".into()),
                Matcher::UrlEncoded("time-frame".into(), "Daily".into()),
                Matcher::UrlEncoded("add-missing-rows".into(), "false".into()),
            ]))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(BODY)
            .create_async()
            .await;

        let range = DateRange::new(date(1), date(5)).unwrap();
        let records = provider(&server)
            .fetch_range(AssetType::Spx500, &Symbol::new("spx500"), range)
            .await
            .unwrap();

        mock.assert_async().await;
        assert_eq!(records.len(), 2);
    }

    #[tokio::test]
    async fn test_html_challenge_is_blocked() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/api/financialdata/historical/166")
            .match_query(Matcher::Any)
            .with_status(403)
            .with_header("content-type", "text/html; charset=UTF-8")
            .with_body("<html>Just a moment...</html>")
            .create_async()
            .await;

        let err = provider(&server)
            .fetch_day(AssetType::Spx500, &Symbol::new("SPX500"), date(2))
            .await
            .unwrap_err();
        assert_eq!(err, DataError::Blocked { provider: "Investing".into() });
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_unknown_symbol() {
        let provider = InvestingProvider::new();
        let err = provider
            .fetch_day(AssetType::Spx500, &Symbol::new("NDX"), date(2))
            .await
            .unwrap_err();
        assert!(matches!(err, DataError::SymbolNotFound(_)));

        let provider = provider.with_instrument("NDX", "20");
        assert_eq!(provider.instrument(&Symbol::new("ndx")).unwrap(), "20");
    }

    #[test]
    fn test_provider_info() {
        let provider = InvestingProvider::default();
        assert_eq!(provider.name(), "Investing");
        assert_eq!(
            provider.earliest_date(AssetType::Spx500),
            NaiveDate::from_ymd_opt(1996, 1, 1)
        );
        assert_eq!(provider.earliest_date(AssetType::Crypto), None);
    }
}
