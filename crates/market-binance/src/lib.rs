#![doc = include_str!("../README.md")]
#![doc(issue_tracker_base_url = "https://github.com/factordynamics/market/issues/")]
#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]
#![warn(missing_docs)]
#![forbid(unsafe_code)]

//! Binance crypto data source.
//!
//! This crate provides a Binance source that implements the [`HistorySource`]
//! and [`QuoteSource`] traits from `market-core` for the `crypto` asset type.
//!
//! # Features
//!
//! - Daily klines history, up to 1000 days per request
//! - Single and bulk live prices from the ticker endpoint
//! - Built-in rate limiting (250ms between requests by default)
//! - Symbol normalization (`btc`, `BTC-USDT`, `btc/usdt` all map to `BTCUSDT`)
//!
//! # Example
//!
//! ```no_run
//! use market_binance::BinanceProvider;
//! use market_core::{AssetType, DateRange, HistorySource, Symbol};
//! use chrono::NaiveDate;
//!
//! # async fn example() -> market_core::Result<()> {
//! let provider = BinanceProvider::new();
//! let range = DateRange::new(
//!     NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
//!     NaiveDate::from_ymd_opt(2024, 1, 31).unwrap(),
//! )?;
//!
//! let records = provider
//!     .fetch_range(AssetType::Crypto, &Symbol::new("BTC"), range)
//!     .await?;
//! println!("Fetched {} rows", records.len());
//! # Ok(())
//! # }
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use market_core::{
    AssetType, DataError, DataSource, DateRange, HistorySource, LiveQuote, QuoteSource, Result,
    Symbol, TimeSeriesRecord,
};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::time::sleep;
use tracing::{debug, instrument, warn};

/// Binance REST API base URL.
const API_BASE_URL: &str = "https://api.binance.com";

/// Quote currency appended to bare symbols.
const QUOTE_ASSET: &str = "USDT";

/// Maximum number of klines returned per request.
const MAX_KLINES_PER_REQUEST: usize = 1000;

/// Default rate limit delay in milliseconds.
const DEFAULT_RATE_LIMIT_MS: u64 = 250;

/// User agent for HTTP requests.
const USER_AGENT: &str = "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36";

const PROVIDER: &str = "Binance";

/// Normalizes a crypto symbol to a Binance USDT pair.
///
/// Separators (`-`, `_`, `/`) are stripped and `USDT` is appended if absent.
#[must_use]
pub fn normalize_symbol(symbol: &Symbol) -> String {
    let pair: String = symbol
        .as_str()
        .chars()
        .filter(|c| !matches!(c, '-' | '_' | '/'))
        .collect();
    if pair.ends_with(QUOTE_ASSET) {
        pair
    } else {
        format!("{pair}{QUOTE_ASSET}")
    }
}

/// Binance crypto data source.
///
/// Implements [`HistorySource`] and [`QuoteSource`] for [`AssetType::Crypto`].
#[derive(Debug)]
pub struct BinanceProvider {
    client: reqwest::Client,
    base_url: String,
    rate_limit_ms: u64,
    last_request_time: AtomicU64,
}

impl BinanceProvider {
    /// Create a new Binance source with default settings.
    ///
    /// Uses built-in rate limiting of one request per 250ms.
    #[must_use]
    pub fn new() -> Self {
        Self::with_rate_limit(Duration::from_millis(DEFAULT_RATE_LIMIT_MS))
    }

    /// Create a new Binance source with a custom HTTP client.
    ///
    /// Rate limiting is still applied.
    #[must_use]
    pub fn with_client(client: reqwest::Client) -> Self {
        Self {
            client,
            base_url: API_BASE_URL.to_string(),
            rate_limit_ms: DEFAULT_RATE_LIMIT_MS,
            last_request_time: AtomicU64::new(0),
        }
    }

    /// Create a new Binance source with custom rate limiting.
    #[must_use]
    pub fn with_rate_limit(rate_limit: Duration) -> Self {
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        Self {
            client,
            base_url: API_BASE_URL.to_string(),
            rate_limit_ms: u64::try_from(rate_limit.as_millis()).unwrap_or(u64::MAX),
            last_request_time: AtomicU64::new(0),
        }
    }

    /// Point the source at another API host (mirrors, tests).
    #[must_use]
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
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

    /// Make a rate-limited GET request and decode the JSON body.
    async fn get<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
        symbol: &str,
    ) -> Result<T> {
        self.apply_rate_limit().await;

        let url = format!("{}{}", self.base_url, path);
        debug!(url = %url, symbol = %symbol, "Binance request");

        let response = self
            .client
            .get(&url)
            .query(query)
            .send()
            .await
            .map_err(|e| DataError::Network(e.to_string()))?;

        let status = response.status();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS
            || status == reqwest::StatusCode::IM_A_TEAPOT
        {
            let retry_after = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .map(Duration::from_secs);
            return Err(DataError::RateLimited {
                provider: PROVIDER.to_string(),
                retry_after: retry_after.or(Some(Duration::from_secs(60))),
            });
        }

        // Binance answers 400 {"code":-1121,"msg":"Invalid symbol."} for unknown pairs.
        if status == reqwest::StatusCode::NOT_FOUND || status == reqwest::StatusCode::BAD_REQUEST {
            return Err(DataError::SymbolNotFound(symbol.to_string()));
        }

        if !status.is_success() {
            return Err(DataError::Network(format!("HTTP {status} for {symbol}")));
        }

        response
            .json::<T>()
            .await
            .map_err(|e| DataError::Parse(e.to_string()))
    }

    /// Fetch daily klines for a pair within `range`.
    async fn fetch_klines(&self, pair: &str, range: DateRange) -> Result<Vec<Vec<Value>>> {
        let query = [
            ("symbol", pair.to_string()),
            ("interval", "1d".to_string()),
            ("startTime", day_start_millis(range.start()).to_string()),
            ("endTime", (day_start_millis(range.end()) + 86_400_000 - 1).to_string()),
            ("limit", MAX_KLINES_PER_REQUEST.to_string()),
        ];
        self.get("/api/v3/klines", &query, pair).await
    }
}

impl Default for BinanceProvider {
    fn default() -> Self {
        Self::new()
    }
}

fn epoch_millis() -> u64 {
    u64::try_from(Utc::now().timestamp_millis()).unwrap_or_default()
}

fn day_start_millis(date: NaiveDate) -> i64 {
    date.and_time(chrono::NaiveTime::MIN).and_utc().timestamp_millis()
}

/// Parse klines (`[openTime, open, high, low, close, volume, ...]`) into records.
fn parse_klines(
    symbol: &Symbol,
    klines: &[Vec<Value>],
    range: DateRange,
) -> Result<Vec<TimeSeriesRecord>> {
    let mut records = Vec::with_capacity(klines.len());

    for kline in klines {
        let open_time = kline
            .first()
            .and_then(Value::as_i64)
            .ok_or_else(|| DataError::Parse("Kline without open time".to_string()))?;
        let date = DateTime::from_timestamp_millis(open_time)
            .ok_or_else(|| DataError::Parse(format!("Invalid kline open time {open_time}")))?
            .date_naive();

        if !range.contains(date) {
            continue;
        }

        let close = kline_f64(kline, 4)?;
        let record = TimeSeriesRecord::new(AssetType::Crypto, symbol.clone(), date, close)
            .with_ohl(kline_f64(kline, 1)?, kline_f64(kline, 2)?, kline_f64(kline, 3)?)
            .with_volume(kline_f64(kline, 5)?);
        records.push(record);
    }

    Ok(records)
}

/// Binance encodes decimals as strings.
fn kline_f64(kline: &[Value], index: usize) -> Result<f64> {
    match kline.get(index) {
        Some(Value::String(s)) => s
            .parse::<f64>()
            .map_err(|e| DataError::Parse(format!("Kline field {index}: {e}"))),
        Some(Value::Number(n)) => n
            .as_f64()
            .ok_or_else(|| DataError::Parse(format!("Kline field {index} out of range"))),
        _ => Err(DataError::Parse(format!("Kline field {index} missing"))),
    }
}

fn ensure_crypto(asset_type: AssetType) -> Result<()> {
    if asset_type == AssetType::Crypto {
        Ok(())
    } else {
        Err(DataError::NotSupported(format!(
            "{PROVIDER} does not serve {asset_type}"
        )))
    }
}

impl DataSource for BinanceProvider {
    fn name(&self) -> &str {
        PROVIDER
    }

    fn description(&self) -> &str {
        "Binance spot market daily klines and live prices for USDT pairs"
    }

    fn asset_types(&self) -> &[AssetType] {
        &[AssetType::Crypto]
    }
}

#[async_trait]
impl HistorySource for BinanceProvider {
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
        ensure_crypto(asset_type)?;
        let pair = normalize_symbol(symbol);
        let klines = self.fetch_klines(&pair, range).await?;
        let records = parse_klines(symbol, &klines, range)?;
        debug!("Fetched {} klines", records.len());
        Ok(records)
    }

    fn max_days_per_request(&self) -> usize {
        MAX_KLINES_PER_REQUEST
    }
}

#[async_trait]
impl QuoteSource for BinanceProvider {
    #[instrument(skip(self), fields(symbol = %symbol))]
    async fn fetch_quote(
        &self,
        asset_type: AssetType,
        symbol: &Symbol,
    ) -> Result<Option<LiveQuote>> {
        ensure_crypto(asset_type)?;
        let pair = normalize_symbol(symbol);
        let ticker: TickerPrice = self
            .get("/api/v3/ticker/price", &[("symbol", pair.clone())], &pair)
            .await?;

        let as_of = Utc::now();
        Ok(Some(LiveQuote {
            price: ticker.price()?,
            date: as_of.date_naive(),
            as_of,
        }))
    }

    fn supports_bulk(&self) -> bool {
        true
    }

    #[instrument(skip(self, symbols), fields(count = symbols.len()))]
    async fn fetch_bulk(
        &self,
        asset_type: AssetType,
        symbols: &[Symbol],
    ) -> Result<HashMap<Symbol, f64>> {
        ensure_crypto(asset_type)?;
        if symbols.is_empty() {
            return Ok(HashMap::new());
        }

        let by_pair: HashMap<String, &Symbol> =
            symbols.iter().map(|s| (normalize_symbol(s), s)).collect();
        let pairs: Vec<&str> = by_pair.keys().map(String::as_str).collect();
        let pairs_param =
            serde_json::to_string(&pairs).map_err(|e| DataError::Parse(e.to_string()))?;

        let tickers: Vec<TickerPrice> = match self
            .get("/api/v3/ticker/price", &[("symbols", pairs_param)], "bulk")
            .await
        {
            Ok(tickers) => tickers,
            // One unknown pair rejects the whole bulk request; fetch one by one instead.
            Err(DataError::SymbolNotFound(_)) => {
                warn!("Bulk ticker request rejected, falling back to single requests");
                let mut prices = HashMap::with_capacity(symbols.len());
                for symbol in symbols {
                    match self.fetch_quote(asset_type, symbol).await {
                        Ok(Some(quote)) => {
                            prices.insert(symbol.clone(), quote.price);
                        }
                        Ok(None) => {}
                        Err(e) => debug!(symbol = %symbol, error = %e, "Skipping symbol"),
                    }
                }
                return Ok(prices);
            }
            Err(e) => return Err(e),
        };

        let mut prices = HashMap::with_capacity(tickers.len());
        for ticker in tickers {
            if let Some(symbol) = by_pair.get(&ticker.symbol) {
                prices.insert((*symbol).clone(), ticker.price()?);
            }
        }
        Ok(prices)
    }
}

// ============================================================================
// Binance API Response Types
// ============================================================================

/// Ticker price response.
#[derive(Debug, Deserialize)]
struct TickerPrice {
    symbol: String,
    price: String,
}

impl TickerPrice {
    fn price(&self) -> Result<f64> {
        self.price
            .parse()
            .map_err(|e| DataError::Parse(format!("Invalid price for {}: {e}", self.symbol)))
    }
}
