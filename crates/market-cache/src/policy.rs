//! Cache keys and TTL policy.
//!
//! Keys are deterministic in `(namespace, asset type, symbol, date)`. TTLs
//! depend on whether the query is historical, whether the asset's market is
//! open and whether the caller asked for a refresh.

use chrono::NaiveDate;
use market_core::{AssetType, DateRange, FetchOptions, Market, MarketCalendar, Symbol};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Builds the cache key `namespace:asset-type:SYMBOL[:YYYY-MM-DD]`.
///
/// `options` never participates in the key: a refresh writes to the same
/// entry that a normal read would hit.
#[must_use]
pub fn cache_key(
    namespace: &str,
    asset_type: AssetType,
    symbol: &Symbol,
    date: Option<NaiveDate>,
    _options: &FetchOptions,
) -> String {
    match date {
        Some(date) => format!("{namespace}:{asset_type}:{symbol}:{date}"),
        None => format!("{namespace}:{asset_type}:{symbol}"),
    }
}

/// Builds the cache key of a date-range query,
/// `namespace:asset-type:SYMBOL:START:END`.
#[must_use]
pub fn range_key(
    namespace: &str,
    asset_type: AssetType,
    symbol: &Symbol,
    range: DateRange,
    options: &FetchOptions,
) -> String {
    format!(
        "{}:{}",
        cache_key(namespace, asset_type, symbol, Some(range.start()), options),
        range.end()
    )
}

/// TTL settings, in milliseconds.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TtlConfig {
    /// TTL of data for past dates.
    pub historical_ms: u64,
    /// TTL of live crypto prices.
    pub crypto_live_ms: u64,
    /// TTL of live prices while the market is open.
    pub live_ms: u64,
    /// Lower bound of the TTL while the market is closed.
    pub closed_min_ms: u64,
    /// Upper bound of the TTL while the market is closed.
    pub closed_max_ms: u64,
    /// Lower bound of a daily marker's TTL.
    pub marker_min_ms: u64,
    /// Upper bound of a daily marker's TTL.
    pub marker_max_ms: u64,
}

impl Default for TtlConfig {
    fn default() -> Self {
        Self {
            historical_ms: 30 * 24 * 60 * 60 * 1000,
            crypto_live_ms: 30 * 1000,
            live_ms: 60 * 1000,
            closed_min_ms: 5 * 60 * 1000,
            closed_max_ms: 24 * 60 * 60 * 1000,
            marker_min_ms: 60 * 60 * 1000,
            marker_max_ms: 24 * 60 * 60 * 1000,
        }
    }
}

impl TtlConfig {
    /// TTL of historical data.
    #[must_use]
    pub const fn historical(&self) -> Duration {
        Duration::from_millis(self.historical_ms)
    }

    /// TTL of a live price while its market is open.
    #[must_use]
    pub const fn live(&self, asset_type: AssetType) -> Duration {
        match asset_type {
            AssetType::Crypto => Duration::from_millis(self.crypto_live_ms),
            _ => Duration::from_millis(self.live_ms),
        }
    }

    /// Bounds of the TTL while the market is closed.
    #[must_use]
    pub const fn closed_bounds(&self) -> (Duration, Duration) {
        (
            Duration::from_millis(self.closed_min_ms),
            Duration::from_millis(self.closed_max_ms),
        )
    }

    /// Bounds of a daily marker's TTL.
    #[must_use]
    pub const fn marker_bounds(&self) -> (Duration, Duration) {
        (
            Duration::from_millis(self.marker_min_ms),
            Duration::from_millis(self.marker_max_ms),
        )
    }

    /// Sets the historical TTL.
    #[must_use]
    pub fn with_historical(mut self, ttl: Duration) -> Self {
        self.historical_ms = millis(ttl);
        self
    }

    /// Sets the live TTL for non-crypto assets.
    #[must_use]
    pub fn with_live(mut self, ttl: Duration) -> Self {
        self.live_ms = millis(ttl);
        self
    }

    /// Sets the live TTL for crypto.
    #[must_use]
    pub fn with_crypto_live(mut self, ttl: Duration) -> Self {
        self.crypto_live_ms = millis(ttl);
        self
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Facts about a query that determine its TTL.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TtlContext {
    /// The query is about dates strictly before today.
    pub is_historical: bool,
    /// The asset's market is outside its session.
    pub market_closed: bool,
    /// The caller asked to bypass cached reads.
    pub refresh: bool,
}

/// Read and write TTLs for one cache access.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TtlDecision {
    /// How old a stored entry may be and still be served. Zero bypasses reads.
    pub read_ttl: Duration,
    /// TTL for the freshly computed value.
    pub write_ttl: Duration,
}

impl TtlDecision {
    /// Same TTL for reading and writing.
    #[must_use]
    pub const fn fixed(ttl: Duration) -> Self {
        Self {
            read_ttl: ttl,
            write_ttl: ttl,
        }
    }

    /// Returns true if stored entries must be ignored.
    #[must_use]
    pub const fn bypass_read(&self) -> bool {
        self.read_ttl.is_zero()
    }
}

/// Derives TTLs from the asset type and the market calendar.
#[derive(Clone, Debug)]
pub struct TtlPolicy {
    calendar: MarketCalendar,
    config: TtlConfig,
}

impl TtlPolicy {
    /// Creates a policy reading market state from `calendar`.
    #[must_use]
    pub const fn new(calendar: MarketCalendar, config: TtlConfig) -> Self {
        Self { calendar, config }
    }

    /// Returns the calendar this policy consults.
    #[must_use]
    pub const fn calendar(&self) -> &MarketCalendar {
        &self.calendar
    }

    /// Returns the TTL settings.
    #[must_use]
    pub const fn config(&self) -> &TtlConfig {
        &self.config
    }

    /// Computes the TTLs for a query on `asset_type`.
    #[must_use]
    pub fn ttl(&self, asset_type: AssetType, ctx: TtlContext) -> TtlDecision {
        let ttl = if ctx.is_historical {
            self.config.historical()
        } else if ctx.market_closed {
            let (min, max) = self.config.closed_bounds();
            self.calendar
                .until_next_open(asset_type.market())
                .min(max)
                .max(min)
        } else {
            self.config.live(asset_type)
        };

        if ctx.refresh {
            TtlDecision {
                read_ttl: Duration::ZERO,
                write_ttl: ttl,
            }
        } else {
            TtlDecision::fixed(ttl)
        }
    }

    /// Builds the TTL context of a query about `date` (or about "now").
    #[must_use]
    pub fn context(
        &self,
        asset_type: AssetType,
        date: Option<NaiveDate>,
        options: &FetchOptions,
    ) -> TtlContext {
        let market = asset_type.market();
        TtlContext {
            is_historical: date.is_some_and(|d| d < self.calendar.today(market)),
            market_closed: self.calendar.is_market_closed(market),
            refresh: options.refresh,
        }
    }

    /// Shorthand for `ttl(asset_type, context(asset_type, date, options))`.
    #[must_use]
    pub fn decide(
        &self,
        asset_type: AssetType,
        date: Option<NaiveDate>,
        options: &FetchOptions,
    ) -> TtlDecision {
        self.ttl(asset_type, self.context(asset_type, date, options))
    }

    /// TTL of a "done today" marker: until local midnight of `market`.
    #[must_use]
    pub fn daily_marker_ttl(&self, market: Market) -> Duration {
        let (min, max) = self.config.marker_bounds();
        self.calendar.until_local_midnight(market).min(max).max(min)
    }
}
