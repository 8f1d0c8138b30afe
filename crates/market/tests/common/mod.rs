//! Shared fixtures: a manual clock, an in-memory store and counting sources.
#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Datelike, NaiveDate, TimeZone, Utc};
use market::{
    AssetType, DataError, DataSource, DateRange, HistorySource, LiveQuote, ManualClock,
    MarketCalendar, MarketConfig, MarketData, MemoryStore, QuoteSource, RecordStore, Result,
    SourceRegistry, Symbol, TimeSeriesRecord, TodayPrice, UpsertSummary,
};

pub fn date(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap()
}

pub fn utc(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(y, m, d, h, min, 0).unwrap()
}

/// History source answering every day with `close = day of month`.
#[derive(Debug)]
pub struct CountingHistory {
    assets: Vec<AssetType>,
    max_days: usize,
    delay: Duration,
    pub calls: AtomicUsize,
    pub ranges: Mutex<Vec<DateRange>>,
    in_flight: AtomicUsize,
    pub max_in_flight: AtomicUsize,
}

impl CountingHistory {
    pub fn new(assets: &[AssetType]) -> Self {
        Self {
            assets: assets.to_vec(),
            max_days: 1,
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
            ranges: Mutex::new(Vec::new()),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    pub fn with_max_days(mut self, days: usize) -> Self {
        self.max_days = days;
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn requested_ranges(&self) -> Vec<DateRange> {
        let mut ranges = self.ranges.lock().unwrap().clone();
        ranges.sort();
        ranges
    }
}

impl DataSource for CountingHistory {
    fn name(&self) -> &str {
        "counting-history"
    }

    fn description(&self) -> &str {
        "Synthetic daily closes"
    }

    fn asset_types(&self) -> &[AssetType] {
        &self.assets
    }
}

#[async_trait]
impl HistorySource for CountingHistory {
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
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.ranges.lock().unwrap().push(range);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        Ok(range
            .days()
            .map(|d| {
                TimeSeriesRecord::new(asset_type, symbol.clone(), d, f64::from(d.day()))
                    .with_ohl(1.0, 2.0, 0.5)
            })
            .collect())
    }

    fn max_days_per_request(&self) -> usize {
        self.max_days
    }
}

/// Quote source with fixed prices, counting single and bulk calls.
#[derive(Debug)]
pub struct CountingQuotes {
    assets: Vec<AssetType>,
    bulk: bool,
    prices: HashMap<Symbol, f64>,
    failing: HashSet<Symbol>,
    stall: Duration,
    today: NaiveDate,
    pub single_calls: AtomicUsize,
    pub bulk_calls: Mutex<Vec<Vec<Symbol>>>,
}

impl CountingQuotes {
    pub fn new(assets: &[AssetType], today: NaiveDate) -> Self {
        Self {
            assets: assets.to_vec(),
            bulk: false,
            prices: HashMap::new(),
            failing: HashSet::new(),
            stall: Duration::ZERO,
            today,
            single_calls: AtomicUsize::new(0),
            bulk_calls: Mutex::new(Vec::new()),
        }
    }

    pub fn with_bulk(mut self) -> Self {
        self.bulk = true;
        self
    }

    pub fn with_price(mut self, symbol: &str, price: f64) -> Self {
        self.prices.insert(Symbol::new(symbol), price);
        self
    }

    pub fn failing(mut self, symbol: &str) -> Self {
        self.failing.insert(Symbol::new(symbol));
        self
    }

    /// Every call sleeps for `stall` before answering.
    pub fn with_stall(mut self, stall: Duration) -> Self {
        self.stall = stall;
        self
    }

    pub fn single_calls(&self) -> usize {
        self.single_calls.load(Ordering::SeqCst)
    }

    pub fn bulk_calls(&self) -> Vec<Vec<Symbol>> {
        self.bulk_calls.lock().unwrap().clone()
    }
}

impl DataSource for CountingQuotes {
    fn name(&self) -> &str {
        "counting-quotes"
    }

    fn description(&self) -> &str {
        "Fixed live prices"
    }

    fn asset_types(&self) -> &[AssetType] {
        &self.assets
    }
}

#[async_trait]
impl QuoteSource for CountingQuotes {
    async fn fetch_quote(
        &self,
        _asset_type: AssetType,
        symbol: &Symbol,
    ) -> Result<Option<LiveQuote>> {
        self.single_calls.fetch_add(1, Ordering::SeqCst);
        if !self.stall.is_zero() {
            tokio::time::sleep(self.stall).await;
        }
        if self.failing.contains(symbol) {
            return Err(DataError::Network(format!("{symbol}: connection reset")));
        }
        Ok(self.prices.get(symbol).map(|price| LiveQuote {
            price: *price,
            date: self.today,
            as_of: Utc::now(),
        }))
    }

    fn supports_bulk(&self) -> bool {
        self.bulk
    }

    async fn fetch_bulk(
        &self,
        _asset_type: AssetType,
        symbols: &[Symbol],
    ) -> Result<HashMap<Symbol, f64>> {
        self.bulk_calls.lock().unwrap().push(symbols.to_vec());
        if !self.stall.is_zero() {
            tokio::time::sleep(self.stall).await;
        }
        Ok(symbols
            .iter()
            .filter(|s| !self.failing.contains(*s))
            .filter_map(|s| self.prices.get(s).map(|p| (s.clone(), *p)))
            .collect())
    }
}

pub struct Harness {
    pub clock: Arc<ManualClock>,
    pub store: Arc<MemoryStore>,
    pub market: MarketData,
}

pub fn harness(now: DateTime<Utc>, registry: SourceRegistry, config: MarketConfig) -> Harness {
    let clock = Arc::new(ManualClock::new(now));
    let store = Arc::new(MemoryStore::with_clock(clock.clone()));
    let market = MarketData::with_calendar(
        store.clone(),
        registry,
        config,
        MarketCalendar::new(clock.clone()),
    );
    Harness {
        clock,
        store,
        market,
    }
}

pub fn record(
    asset_type: AssetType,
    symbol: &str,
    date: NaiveDate,
    close: f64,
) -> TimeSeriesRecord {
    TimeSeriesRecord::new(asset_type, Symbol::new(symbol), date, close)
}

/// Store whose writes always fail; reads go to `inner`.
#[derive(Debug)]
pub struct FailingStore {
    pub inner: MemoryStore,
    pub upserts: AtomicUsize,
}

impl FailingStore {
    pub fn upserts(&self) -> usize {
        self.upserts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RecordStore for FailingStore {
    async fn read_range(
        &self,
        asset_type: AssetType,
        symbol: &Symbol,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<TimeSeriesRecord>> {
        self.inner.read_range(asset_type, symbol, start, end).await
    }

    async fn upsert(&self, _records: &[TimeSeriesRecord]) -> Result<UpsertSummary> {
        self.upserts.fetch_add(1, Ordering::SeqCst);
        Err(DataError::Store("database is locked".into()))
    }

    async fn read_latest(
        &self,
        asset_type: AssetType,
        symbol: &Symbol,
    ) -> Result<Option<TimeSeriesRecord>> {
        self.inner.read_latest(asset_type, symbol).await
    }

    async fn read_today(
        &self,
        asset_type: AssetType,
        symbol: &Symbol,
        today: NaiveDate,
    ) -> Result<Option<TodayPrice>> {
        self.inner.read_today(asset_type, symbol, today).await
    }
}

pub struct FailingHarness {
    pub clock: Arc<ManualClock>,
    pub store: Arc<FailingStore>,
    pub market: MarketData,
}

pub fn failing_harness(
    now: DateTime<Utc>,
    registry: SourceRegistry,
    config: MarketConfig,
) -> FailingHarness {
    let clock = Arc::new(ManualClock::new(now));
    let store = Arc::new(FailingStore {
        inner: MemoryStore::with_clock(clock.clone()),
        upserts: AtomicUsize::new(0),
    });
    let market = MarketData::with_calendar(
        store.clone(),
        registry,
        config,
        MarketCalendar::new(clock.clone()),
    );
    FailingHarness {
        clock,
        store,
        market,
    }
}
