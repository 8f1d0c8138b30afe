//! Historical Data Service: gap detection and paced backfill.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use chrono::{NaiveDate, TimeDelta};
use futures::future::join_all;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, instrument, warn};

use market_cache::{CacheStore, Cached, TtlConfig, TtlPolicy, range_key};
use market_core::{
    AssetType, DataError, DataOrigin, DateRange, FetchOptions, HistoricalData, HistorySource,
    MarketCalendar, RecordStore, Result, Symbol, TimeSeriesRecord,
};

use crate::config::BackfillConfig;
use crate::gaps::{FetchChunk, collapse_ranges, missing_dates, plan_chunks};
use crate::registry::SourceRegistry;

const CACHE_NAMESPACE: &str = "history";

/// Serves daily history from the store, fetching only what is missing.
///
/// Cloning is cheap; clones share the store, sources and cache.
#[derive(Clone)]
pub struct HistoricalDataService {
    store: Arc<dyn RecordStore>,
    sources: Arc<SourceRegistry>,
    cache: CacheStore,
    policy: TtlPolicy,
    config: BackfillConfig,
}

impl std::fmt::Debug for HistoricalDataService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HistoricalDataService")
            .field("store", &self.store)
            .field("sources", &self.sources)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Which stored days an ensure call fetches again.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Refetch {
    /// Only days absent from the store.
    Missing,
    /// Absent days plus the last trading day.
    LatestDay,
    /// Every trading day in the range.
    All,
}

/// Outcome of one fetch chunk.
#[derive(Debug)]
enum ChunkOutcome {
    Fetched(Vec<TimeSeriesRecord>),
    Failed(DateRange),
}

impl HistoricalDataService {
    /// Create a service with the system calendar and default settings.
    #[must_use]
    pub fn new(store: Arc<dyn RecordStore>, sources: Arc<SourceRegistry>) -> Self {
        let calendar = MarketCalendar::system();
        Self {
            store,
            sources,
            cache: CacheStore::with_clock(Arc::clone(calendar.clock())),
            policy: TtlPolicy::new(calendar, TtlConfig::default()),
            config: BackfillConfig::default(),
        }
    }

    /// Use `cache` for read-through results.
    #[must_use]
    pub fn with_cache(mut self, cache: CacheStore) -> Self {
        self.cache = cache;
        self
    }

    /// Use `policy` for TTLs; its calendar decides what "today" is.
    #[must_use]
    pub fn with_policy(mut self, policy: TtlPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Use `config` for pacing.
    #[must_use]
    pub fn with_config(mut self, config: BackfillConfig) -> Self {
        self.config = config;
        self
    }

    /// The calendar deciding trading days.
    #[must_use]
    pub const fn calendar(&self) -> &MarketCalendar {
        self.policy.calendar()
    }

    /// Returns the records of `range`, fetching missing trading days first.
    ///
    /// The range is cut off at today in the asset's market. Failed or timed
    /// out fetches leave their days missing and are reported in
    /// [`HistoricalData::failed`]; only a store write failure fails the call.
    #[instrument(skip(self), fields(asset_type = %asset_type, symbol = %symbol, range = %range))]
    pub async fn ensure(
        &self,
        asset_type: AssetType,
        symbol: &Symbol,
        range: DateRange,
        options: FetchOptions,
    ) -> Result<HistoricalData> {
        let mode = if options.refresh {
            Refetch::LatestDay
        } else {
            Refetch::Missing
        };
        self.ensure_with(asset_type, symbol, range, mode).await
    }

    /// Fetches every trading day of `range` again, stored or not, and writes
    /// the results over the stored values.
    #[instrument(skip(self), fields(asset_type = %asset_type, symbol = %symbol, range = %range))]
    pub async fn refetch(
        &self,
        asset_type: AssetType,
        symbol: &Symbol,
        range: DateRange,
    ) -> Result<HistoricalData> {
        self.ensure_with(asset_type, symbol, range, Refetch::All)
            .await
    }

    async fn ensure_with(
        &self,
        asset_type: AssetType,
        symbol: &Symbol,
        range: DateRange,
        mode: Refetch,
    ) -> Result<HistoricalData> {
        let market = asset_type.market();
        let today = self.calendar().today(market);

        let Some(range) = range.clamp_end(today) else {
            debug!("Range starts after today, nothing to read");
            return Ok(HistoricalData::from_store(asset_type, symbol.clone(), Vec::new()));
        };

        let trading_days = self.calendar().trading_days(market, range);
        let existing = self
            .store
            .read_range(asset_type, symbol, range.start(), range.end())
            .await?;

        if trading_days.is_empty() {
            debug!("No trading days in range");
            return Ok(HistoricalData::from_store(asset_type, symbol.clone(), existing));
        }

        let present: BTreeSet<NaiveDate> = existing.iter().map(|r| r.date).collect();
        let missing = match mode {
            Refetch::Missing => missing_dates(&trading_days, &present, None),
            Refetch::LatestDay => missing_dates(
                &trading_days,
                &present,
                Some(self.calendar().last_trading_day(market)),
            ),
            Refetch::All => trading_days.clone(),
        };

        if missing.is_empty() {
            debug!(records = existing.len(), "Range fully stored");
            return Ok(HistoricalData::from_store(asset_type, symbol.clone(), existing));
        }

        let Some(source) = self.sources.history(asset_type) else {
            warn!(missing = missing.len(), "No history source registered, serving stored data");
            let mut data = HistoricalData::from_store(asset_type, symbol.clone(), existing);
            data.unfilled = collapse_ranges(&missing);
            return Ok(data);
        };

        let max_days = self
            .config
            .max_days_per_chunk
            .map_or(source.max_days_per_request(), |days| {
                days.min(source.max_days_per_request())
            });
        let chunks = plan_chunks(&trading_days, &missing, max_days);
        info!(
            provider = source.name(),
            missing = missing.len(),
            chunks = chunks.len(),
            "Backfilling missing days"
        );

        let mut fetched = Vec::new();
        let mut failed = Vec::new();
        for outcome in self
            .fetch_chunks(source.as_ref(), asset_type, symbol, &chunks)
            .await
        {
            match outcome {
                ChunkOutcome::Fetched(mut records) => fetched.append(&mut records),
                ChunkOutcome::Failed(range) => failed.push(range),
            }
        }

        if !fetched.is_empty() {
            let summary = self.store.upsert(&fetched).await?;
            info!(
                inserted = summary.inserted,
                updated = summary.updated,
                skipped = summary.skipped,
                "Stored fetched records"
            );
        }

        let fetched_dates: BTreeSet<NaiveDate> = fetched.iter().map(|r| r.date).collect();
        let filled: Vec<NaiveDate> = missing
            .iter()
            .copied()
            .filter(|d| fetched_dates.contains(d))
            .collect();
        let unfilled: Vec<NaiveDate> = missing
            .iter()
            .copied()
            .filter(|d| !fetched_dates.contains(d) && !present.contains(d))
            .collect();

        let fetched_count = fetched.len();
        let mut merged: BTreeMap<NaiveDate, TimeSeriesRecord> =
            existing.into_iter().map(|r| (r.date, r)).collect();
        merged.extend(fetched.into_iter().map(|r| (r.date, r)));

        Ok(HistoricalData {
            asset_type,
            symbol: symbol.clone(),
            records: merged.into_values().collect(),
            filled_gaps: collapse_ranges(&filled),
            unfilled: collapse_ranges(&unfilled),
            failed,
            fetched: fetched_count,
            source: if fetched_count > 0 {
                DataOrigin::Api
            } else {
                DataOrigin::Database
            },
        })
    }

    /// Dispatches `chunks` in waves of at most `concurrency`, pausing between
    /// waves.
    async fn fetch_chunks(
        &self,
        source: &dyn HistorySource,
        asset_type: AssetType,
        symbol: &Symbol,
        chunks: &[FetchChunk],
    ) -> Vec<ChunkOutcome> {
        let mut outcomes = Vec::with_capacity(chunks.len());

        for (index, wave) in chunks.chunks(self.config.concurrency.max(1)).enumerate() {
            if index > 0 && !self.config.wave_delay().is_zero() {
                sleep(self.config.wave_delay()).await;
            }
            debug!(wave = index, size = wave.len(), "Dispatching wave");
            let results = join_all(
                wave.iter()
                    .map(|chunk| self.fetch_chunk(source, asset_type, symbol, chunk)),
            )
            .await;
            outcomes.extend(results);
        }

        outcomes
    }

    async fn fetch_chunk(
        &self,
        source: &dyn HistorySource,
        asset_type: AssetType,
        symbol: &Symbol,
        chunk: &FetchChunk,
    ) -> ChunkOutcome {
        let limit = self.config.fetch_timeout();
        let result = match timeout(limit, source.fetch_range(asset_type, symbol, chunk.range)).await
        {
            Ok(result) => result,
            Err(_) => Err(DataError::Timeout(limit)),
        };

        match result {
            Ok(mut records) => {
                records.retain(|r| {
                    r.asset_type == asset_type
                        && r.symbol == *symbol
                        && chunk.dates.binary_search(&r.date).is_ok()
                });
                debug!(range = %chunk.range, records = records.len(), "Fetched chunk");
                ChunkOutcome::Fetched(records)
            }
            Err(e) => {
                warn!(
                    provider = source.name(),
                    range = %chunk.range,
                    error = %e,
                    transient = e.is_transient(),
                    "Chunk fetch failed, leaving days missing"
                );
                ChunkOutcome::Failed(chunk.range)
            }
        }
    }

    /// Ensures the last trading day on or before today.
    pub async fn fetch_latest(
        &self,
        asset_type: AssetType,
        symbol: &Symbol,
        options: FetchOptions,
    ) -> Result<HistoricalData> {
        let day = self.calendar().last_trading_day(asset_type.market());
        self.ensure(asset_type, symbol, DateRange::single(day), options)
            .await
    }

    /// Ensures the whole history: from the source's earliest date, or
    /// `default_lookback_days` back, up to today.
    pub async fn full_backfill(
        &self,
        asset_type: AssetType,
        symbol: &Symbol,
        options: FetchOptions,
    ) -> Result<HistoricalData> {
        self.ensure(asset_type, symbol, self.full_range(asset_type), options)
            .await
    }

    /// [`refetch`](Self::refetch) over the range of
    /// [`full_backfill`](Self::full_backfill).
    pub async fn full_refetch(
        &self,
        asset_type: AssetType,
        symbol: &Symbol,
    ) -> Result<HistoricalData> {
        self.refetch(asset_type, symbol, self.full_range(asset_type))
            .await
    }

    fn full_range(&self, asset_type: AssetType) -> DateRange {
        let today = self.calendar().today(asset_type.market());
        let earliest = self
            .sources
            .history(asset_type)
            .and_then(|source| source.earliest_date(asset_type));
        DateRange::spanning(
            backfill_start(today, earliest, self.config.default_lookback_days),
            today,
        )
    }

    /// Cached [`ensure`](Self::ensure).
    ///
    /// Identical concurrent requests share one computation. A result with
    /// failed fetches is not kept, so the next call retries them.
    #[instrument(skip(self), fields(asset_type = %asset_type, symbol = %symbol, range = %range))]
    pub async fn ensure_historical_data(
        &self,
        asset_type: AssetType,
        symbol: &Symbol,
        range: DateRange,
        options: FetchOptions,
    ) -> Result<Cached<HistoricalData>> {
        let key = range_key(CACHE_NAMESPACE, asset_type, symbol, range, &options);
        let decision = self
            .policy
            .decide(asset_type, Some(range.end()), &options);

        let service = self.clone();
        let owned_symbol = symbol.clone();
        let cached = self
            .cache
            .get_or_set_if(
                &key,
                decision,
                move || async move {
                    service
                        .ensure(asset_type, &owned_symbol, range, options)
                        .await
                },
                |data: &HistoricalData| data.failed.is_empty(),
            )
            .await?;

        debug!(status = cached.status(), "Historical data served");
        Ok(cached)
    }
}

/// First day of a full backfill: the source's earliest date, else
/// `lookback_days` before `today`, never after `today`.
fn backfill_start(today: NaiveDate, earliest: Option<NaiveDate>, lookback_days: u32) -> NaiveDate {
    earliest
        .unwrap_or_else(|| {
            today
                .checked_sub_signed(TimeDelta::days(i64::from(lookback_days)))
                .unwrap_or(NaiveDate::MIN)
        })
        .min(today)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::{TimeZone, Utc};
    use market_core::{DataSource, ManualClock};
    use market_store::MemoryStore;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn date(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 1, d).unwrap()
    }

    /// Serves a close of `day` for every requested day, failing on `fail_on`.
    #[derive(Debug, Default)]
    struct DailySource {
        calls: AtomicUsize,
        fail_on: Option<NaiveDate>,
        stall: bool,
    }

    impl DataSource for DailySource {
        fn name(&self) -> &str {
            "daily"
        }

        fn description(&self) -> &str {
            "test source"
        }

        fn asset_types(&self) -> &[AssetType] {
            &[AssetType::PkEquity]
        }
    }

    #[async_trait]
    impl HistorySource for DailySource {
        async fn fetch_day(
            &self,
            asset_type: AssetType,
            symbol: &Symbol,
            date: NaiveDate,
        ) -> Result<Vec<TimeSeriesRecord>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.stall {
                sleep(Duration::from_secs(3600)).await;
            }
            if Some(date) == self.fail_on {
                return Err(DataError::Network("connection reset".into()));
            }
            let close = f64::from(chrono::Datelike::day(&date));
            Ok(vec![TimeSeriesRecord::new(asset_type, symbol.clone(), date, close)])
        }
    }

    fn service(source: Option<Arc<DailySource>>) -> (HistoricalDataService, Arc<MemoryStore>) {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 1, 12, 12, 0, 0).unwrap(),
        ));
        let calendar = MarketCalendar::new(clock.clone());
        let store = Arc::new(MemoryStore::with_clock(clock));
        let mut registry = SourceRegistry::new();
        if let Some(source) = source {
            registry.register_history(source);
        }

        let service = HistoricalDataService::new(store.clone(), Arc::new(registry))
            .with_policy(TtlPolicy::new(calendar, TtlConfig::default()))
            .with_config(BackfillConfig::default().with_wave_delay(Duration::ZERO));
        (service, store)
    }

    #[tokio::test]
    async fn test_failed_chunk_stays_missing() {
        let source = Arc::new(DailySource {
            fail_on: Some(date(9)),
            ..Default::default()
        });
        let (service, store) = service(Some(source.clone()));
        let symbol = Symbol::new("OGDC");
        let range = DateRange::new(date(8), date(10)).unwrap();

        let data = service
            .ensure(AssetType::PkEquity, &symbol, range, FetchOptions::default())
            .await
            .unwrap();

        assert_eq!(data.fetched, 2);
        assert_eq!(data.failed, vec![DateRange::single(date(9))]);
        assert_eq!(data.unfilled, vec![DateRange::single(date(9))]);
        assert_eq!(data.filled_gaps, vec![DateRange::single(date(8)), DateRange::single(date(10))]);
        assert_eq!(store.len().await, 2);

        // The next call only asks for the failed day.
        let again = service
            .ensure(AssetType::PkEquity, &symbol, range, FetchOptions::default())
            .await
            .unwrap();
        assert_eq!(source.calls.load(Ordering::SeqCst), 4);
        assert_eq!(again.len(), 2);
    }

    #[tokio::test]
    async fn test_future_range_short_circuits() {
        let source = Arc::new(DailySource::default());
        let (service, _) = service(Some(source.clone()));
        let range = DateRange::new(date(20), date(25)).unwrap();

        let data = service
            .ensure(AssetType::PkEquity, &Symbol::new("OGDC"), range, FetchOptions::default())
            .await
            .unwrap();
        assert!(data.is_empty());

        // 2024-01-06 and 07 are a weekend.
        let weekend = DateRange::new(date(6), date(7)).unwrap();
        service
            .ensure(AssetType::PkEquity, &Symbol::new("OGDC"), weekend, FetchOptions::default())
            .await
            .unwrap();
        assert_eq!(source.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_without_source_reports_gaps() {
        let (service, store) = service(None);
        let stored = TimeSeriesRecord::new(AssetType::PkEquity, Symbol::new("OGDC"), date(8), 1.0);
        store.upsert(&[stored]).await.unwrap();
        let range = DateRange::new(date(8), date(10)).unwrap();

        let data = service
            .ensure(AssetType::PkEquity, &Symbol::new("OGDC"), range, FetchOptions::default())
            .await
            .unwrap();
        assert_eq!(data.len(), 1);
        assert_eq!(data.source, DataOrigin::Database);
        assert_eq!(data.unfilled, vec![DateRange::new(date(9), date(10)).unwrap()]);
    }

    #[tokio::test]
    async fn test_refresh_revalidates_last_trading_day() {
        let source = Arc::new(DailySource::default());
        let (service, _) = service(Some(source.clone()));
        let symbol = Symbol::new("OGDC");
        let range = DateRange::new(date(10), date(12)).unwrap();

        service
            .ensure(AssetType::PkEquity, &symbol, range, FetchOptions::default())
            .await
            .unwrap();
        assert_eq!(source.calls.load(Ordering::SeqCst), 3);

        let data = service
            .ensure(AssetType::PkEquity, &symbol, range, FetchOptions::refresh())
            .await
            .unwrap();
        assert_eq!(source.calls.load(Ordering::SeqCst), 4);
        assert_eq!(data.filled_gaps, vec![DateRange::single(date(12))]);
        assert!(data.unfilled.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_source_times_out() {
        let source = Arc::new(DailySource {
            stall: true,
            ..Default::default()
        });
        let (service, _) = service(Some(source));
        let service = service.with_config(
            BackfillConfig::default()
                .with_wave_delay(Duration::ZERO)
                .with_fetch_timeout(Duration::from_secs(5)),
        );

        let data = service
            .ensure(
                AssetType::PkEquity,
                &Symbol::new("OGDC"),
                DateRange::single(date(11)),
                FetchOptions::default(),
            )
            .await
            .unwrap();
        assert!(data.is_empty());
        assert_eq!(data.failed, vec![DateRange::single(date(11))]);
    }

    #[tokio::test]
    async fn test_refetch_overwrites_stored_days() {
        let source = Arc::new(DailySource::default());
        let (service, store) = service(Some(source.clone()));
        let symbol = Symbol::new("OGDC");
        let stale: Vec<_> = [8, 9, 10]
            .into_iter()
            .map(|d| TimeSeriesRecord::new(AssetType::PkEquity, symbol.clone(), date(d), 1.0))
            .collect();
        store.upsert(&stale).await.unwrap();
        let range = DateRange::new(date(8), date(10)).unwrap();

        let kept = service
            .ensure(AssetType::PkEquity, &symbol, range, FetchOptions::default())
            .await
            .unwrap();
        assert_eq!(source.calls.load(Ordering::SeqCst), 0);
        assert_eq!(kept.source, DataOrigin::Database);

        let data = service
            .refetch(AssetType::PkEquity, &symbol, range)
            .await
            .unwrap();
        assert_eq!(source.calls.load(Ordering::SeqCst), 3);
        assert_eq!(data.fetched, 3);
        assert_eq!(data.source, DataOrigin::Api);
        let closes: Vec<f64> = data.records.iter().map(|r| r.close).collect();
        assert_eq!(closes, vec![8.0, 9.0, 10.0]);

        let stored = store
            .read_range(AssetType::PkEquity, &symbol, date(8), date(10))
            .await
            .unwrap();
        assert_eq!(stored, data.records);
    }

    #[test]
    fn test_backfill_start() {
        assert_eq!(backfill_start(date(19), None, 14), date(5));
        assert_eq!(backfill_start(date(19), Some(date(2)), 14), date(2));
        assert_eq!(backfill_start(date(19), Some(date(25)), 14), date(19));
        assert_eq!(backfill_start(date(19), None, u32::MAX), NaiveDate::MIN);
    }

    #[tokio::test]
    async fn test_cached_read_drops_failed_results() {
        let source = Arc::new(DailySource {
            fail_on: Some(date(9)),
            ..Default::default()
        });
        let (service, _) = service(Some(source.clone()));
        let symbol = Symbol::new("OGDC");
        let range = DateRange::new(date(8), date(9)).unwrap();

        let first = service
            .ensure_historical_data(AssetType::PkEquity, &symbol, range, FetchOptions::default())
            .await
            .unwrap();
        assert_eq!(first.status(), "MISS");
        assert_eq!(first.value.failed, vec![DateRange::single(date(9))]);
        assert!(service.cache.is_empty());

        let second = service
            .ensure_historical_data(AssetType::PkEquity, &symbol, range, FetchOptions::default())
            .await
            .unwrap();
        assert_eq!(second.status(), "MISS");
        assert_eq!(source.calls.load(Ordering::SeqCst), 3);
    }
}
