//! Wiring of the services around one store, cache and calendar.

use std::sync::Arc;

use market_cache::{CacheStore, TtlPolicy};
use market_core::{MarketCalendar, RecordStore};

use crate::batch::BatchPriceService;
use crate::config::MarketConfig;
use crate::daily::DailyCheckGate;
use crate::historical::HistoricalDataService;
use crate::registry::SourceRegistry;

/// The market-data layer: historical reads, batch prices and daily checks
/// sharing one store, one source registry and one cache.
///
/// # Example
///
/// ```rust,ignore
/// use std::sync::Arc;
/// use market::{AssetType, DateRange, FetchOptions, MarketConfig, MarketData, SourceRegistry, Symbol};
/// use market::SqliteStore;
///
/// let store = Arc::new(SqliteStore::new("market.db")?);
/// let market = MarketData::new(store, SourceRegistry::with_defaults(), MarketConfig::default());
///
/// let data = market
///     .historical()
///     .ensure_historical_data(AssetType::PkEquity, &Symbol::new("OGDC"), range, FetchOptions::default())
///     .await?;
/// println!("{} records ({})", data.value.len(), data.status());
/// ```
#[derive(Clone, Debug)]
pub struct MarketData {
    cache: CacheStore,
    historical: HistoricalDataService,
    batch: BatchPriceService,
    daily: DailyCheckGate,
}

impl MarketData {
    /// Wire the services with the system calendar.
    #[must_use]
    pub fn new(store: Arc<dyn RecordStore>, sources: SourceRegistry, config: MarketConfig) -> Self {
        Self::with_calendar(store, sources, config, MarketCalendar::system())
    }

    /// Wire the services with `calendar`; its clock also drives cache expiry.
    #[must_use]
    pub fn with_calendar(
        store: Arc<dyn RecordStore>,
        sources: SourceRegistry,
        config: MarketConfig,
        calendar: MarketCalendar,
    ) -> Self {
        let cache = CacheStore::with_clock(Arc::clone(calendar.clock()));
        let policy = TtlPolicy::new(calendar, config.ttl);
        let sources = Arc::new(sources);

        let historical = HistoricalDataService::new(Arc::clone(&store), Arc::clone(&sources))
            .with_cache(cache.clone())
            .with_policy(policy.clone())
            .with_config(config.backfill);
        let batch = BatchPriceService::new(store, sources)
            .with_cache(cache.clone())
            .with_policy(policy.clone())
            .with_config(config.batch);
        let daily = DailyCheckGate::new(cache.clone(), policy);

        Self {
            cache,
            historical,
            batch,
            daily,
        }
    }

    /// Historical Data Service.
    #[must_use]
    pub const fn historical(&self) -> &HistoricalDataService {
        &self.historical
    }

    /// Batch Price Orchestrator.
    #[must_use]
    pub const fn batch(&self) -> &BatchPriceService {
        &self.batch
    }

    /// Daily check gate.
    #[must_use]
    pub const fn daily(&self) -> &DailyCheckGate {
        &self.daily
    }

    /// The shared cache.
    #[must_use]
    pub const fn cache(&self) -> &CacheStore {
        &self.cache
    }
}
