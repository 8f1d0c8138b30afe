//! Batch Price Orchestrator.
//!
//! Resolves many `(asset type, symbol)` pairs at once: fresh rows come from
//! the store, stale ones from the live sources (bulk where the source has a
//! bulk endpoint), and failures fall back to the last stored row. Every
//! requested key yields exactly one entry.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt, join_all};
use serde::{Deserialize, Serialize};
use tokio::time::timeout;
use tracing::{debug, info, instrument, warn};

use market_cache::{CacheStore, Cached, TtlConfig, TtlPolicy, cache_key};
use market_core::{
    AssetType, DataError, DataOrigin, FetchOptions, LiveQuote, MarketCalendar, PriceQuote,
    QuoteSource, RecordStore, Result, Symbol, TimeSeriesRecord,
};

use crate::config::BatchConfig;
use crate::registry::SourceRegistry;

const CACHE_NAMESPACE: &str = "price";

/// One item of a batch request.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PriceRequest {
    /// Asset class.
    pub asset_type: AssetType,
    /// Instrument symbol.
    pub symbol: Symbol,
}

impl PriceRequest {
    /// Create a request.
    #[must_use]
    pub fn new(asset_type: AssetType, symbol: impl Into<Symbol>) -> Self {
        Self {
            asset_type,
            symbol: symbol.into(),
        }
    }

    /// Result map key, `asset-type:SYMBOL`.
    #[must_use]
    pub fn key(&self) -> String {
        format!("{}:{}", self.asset_type, self.symbol)
    }
}

impl fmt::Display for PriceRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.asset_type, self.symbol)
    }
}

impl FromStr for PriceRequest {
    type Err = DataError;

    /// Parses `asset-type:SYMBOL`.
    fn from_str(s: &str) -> Result<Self> {
        let (asset, symbol) = s.split_once(':').ok_or_else(|| {
            DataError::InvalidParameter(format!("Expected asset-type:SYMBOL, got {s}"))
        })?;
        if symbol.trim().is_empty() {
            return Err(DataError::InvalidParameter(format!("Missing symbol in {s}")));
        }
        Ok(Self::new(asset.parse()?, symbol))
    }
}

/// Result of one batch item.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PriceOutcome {
    /// A price, tagged with where it came from.
    Quote(PriceQuote),
    /// No price could be found.
    Failed {
        /// Why.
        error: String,
    },
}

impl PriceOutcome {
    /// The quote, if the item resolved.
    #[must_use]
    pub const fn quote(&self) -> Option<&PriceQuote> {
        match self {
            Self::Quote(quote) => Some(quote),
            Self::Failed { .. } => None,
        }
    }

    /// Returns true for an error entry.
    #[must_use]
    pub const fn is_failed(&self) -> bool {
        matches!(self, Self::Failed { .. })
    }
}

/// Live fetch results keyed by request.
type LiveResults = Vec<(PriceRequest, Result<Option<LiveQuote>>)>;

/// Resolves current prices for batches of instruments.
///
/// Cloning is cheap; clones share the store, sources and cache.
#[derive(Clone)]
pub struct BatchPriceService {
    store: Arc<dyn RecordStore>,
    sources: Arc<SourceRegistry>,
    cache: CacheStore,
    policy: TtlPolicy,
    config: BatchConfig,
}

impl fmt::Debug for BatchPriceService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BatchPriceService")
            .field("store", &self.store)
            .field("sources", &self.sources)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl BatchPriceService {
    /// Create a service with the system calendar and default settings.
    #[must_use]
    pub fn new(store: Arc<dyn RecordStore>, sources: Arc<SourceRegistry>) -> Self {
        let calendar = MarketCalendar::system();
        Self {
            store,
            sources,
            cache: CacheStore::with_clock(Arc::clone(calendar.clock())),
            policy: TtlPolicy::new(calendar, TtlConfig::default()),
            config: BatchConfig::default(),
        }
    }

    /// Use `cache` for [`latest_price`](Self::latest_price).
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

    /// Use `config` for timeouts and staleness.
    #[must_use]
    pub fn with_config(mut self, config: BatchConfig) -> Self {
        self.config = config;
        self
    }

    /// Resolves every item to a price or an error entry.
    ///
    /// Keys are `asset-type:SYMBOL`; duplicate items share one entry.
    #[instrument(skip(self, items), fields(count = items.len(), refresh = options.refresh))]
    pub async fn fetch_batch(
        &self,
        items: &[PriceRequest],
        options: FetchOptions,
    ) -> BTreeMap<String, PriceOutcome> {
        let mut unique: Vec<PriceRequest> = items.to_vec();
        unique.sort();
        unique.dedup();

        let classified =
            join_all(unique.into_iter().map(|item| self.read_fresh(item, options))).await;

        let mut results = BTreeMap::new();
        let mut stale: BTreeMap<AssetType, Vec<Symbol>> = BTreeMap::new();
        for (item, fresh) in classified {
            match fresh {
                Some(quote) => {
                    results.insert(item.key(), PriceOutcome::Quote(quote));
                }
                None => stale.entry(item.asset_type).or_default().push(item.symbol),
            }
        }
        debug!(
            fresh = results.len(),
            stale = stale.values().map(Vec::len).sum::<usize>(),
            "Classified batch"
        );

        let live: LiveResults = join_all(self.live_fetches(stale))
            .await
            .into_iter()
            .flatten()
            .collect();

        let mut write_back = Vec::new();
        let mut fallbacks = Vec::new();
        for (item, result) in live {
            match result {
                Ok(Some(quote)) => {
                    write_back.push(TimeSeriesRecord::new(
                        item.asset_type,
                        item.symbol.clone(),
                        quote.date,
                        quote.price,
                    ));
                    results.insert(
                        item.key(),
                        PriceOutcome::Quote(PriceQuote {
                            asset_type: item.asset_type,
                            symbol: item.symbol,
                            price: quote.price,
                            date: quote.date,
                            source: DataOrigin::Api,
                        }),
                    );
                }
                Ok(None) => fallbacks.push((item, None)),
                Err(e) => {
                    warn!(item = %item, error = %e, "Live fetch failed");
                    fallbacks.push((item, Some(e)));
                }
            }
        }

        let resolved = join_all(
            fallbacks
                .into_iter()
                .map(|(item, error)| self.fallback(item, error)),
        )
        .await;
        results.extend(resolved);

        self.spawn_write_back(write_back);
        results
    }

    /// Reads today's stored row; `Some` if it is fresh enough to serve.
    async fn read_fresh(
        &self,
        item: PriceRequest,
        options: FetchOptions,
    ) -> (PriceRequest, Option<PriceQuote>) {
        if options.refresh {
            return (item, None);
        }

        let calendar = self.policy.calendar();
        let today = calendar.today(item.asset_type.market());
        let staleness = item
            .asset_type
            .staleness(self.config.intraday_max_age());

        match self
            .store
            .read_today(item.asset_type, &item.symbol, today)
            .await
        {
            Ok(Some(row)) if !staleness.is_stale(row.age(calendar.now())) => {
                let quote = PriceQuote {
                    asset_type: item.asset_type,
                    symbol: item.symbol.clone(),
                    price: row.price,
                    date: today,
                    source: DataOrigin::Database,
                };
                (item, Some(quote))
            }
            Ok(_) => (item, None),
            Err(e) => {
                warn!(item = %item, error = %e, "Reading today's row failed");
                (item, None)
            }
        }
    }

    /// One future per bulk group or individual item.
    fn live_fetches(
        &self,
        stale: BTreeMap<AssetType, Vec<Symbol>>,
    ) -> Vec<BoxFuture<'_, LiveResults>> {
        let mut fetches: Vec<BoxFuture<'_, LiveResults>> = Vec::new();

        for (asset_type, symbols) in stale {
            let Some(source) = self.sources.quote(asset_type) else {
                let results = symbols
                    .into_iter()
                    .map(|symbol| {
                        let error = DataError::ProviderNotConfigured(format!(
                            "No quote source for {asset_type}"
                        ));
                        (PriceRequest::new(asset_type, symbol), Err(error))
                    })
                    .collect();
                fetches.push(futures::future::ready(results).boxed());
                continue;
            };

            if source.supports_bulk() {
                fetches.push(self.fetch_bulk(source, asset_type, symbols).boxed());
            } else {
                for symbol in symbols {
                    fetches.push(
                        self.fetch_single(Arc::clone(&source), asset_type, symbol)
                            .boxed(),
                    );
                }
            }
        }

        fetches
    }

    async fn fetch_bulk(
        &self,
        source: Arc<dyn QuoteSource>,
        asset_type: AssetType,
        symbols: Vec<Symbol>,
    ) -> LiveResults {
        let limit = self.config.fetch_timeout();
        let today = self.policy.calendar().today(asset_type.market());
        let now = self.policy.calendar().now();
        debug!(
            provider = source.name(),
            asset_type = %asset_type,
            count = symbols.len(),
            "Bulk fetch"
        );

        let result = match timeout(limit, source.fetch_bulk(asset_type, &symbols)).await {
            Ok(result) => result,
            Err(_) => Err(DataError::Timeout(limit)),
        };

        match result {
            Ok(prices) => symbols
                .into_iter()
                .map(|symbol| {
                    let quote = prices.get(&symbol).map(|price| LiveQuote {
                        price: *price,
                        date: today,
                        as_of: now,
                    });
                    (PriceRequest::new(asset_type, symbol), Ok(quote))
                })
                .collect(),
            Err(e) => symbols
                .into_iter()
                .map(|symbol| (PriceRequest::new(asset_type, symbol), Err(e.clone())))
                .collect(),
        }
    }

    async fn fetch_single(
        &self,
        source: Arc<dyn QuoteSource>,
        asset_type: AssetType,
        symbol: Symbol,
    ) -> LiveResults {
        let limit = self.config.fetch_timeout();
        let result = match timeout(limit, source.fetch_quote(asset_type, &symbol)).await {
            Ok(result) => result,
            Err(_) => Err(DataError::Timeout(limit)),
        };
        vec![(PriceRequest::new(asset_type, symbol), result)]
    }

    /// Serves the latest stored row, or an error entry.
    async fn fallback(
        &self,
        item: PriceRequest,
        error: Option<DataError>,
    ) -> (String, PriceOutcome) {
        let outcome = match self.store.read_latest(item.asset_type, &item.symbol).await {
            Ok(Some(record)) => {
                debug!(item = %item, date = %record.date, "Serving stored fallback");
                PriceOutcome::Quote(PriceQuote::from_record(&record, DataOrigin::DatabaseFallback))
            }
            Ok(None) => PriceOutcome::Failed {
                error: error.map_or_else(
                    || format!("No price available for {item}"),
                    |e| e.to_string(),
                ),
            },
            Err(e) => PriceOutcome::Failed {
                error: e.to_string(),
            },
        };
        (item.key(), outcome)
    }

    /// Stores live prices without delaying the response.
    fn spawn_write_back(&self, records: Vec<TimeSeriesRecord>) {
        if records.is_empty() {
            return;
        }
        let store = Arc::clone(&self.store);
        tokio::spawn(async move {
            match store.upsert(&records).await {
                Ok(summary) => debug!(written = summary.written(), "Wrote back live prices"),
                Err(e) => warn!(
                    error = %e,
                    count = records.len(),
                    "Write-back of live prices failed"
                ),
            }
        });
    }

    /// Cached single-item read through [`fetch_batch`](Self::fetch_batch).
    ///
    /// Errors are not cached.
    #[instrument(skip(self), fields(asset_type = %asset_type, symbol = %symbol))]
    pub async fn latest_price(
        &self,
        asset_type: AssetType,
        symbol: &Symbol,
        options: FetchOptions,
    ) -> Result<Cached<PriceQuote>> {
        let key = cache_key(CACHE_NAMESPACE, asset_type, symbol, None, &options);
        let decision = self.policy.decide(asset_type, None, &options);
        let service = self.clone();
        let item = PriceRequest::new(asset_type, symbol.clone());

        let cached = self
            .cache
            .get_or_set(&key, decision, move || async move {
                let key = item.key();
                let mut results = service.fetch_batch(&[item], options).await;
                match results.remove(&key) {
                    Some(PriceOutcome::Quote(quote)) => Ok(quote),
                    Some(PriceOutcome::Failed { error }) => Err(DataError::Other(error)),
                    None => Err(DataError::Other(format!("No result for {key}"))),
                }
            })
            .await?;

        info!(status = cached.status(), source = %cached.value.source, "Latest price served");
        Ok(cached)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_price_request_parsing() {
        let item: PriceRequest = "crypto:btc".parse().unwrap();
        assert_eq!(item, PriceRequest::new(AssetType::Crypto, "BTC"));
        assert_eq!(item.key(), "crypto:BTC");
        assert_eq!(item.to_string(), "crypto:BTC");

        assert!("BTC".parse::<PriceRequest>().is_err());
        assert!("crypto:".parse::<PriceRequest>().is_err());
        assert!("bonds:X".parse::<PriceRequest>().is_err());
    }

    #[test]
    fn test_outcome_serializes_flat() {
        let failed = PriceOutcome::Failed {
            error: "nope".into(),
        };
        assert_eq!(
            serde_json::to_value(&failed).unwrap(),
            serde_json::json!({"error": "nope"})
        );
        assert!(failed.is_failed());

        let quote = PriceOutcome::Quote(PriceQuote {
            asset_type: AssetType::Crypto,
            symbol: Symbol::new("BTC"),
            price: 42_000.0,
            date: chrono::NaiveDate::from_ymd_opt(2024, 1, 8).unwrap(),
            source: DataOrigin::Api,
        });
        let json = serde_json::to_value(&quote).unwrap();
        assert_eq!(json["source"], "api");
        assert_eq!(json["asset_type"], "crypto");
        assert_eq!(serde_json::from_value::<PriceOutcome>(json).unwrap(), quote);
    }
}
