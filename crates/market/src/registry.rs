//! Source registry mapping asset types to their history and quote sources.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use market_core::{AssetType, DataSource, HistorySource, QuoteSource};

/// Registry of the sources serving each asset type.
///
/// Each asset type has at most one [`HistorySource`] and one
/// [`QuoteSource`]. Registering a source claims every asset type it lists in
/// [`DataSource::asset_types`], replacing an earlier registration.
///
/// # Example
///
/// ```rust,ignore
/// use market::{AssetType, SourceRegistry};
///
/// let registry = SourceRegistry::new()
///     .with_binance()
///     .with_stockanalysis();
///
/// assert!(registry.history(AssetType::Crypto).is_some());
/// assert!(registry.quote(AssetType::UsEquity).is_none());
/// ```
#[derive(Clone, Default)]
pub struct SourceRegistry {
    history: HashMap<AssetType, Arc<dyn HistorySource>>,
    quotes: HashMap<AssetType, Arc<dyn QuoteSource>>,
}

impl std::fmt::Debug for SourceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SourceRegistry")
            .field("history", &names(&self.history, |s| s.name()))
            .field("quotes", &names(&self.quotes, |s| s.name()))
            .finish()
    }
}

fn names<S: ?Sized>(
    sources: &HashMap<AssetType, Arc<S>>,
    name: impl Fn(&S) -> &str,
) -> Vec<String> {
    let mut names: Vec<String> = sources
        .iter()
        .map(|(asset, source)| format!("{asset}={}", name(source)))
        .collect();
    names.sort();
    names
}

impl SourceRegistry {
    /// Create a new empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a registry with every adapter enabled by crate features.
    #[must_use]
    pub fn with_defaults() -> Self {
        #[allow(unused_mut)]
        let mut registry = Self::new();
        #[cfg(feature = "binance")]
        {
            registry = registry.with_binance();
        }
        #[cfg(feature = "stockanalysis")]
        {
            registry = registry.with_stockanalysis();
        }
        #[cfg(feature = "investing")]
        {
            registry = registry.with_investing();
        }
        registry
    }

    /// Register a history source for every asset type it serves.
    pub fn register_history(&mut self, source: Arc<dyn HistorySource>) {
        for asset_type in source.asset_types() {
            debug!(
                provider = source.name(),
                asset_type = %asset_type,
                "Registering history source"
            );
            self.history.insert(*asset_type, Arc::clone(&source));
        }
    }

    /// Register a quote source for every asset type it serves.
    pub fn register_quote(&mut self, source: Arc<dyn QuoteSource>) {
        for asset_type in source.asset_types() {
            debug!(provider = source.name(), asset_type = %asset_type, "Registering quote source");
            self.quotes.insert(*asset_type, Arc::clone(&source));
        }
    }

    /// Register a source serving both history and quotes.
    pub fn register<S>(&mut self, source: Arc<S>)
    where
        S: HistorySource + QuoteSource + 'static,
    {
        self.register_history(source.clone());
        self.register_quote(source);
    }

    /// History source of `asset_type`, if any.
    #[must_use]
    pub fn history(&self, asset_type: AssetType) -> Option<Arc<dyn HistorySource>> {
        self.history.get(&asset_type).cloned()
    }

    /// Quote source of `asset_type`, if any.
    #[must_use]
    pub fn quote(&self, asset_type: AssetType) -> Option<Arc<dyn QuoteSource>> {
        self.quotes.get(&asset_type).cloned()
    }

    /// Asset types with a history source, sorted.
    #[must_use]
    pub fn history_asset_types(&self) -> Vec<AssetType> {
        let mut assets: Vec<AssetType> = self.history.keys().copied().collect();
        assets.sort();
        assets
    }

    // Builder methods for the bundled adapters

    /// Add the Binance source (`crypto`).
    #[cfg(feature = "binance")]
    #[must_use]
    pub fn with_binance(mut self) -> Self {
        self.register(Arc::new(market_binance::BinanceProvider::new()));
        self
    }

    /// Add the StockAnalysis source (`pk-equity`, `kse100`).
    #[cfg(feature = "stockanalysis")]
    #[must_use]
    pub fn with_stockanalysis(mut self) -> Self {
        self.register(Arc::new(
            market_stockanalysis::StockAnalysisProvider::new(),
        ));
        self
    }

    /// Add the Investing.com source (`spx500`).
    #[cfg(feature = "investing")]
    #[must_use]
    pub fn with_investing(mut self) -> Self {
        self.register(Arc::new(market_investing::InvestingProvider::new()));
        self
    }
}
