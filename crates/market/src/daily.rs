//! "Once per trading day" gate for periodic checks.
//!
//! Markers live in the cache under a key that includes the market's local
//! date, with a TTL ending at local midnight, so every check reopens on the
//! next day.

use std::future::Future;

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, instrument};

use market_cache::{CacheStore, TtlDecision, TtlPolicy, cache_key};
use market_core::{AssetType, DataError, FetchOptions, Result, Symbol};

/// Gate recording which checks already ran today.
#[derive(Clone, Debug)]
pub struct DailyCheckGate {
    cache: CacheStore,
    policy: TtlPolicy,
}

impl DailyCheckGate {
    /// Create a gate storing markers in `cache`.
    #[must_use]
    pub const fn new(cache: CacheStore, policy: TtlPolicy) -> Self {
        Self { cache, policy }
    }

    fn key(&self, asset_type: AssetType, check: &str, symbol: &Symbol) -> String {
        let today = self.policy.calendar().today(asset_type.market());
        cache_key(
            &format!("daily:{check}"),
            asset_type,
            symbol,
            Some(today),
            &FetchOptions::default(),
        )
    }

    fn decision(&self, asset_type: AssetType) -> TtlDecision {
        TtlDecision::fixed(self.policy.daily_marker_ttl(asset_type.market()))
    }

    /// Returns true if `check` already ran today for `symbol`.
    #[must_use]
    pub fn is_checked(&self, asset_type: AssetType, check: &str, symbol: &Symbol) -> bool {
        matches!(
            self.cache.get::<Value>(&self.key(asset_type, check, symbol)),
            Ok(Some(_))
        )
    }

    /// Records that `check` ran today for `symbol`.
    pub fn mark_checked(&self, asset_type: AssetType, check: &str, symbol: &Symbol) -> Result<()> {
        let key = self.key(asset_type, check, symbol);
        debug!(key = %key, "Marking check done");
        self.cache
            .set_with_policy(&key, &Value::Bool(true), self.decision(asset_type))
    }

    /// Runs `f` unless `check` already ran today for `symbol`.
    ///
    /// Returns `None` when skipped. The marker is only set once `f`
    /// succeeds; concurrent calls share one run of `f`.
    #[instrument(skip(self, f), fields(asset_type = %asset_type, symbol = %symbol))]
    pub async fn run_once_per_day<T, F, Fut>(
        &self,
        asset_type: AssetType,
        check: &str,
        symbol: &Symbol,
        f: F,
    ) -> Result<Option<T>>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        if self.is_checked(asset_type, check, symbol) {
            debug!("Already checked today, skipping");
            return Ok(None);
        }

        let key = self.key(asset_type, check, symbol);
        let cached = self
            .cache
            .get_or_set(&key, self.decision(asset_type), move || {
                let run = f();
                async move {
                    let value = run.await?;
                    serde_json::to_value(&value).map_err(|e| DataError::Parse(e.to_string()))
                }
            })
            .await?;

        if cached.from_cache {
            return Ok(None);
        }
        serde_json::from_value(cached.value)
            .map(Some)
            .map_err(|e| DataError::Parse(e.to_string()))
    }
}
