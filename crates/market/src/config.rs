//! Service configuration.
//!
//! Every section deserializes with defaults for absent fields, so a JSON file
//! only needs the values it overrides:
//!
//! ```json
//! { "backfill": { "concurrency": 3 }, "ttl": { "live_ms": 30000 } }
//! ```

use market_cache::TtlConfig;
use market_core::{DataError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Pacing of the Historical Data Service.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackfillConfig {
    /// Chunks dispatched per wave.
    pub concurrency: usize,
    /// Pause between waves in milliseconds.
    pub wave_delay_ms: u64,
    /// Ceiling on one adapter call in milliseconds.
    pub fetch_timeout_ms: u64,
    /// Largest chunk in days. `None` uses the source's own limit.
    pub max_days_per_chunk: Option<usize>,
    /// History length fetched by a full backfill when the source does not
    /// know its earliest date.
    pub default_lookback_days: u32,
}

impl Default for BackfillConfig {
    fn default() -> Self {
        Self {
            concurrency: 5,
            wave_delay_ms: 500,
            fetch_timeout_ms: 30_000,
            max_days_per_chunk: None,
            default_lookback_days: 365 * 5,
        }
    }
}

impl BackfillConfig {
    /// Pause between waves.
    #[must_use]
    pub const fn wave_delay(&self) -> Duration {
        Duration::from_millis(self.wave_delay_ms)
    }

    /// Ceiling on one adapter call.
    #[must_use]
    pub const fn fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.fetch_timeout_ms)
    }

    /// Sets the chunks dispatched per wave (at least one).
    #[must_use]
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// Sets the pause between waves.
    #[must_use]
    pub fn with_wave_delay(mut self, delay: Duration) -> Self {
        self.wave_delay_ms = millis(delay);
        self
    }

    /// Sets the ceiling on one adapter call.
    #[must_use]
    pub fn with_fetch_timeout(mut self, timeout: Duration) -> Self {
        self.fetch_timeout_ms = millis(timeout);
        self
    }

    /// Caps chunks at `days` regardless of the source's limit.
    #[must_use]
    pub fn with_max_days_per_chunk(mut self, days: usize) -> Self {
        self.max_days_per_chunk = Some(days.max(1));
        self
    }
}

/// Behaviour of the Batch Price Orchestrator.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    /// Ceiling on one live fetch (single or bulk) in milliseconds.
    pub fetch_timeout_ms: u64,
    /// Age after which an intraday asset's row for today is refetched.
    pub intraday_max_age_ms: u64,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            fetch_timeout_ms: 15_000,
            intraday_max_age_ms: 15 * 60 * 1000,
        }
    }
}

impl BatchConfig {
    /// Ceiling on one live fetch.
    #[must_use]
    pub const fn fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.fetch_timeout_ms)
    }

    /// Age after which an intraday asset's row for today is refetched.
    #[must_use]
    pub const fn intraday_max_age(&self) -> Duration {
        Duration::from_millis(self.intraday_max_age_ms)
    }

    /// Sets the ceiling on one live fetch.
    #[must_use]
    pub fn with_fetch_timeout(mut self, timeout: Duration) -> Self {
        self.fetch_timeout_ms = millis(timeout);
        self
    }

    /// Sets the intraday staleness age.
    #[must_use]
    pub fn with_intraday_max_age(mut self, age: Duration) -> Self {
        self.intraday_max_age_ms = millis(age);
        self
    }
}

/// Top-level configuration.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MarketConfig {
    /// Historical backfill pacing.
    pub backfill: BackfillConfig,
    /// Batch price behaviour.
    pub batch: BatchConfig,
    /// Cache TTLs.
    pub ttl: TtlConfig,
}

impl MarketConfig {
    /// Parses a JSON document.
    pub fn from_json_str(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| DataError::InvalidParameter(format!("config: {e}")))
    }

    /// Reads and parses a JSON file.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)
            .map_err(|e| DataError::InvalidParameter(format!("{}: {e}", path.display())))?;
        Self::from_json_str(&json)
    }

    /// Replaces the backfill section.
    #[must_use]
    pub fn with_backfill(mut self, backfill: BackfillConfig) -> Self {
        self.backfill = backfill;
        self
    }

    /// Replaces the batch section.
    #[must_use]
    pub fn with_batch(mut self, batch: BatchConfig) -> Self {
        self.batch = batch;
        self
    }

    /// Replaces the TTL section.
    #[must_use]
    pub fn with_ttl(mut self, ttl: TtlConfig) -> Self {
        self.ttl = ttl;
        self
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config = MarketConfig::from_json_str(
            r#"{"backfill": {"concurrency": 3, "max_days_per_chunk": 30}, "batch": {"fetch_timeout_ms": 500}}"#,
        )
        .unwrap();

        assert_eq!(config.backfill.concurrency, 3);
        assert_eq!(config.backfill.max_days_per_chunk, Some(30));
        assert_eq!(config.backfill.wave_delay(), Duration::from_millis(500));
        assert_eq!(config.batch.fetch_timeout(), Duration::from_millis(500));
        assert_eq!(config.batch.intraday_max_age(), Duration::from_secs(15 * 60));
        assert_eq!(config.ttl, TtlConfig::default());
    }

    #[test]
    fn test_invalid_json_is_rejected() {
        let err = MarketConfig::from_json_str("{not json").unwrap_err();
        assert!(matches!(err, DataError::InvalidParameter(_)));

        let err = MarketConfig::from_path("/definitely/not/here.json").unwrap_err();
        assert!(matches!(err, DataError::InvalidParameter(_)));
    }

    #[test]
    fn test_builders() {
        let backfill = BackfillConfig::default()
            .with_concurrency(0)
            .with_wave_delay(Duration::ZERO)
            .with_fetch_timeout(Duration::from_secs(2));
        assert_eq!(backfill.concurrency, 1);
        assert_eq!(backfill.wave_delay(), Duration::ZERO);
        assert_eq!(backfill.fetch_timeout_ms, 2000);

        let config = MarketConfig::default().with_backfill(backfill.clone());
        assert_eq!(config.backfill, backfill);
    }
}
