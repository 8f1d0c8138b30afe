//! Error types for market-data operations.
//!
//! This module defines [`DataError`] which covers every failure that can occur
//! while fetching, parsing, caching or persisting time-series data.

use thiserror::Error;

/// Errors that can occur during market-data operations.
///
/// The enum is `Clone` so that a single failed computation can be handed to
/// every caller that was waiting on it.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DataError {
    /// Network-related errors (connection failures, non-success status, etc.).
    #[error("Network error: {0}")]
    Network(String),

    /// A source call exceeded its time budget.
    #[error("Timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// Rate limit exceeded by a provider.
    #[error("Rate limited by {provider}: retry after {retry_after:?}")]
    RateLimited {
        /// The provider that rate limited the request.
        provider: String,
        /// Suggested time to wait before retrying.
        retry_after: Option<std::time::Duration>,
    },

    /// The provider answered with an anti-bot challenge page instead of data.
    #[error("Request blocked by {provider}: received a challenge page")]
    Blocked {
        /// The provider that served the challenge.
        provider: String,
    },

    /// The requested symbol was not found.
    #[error("Symbol not found: {0}")]
    SymbolNotFound(String),

    /// Data is not available for the requested symbol and date range.
    #[error("Data not available for {symbol} in range {start} to {end}")]
    DataNotAvailable {
        /// The symbol that was requested.
        symbol: String,
        /// Start of the requested date range.
        start: String,
        /// End of the requested date range.
        end: String,
    },

    /// Error parsing data from a provider or decoding a cached value.
    #[error("Parse error: {0}")]
    Parse(String),

    /// Error reading from or writing to the persistent store.
    #[error("Store error: {0}")]
    Store(String),

    /// No source is registered for the requested asset type.
    #[error("Provider not configured: {0}")]
    ProviderNotConfigured(String),

    /// An invalid parameter was provided.
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    /// The requested feature is not supported.
    #[error("Feature not supported: {0}")]
    NotSupported(String),

    /// Any other error.
    #[error("{0}")]
    Other(String),
}

impl DataError {
    /// Returns true for failures that a later attempt may not hit again.
    ///
    /// Transient failures leave the affected unit missing so the next call
    /// picks it up.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Network(_) | Self::Timeout(_) | Self::RateLimited { .. } | Self::Blocked { .. }
        )
    }
}

/// Result type alias using [`DataError`].
pub type Result<T> = std::result::Result<T, DataError>;
