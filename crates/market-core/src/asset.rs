//! Asset classes and the markets they trade on.
//!
//! This module defines [`AssetType`] for the asset classes the data layer
//! tracks, [`Market`] for the trading venue whose calendar governs them, and
//! [`Staleness`] for how quickly a stored "today" row goes out of date.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::error::DataError;

/// Asset class of a tracked instrument.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AssetType {
    /// Equities listed on the Pakistan Stock Exchange.
    PkEquity,
    /// Equities listed on US exchanges.
    UsEquity,
    /// Crypto-currencies quoted against USDT.
    Crypto,
    /// Precious metals.
    Metals,
    /// The KSE-100 index.
    Kse100,
    /// The S&P 500 index.
    Spx500,
    /// Liquidity flows (LIPI) reported per trading day for the PSX.
    Lipi,
}

impl AssetType {
    /// Every asset type, in declaration order.
    pub const ALL: [Self; 7] = [
        Self::PkEquity,
        Self::UsEquity,
        Self::Crypto,
        Self::Metals,
        Self::Kse100,
        Self::Spx500,
        Self::Lipi,
    ];

    /// Returns the kebab-case identifier used in keys and on the wire.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::PkEquity => "pk-equity",
            Self::UsEquity => "us-equity",
            Self::Crypto => "crypto",
            Self::Metals => "metals",
            Self::Kse100 => "kse100",
            Self::Spx500 => "spx500",
            Self::Lipi => "lipi",
        }
    }

    /// Returns the market whose calendar governs this asset type.
    #[must_use]
    pub const fn market(&self) -> Market {
        match self {
            Self::PkEquity | Self::Kse100 | Self::Lipi => Market::Psx,
            Self::UsEquity | Self::Spx500 | Self::Metals => Market::Us,
            Self::Crypto => Market::Crypto,
        }
    }

    /// Returns the freshness rule for a stored "today" row of this asset type.
    #[must_use]
    pub const fn staleness(&self, intraday_max_age: Duration) -> Staleness {
        match self {
            Self::Crypto => Staleness::Intraday(intraday_max_age),
            _ => Staleness::DailyCandle,
        }
    }
}

impl fmt::Display for AssetType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AssetType {
    type Err = DataError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|asset| asset.as_str() == wanted)
            .ok_or_else(|| DataError::InvalidParameter(format!("Unknown asset type: {s}")))
    }
}

/// A trading venue with its own timezone and session window.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Market {
    /// Pakistan Stock Exchange (Asia/Karachi).
    #[serde(rename = "PSX")]
    Psx,
    /// US equity exchanges (America/New_York).
    #[serde(rename = "US")]
    Us,
    /// Crypto venues; always open, calendar in UTC.
    #[serde(rename = "crypto")]
    Crypto,
}

impl Market {
    /// Returns the identifier of this market.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Psx => "PSX",
            Self::Us => "US",
            Self::Crypto => "crypto",
        }
    }
}

impl fmt::Display for Market {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Market {
    type Err = DataError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "PSX" => Ok(Self::Psx),
            "US" => Ok(Self::Us),
            "CRYPTO" => Ok(Self::Crypto),
            _ => Err(DataError::InvalidParameter(format!("Unknown market: {s}"))),
        }
    }
}

/// How long a stored row for the current trading day stays trustworthy.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Staleness {
    /// Prices move during the day; the row is stale once older than the age.
    Intraday(Duration),
    /// One candle per day; the row never goes stale once it exists.
    DailyCandle,
}

impl Staleness {
    /// Returns true if a row last updated `age` ago must be refetched.
    #[must_use]
    pub fn is_stale(&self, age: Duration) -> bool {
        match self {
            Self::Intraday(max_age) => age > *max_age,
            Self::DailyCandle => false,
        }
    }
}
