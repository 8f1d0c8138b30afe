#![doc = include_str!("../README.md")]
#![doc(issue_tracker_base_url = "https://github.com/factordynamics/market/issues/")]
#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]
#![warn(missing_docs)]
#![forbid(unsafe_code)]

//! In-memory caching for the market-data layer.
//!
//! - [`CacheStore`] - Key/value cache with expiry and request coalescing
//! - [`TtlPolicy`] - TTLs from asset class, history and market state
//! - [`cache_key`] / [`range_key`] - Deterministic cache keys

/// In-memory cache store.
pub mod memory;
/// Cache keys and TTL policy.
pub mod policy;

pub use memory::{CacheStore, Cached};
pub use policy::{TtlConfig, TtlContext, TtlDecision, TtlPolicy, cache_key, range_key};
