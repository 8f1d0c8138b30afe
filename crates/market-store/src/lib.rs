#![doc = include_str!("../README.md")]
#![doc(issue_tracker_base_url = "https://github.com/factordynamics/market/issues/")]
#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]
#![warn(missing_docs)]
#![forbid(unsafe_code)]

//! Persistent stores for time-series records.
//!
//! This crate provides implementations of the [`RecordStore`] trait from `market-core`:
//!
//! - [`SqliteStore`] - SQLite-backed store (default, requires `sqlite` feature)
//! - [`MemoryStore`] - In-memory store for tests and ephemeral use

/// In-memory store implementation.
pub mod memory;

/// SQLite-backed store implementation.
#[cfg(feature = "sqlite")]
pub mod sqlite;

mod merge;

// Re-export the trait for convenience
pub use market_core::RecordStore;

pub use memory::MemoryStore;

#[cfg(feature = "sqlite")]
pub use sqlite::SqliteStore;
