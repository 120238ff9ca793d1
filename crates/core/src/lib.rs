//! Core types for wayback, a history-aware TTL cache.
//!
//! This crate provides:
//! - The [`Cache`] orchestrator and its JSON catalog
//! - Expiration scheduling and an injectable clock
//! - The [`Fetcher`] seam implemented by HTTP clients
//! - Unified error and configuration types

pub mod cache;
pub mod clock;
pub mod config;
pub mod error;
pub mod fetch;

pub use cache::{Cache, CatalogRecord, FsStorage, HistoryState, StateMeta, Storage};
pub use clock::{Clock, Expire, ManualClock, SystemClock};
pub use config::{CacheConfig, ConfigError, RateLimitConfig};
pub use error::Error;
pub use fetch::{FetchOutcome, Fetcher};
