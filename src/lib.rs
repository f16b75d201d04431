//! Media Disk Cache - bounded on-disk content caches for a media-server client
//!
//! This library provides the caching engine behind the client's page-image,
//! thumbnail and downloaded-book caches: keyed file storage, an in-memory size
//! ledger, single-flight fetch coalescing and watermark-based eviction.

pub mod cache;
pub mod cache_set;
pub mod cache_types;
pub mod config;
pub mod entry_store;
pub mod error;
pub mod eviction;
pub mod inflight_tracker;
pub mod logging;
pub mod metrics;
pub mod namespace;
pub mod size_ledger;

pub use cache::{BookFileCache, DiskCache, PageCache, ThumbnailCache};
pub use error::{CacheError, Result};
