//! Metrics Collection Module
//!
//! Lock-free counters for one cache namespace: lookups, coalescing, write
//! failures and eviction activity. Snapshots are serializable so the CLI and
//! embedding applications can report them as JSON.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

/// Point-in-time copy of a namespace's counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheMetrics {
    pub cache_hits: u64,
    pub cache_misses: u64,
    /// Filled in by the cache facade from its fetch coalescer
    pub coalesced_waits: u64,
    pub producer_failures: u64,
    pub write_failures: u64,
    pub entries_written: u64,
    pub bytes_written: u64,
    pub scans: u64,
    pub scan_failures: u64,
    pub eviction_passes: u64,
    pub files_evicted: u64,
    pub bytes_evicted: u64,
    pub last_eviction_at: Option<DateTime<Utc>>,
}

impl CacheMetrics {
    /// Hit rate over all lookups, 0.0 when nothing was looked up.
    pub fn hit_rate_percent(&self) -> f64 {
        let total = self.cache_hits + self.cache_misses;
        if total == 0 {
            0.0
        } else {
            self.cache_hits as f64 * 100.0 / total as f64
        }
    }
}

/// Shared, concurrently updated counters
#[derive(Debug, Default)]
pub struct MetricsRecorder {
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    producer_failures: AtomicU64,
    write_failures: AtomicU64,
    entries_written: AtomicU64,
    bytes_written: AtomicU64,
    scans: AtomicU64,
    scan_failures: AtomicU64,
    eviction_passes: AtomicU64,
    files_evicted: AtomicU64,
    bytes_evicted: AtomicU64,
    last_eviction_at: Mutex<Option<DateTime<Utc>>>,
}

impl MetricsRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_hit(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_miss(&self) {
        self.cache_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_producer_failure(&self) {
        self.producer_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_write_failure(&self) {
        self.write_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_write(&self, bytes: u64) {
        self.entries_written.fetch_add(1, Ordering::Relaxed);
        self.bytes_written.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_scan(&self, success: bool) {
        self.scans.fetch_add(1, Ordering::Relaxed);
        if !success {
            self.scan_failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_eviction(&self, files: u64, bytes: u64) {
        self.eviction_passes.fetch_add(1, Ordering::Relaxed);
        self.files_evicted.fetch_add(files, Ordering::Relaxed);
        self.bytes_evicted.fetch_add(bytes, Ordering::Relaxed);
        let mut last = self
            .last_eviction_at
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *last = Some(Utc::now());
    }

    pub fn snapshot(&self) -> CacheMetrics {
        let last_eviction_at = *self
            .last_eviction_at
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        CacheMetrics {
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
            coalesced_waits: 0,
            producer_failures: self.producer_failures.load(Ordering::Relaxed),
            write_failures: self.write_failures.load(Ordering::Relaxed),
            entries_written: self.entries_written.load(Ordering::Relaxed),
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
            scans: self.scans.load(Ordering::Relaxed),
            scan_failures: self.scan_failures.load(Ordering::Relaxed),
            eviction_passes: self.eviction_passes.load(Ordering::Relaxed),
            files_evicted: self.files_evicted.load(Ordering::Relaxed),
            bytes_evicted: self.bytes_evicted.load(Ordering::Relaxed),
            last_eviction_at,
        }
    }
}
