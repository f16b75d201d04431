//! Cache Facade Module
//!
//! `DiskCache<K>` is the single engine behind the page-image, thumbnail and
//! book-file caches. The key type fixes the cache kind and the on-disk layout;
//! everything else (ledger bookkeeping, fetch coalescing, watermark eviction)
//! is shared.
//!
//! # Miss path
//!
//! 1. The entry store is checked for an existing file
//! 2. On a miss the producer runs under the fetch coalescer; the write and the
//!    ledger update happen inside the shared task, so waiters only wake once
//!    the file is on disk
//! 3. Eviction is scheduled in the background when the projected occupancy
//!    crosses the high watermark or the ledger is unknown

use crate::cache_types::{
    BookFileKey, CacheKey, CacheKind, LedgerState, PageKey, SizeInfo, SubtreePrefix, ThumbnailKey,
};
use crate::entry_store::{EntryStore, PriorEntry};
use crate::eviction::{CacheBudget, EvictionEngine, EvictionOutcome, EvictionPolicy};
use crate::inflight_tracker::FetchCoalescer;
use crate::metrics::{CacheMetrics, MetricsRecorder};
use crate::namespace::NamespaceResolver;
use crate::size_ledger::{format_bytes_human, SizeLedger};
use crate::{CacheError, Result};
use bytes::Bytes;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

pub type PageCache = DiskCache<PageKey>;
pub type ThumbnailCache = DiskCache<ThumbnailKey>;
pub type BookFileCache = DiskCache<BookFileKey>;

struct CacheInner<K: CacheKey> {
    instance_id: String,
    store: EntryStore,
    ledger: Arc<SizeLedger>,
    eviction: Arc<EvictionEngine>,
    coalescer: FetchCoalescer<K, PathBuf>,
    metrics: Arc<MetricsRecorder>,
}

/// Bounded on-disk cache for one kind and one server instance
pub struct DiskCache<K: CacheKey> {
    inner: Arc<CacheInner<K>>,
}

impl<K: CacheKey> Clone for DiskCache<K> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K: CacheKey> DiskCache<K> {
    /// Open the namespace for `instance_id` without touching disk beyond a
    /// temp-file sweep. A startup eviction check is scheduled in the
    /// background; it also establishes the ledger.
    pub async fn open(
        instance_id: &str,
        resolver: &dyn NamespaceResolver,
        budget: Arc<dyn CacheBudget>,
        policy: EvictionPolicy,
    ) -> Result<Self> {
        let cache = Self::open_idle(instance_id, resolver, budget, policy).await?;
        cache.inner.eviction.schedule(false);
        Ok(cache)
    }

    /// Like [`DiskCache::open`] but without the startup eviction task.
    pub async fn open_idle(
        instance_id: &str,
        resolver: &dyn NamespaceResolver,
        budget: Arc<dyn CacheBudget>,
        policy: EvictionPolicy,
    ) -> Result<Self> {
        if instance_id.is_empty() {
            return Err(CacheError::InvalidKey(
                "Instance id must not be empty".to_string(),
            ));
        }
        let root = resolver.namespace_root(K::KIND, instance_id);
        let store = EntryStore::new(root);
        store.sweep_temp_files().await;

        let ledger = Arc::new(SizeLedger::new());
        let metrics = Arc::new(MetricsRecorder::new());
        let eviction = Arc::new(EvictionEngine::new(
            K::KIND,
            store.clone(),
            Arc::clone(&ledger),
            budget,
            policy,
            Arc::clone(&metrics),
        ));

        debug!(
            "Opened {} cache for instance '{}' at {:?}",
            K::KIND,
            instance_id,
            store.root()
        );

        Ok(Self {
            inner: Arc::new(CacheInner {
                instance_id: instance_id.to_string(),
                store,
                ledger,
                eviction,
                coalescer: FetchCoalescer::new(),
                metrics,
            }),
        })
    }

    pub fn kind(&self) -> CacheKind {
        K::KIND
    }

    pub fn instance_id(&self) -> &str {
        &self.inner.instance_id
    }

    pub fn root(&self) -> &Path {
        self.inner.store.root()
    }

    /// Where `key` is (or would be) stored. Does not touch disk.
    pub fn path_for(&self, key: &K) -> PathBuf {
        self.inner.store.path(key)
    }

    pub async fn has(&self, key: &K) -> bool {
        self.inner.store.exists(key).await
    }

    /// Return the stored file for `key`, producing and storing it on a miss.
    ///
    /// Concurrent calls for the same key share one producer run and observe
    /// the same outcome. A producer failure leaves the cache unchanged.
    pub async fn ensure<F, Fut>(&self, key: &K, producer: F) -> Result<PathBuf>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<Bytes>> + Send + 'static,
    {
        if self.inner.store.exists(key).await {
            self.inner.metrics.record_hit();
            debug!("{} cache hit: {:?}", K::KIND, key);
            return Ok(self.inner.store.path(key));
        }

        self.inner.metrics.record_miss();
        debug!("{} cache miss: {:?}", K::KIND, key);
        self.fetch_and_store(key, producer).await
    }

    /// Re-run the producer for `key` even if it is stored, replacing the
    /// payload. Still coalesced with any in-flight fetch for the same key.
    pub async fn refresh<F, Fut>(&self, key: &K, producer: F) -> Result<PathBuf>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<Bytes>> + Send + 'static,
    {
        debug!("{} cache refresh: {:?}", K::KIND, key);
        self.fetch_and_store(key, producer).await
    }

    async fn fetch_and_store<F, Fut>(&self, key: &K, producer: F) -> Result<PathBuf>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<Bytes>> + Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        let task_key = key.clone();

        self.inner
            .coalescer
            .fetch(key, move || async move {
                let data = match producer().await {
                    Ok(data) => data,
                    Err(e) => {
                        inner.metrics.record_producer_failure();
                        debug!("Producer for {:?} failed: {}", task_key, e);
                        return Err(e);
                    }
                };
                inner.store_bytes(&task_key, &data).await?;
                Ok(inner.store.path(&task_key))
            })
            .await
    }

    /// Store `data` under `key` directly, bypassing the coalescer.
    pub async fn store(&self, key: &K, data: &[u8]) -> Result<PathBuf> {
        self.inner.store_bytes(key, data).await?;
        Ok(self.inner.store.path(key))
    }

    /// Read a stored payload, `None` on a miss.
    pub async fn read(&self, key: &K) -> Result<Option<Bytes>> {
        let data = self.inner.store.read(key).await?;
        match data {
            Some(_) => self.inner.metrics.record_hit(),
            None => self.inner.metrics.record_miss(),
        }
        Ok(data)
    }

    /// Remove one entry.
    pub async fn invalidate(&self, key: &K) -> Result<()> {
        self.inner.ledger.begin_mutation();
        match self.inner.store.delete(key).await {
            Ok(outcome) => {
                self.inner.ledger.end_mutation(outcome.ledger_delta());
                Ok(())
            }
            Err(e) => {
                self.inner.ledger.end_mutation(None);
                warn!("Failed to invalidate {:?}, size marked unknown: {}", key, e);
                Err(e)
            }
        }
    }

    /// Remove every entry below `prefix` (one book, one thumbnail type).
    pub async fn invalidate_subtree(&self, prefix: &SubtreePrefix) -> Result<()> {
        self.inner.ledger.begin_mutation();
        match self.inner.store.delete_subtree(prefix).await {
            Ok(removed) => {
                self.inner
                    .ledger
                    .end_mutation(Some((-(removed.bytes as i64), -(removed.files as i64))));
                debug!(
                    "Removed {} files ({}) under {:?} from {} cache",
                    removed.files,
                    format_bytes_human(removed.bytes),
                    prefix.as_path(),
                    K::KIND
                );
                Ok(())
            }
            Err(e) => {
                self.inner.ledger.end_mutation(None);
                warn!(
                    "Failed to remove {:?} from {} cache, size marked unknown: {}",
                    prefix.as_path(),
                    K::KIND,
                    e
                );
                Err(e)
            }
        }
    }

    /// Wipe the namespace. The ledger restarts known at zero.
    pub async fn invalidate_all(&self) -> Result<()> {
        self.inner.ledger.begin_mutation();
        match self.inner.store.remove_all().await {
            Ok(()) => {
                self.inner.ledger.set_absolute(0, 0);
                self.inner.ledger.end_mutation(Some((0, 0)));
                info!(
                    "Cleared {} cache for instance '{}'",
                    K::KIND,
                    self.inner.instance_id
                );
                Ok(())
            }
            Err(e) => {
                self.inner.ledger.end_mutation(None);
                warn!("Failed to clear {} cache, size marked unknown: {}", K::KIND, e);
                Err(e)
            }
        }
    }

    /// Occupied bytes and entry count, scanning once if the ledger is unknown.
    pub async fn size_info(&self) -> Result<SizeInfo> {
        if let Some(info) = self.inner.ledger.read().size_info() {
            return Ok(info);
        }

        let ticket = self.inner.ledger.scan_ticket();
        let scan = match self.inner.store.scan().await {
            Ok(scan) => {
                self.inner.metrics.record_scan(true);
                scan
            }
            Err(e) => {
                self.inner.metrics.record_scan(false);
                return Err(e);
            }
        };

        let scanned = SizeInfo {
            bytes: scan.total_size,
            count: scan.file_count(),
        };
        // The ledger may have become known, or stayed unknown because the
        // namespace changed during the walk
        Ok(self
            .inner
            .ledger
            .install_scan(scanned.bytes, scanned.count, ticket)
            .size_info()
            .unwrap_or(scanned))
    }

    pub fn ledger_state(&self) -> LedgerState {
        self.inner.ledger.read()
    }

    /// Schedule an eviction pass without waiting for it.
    pub fn trigger_eviction(&self, force: bool) {
        self.inner.eviction.schedule(force);
    }

    /// Run an eviction pass and wait for its outcome.
    pub async fn run_eviction(&self, force: bool) -> Result<EvictionOutcome> {
        self.inner.eviction.run(force).await
    }

    pub fn max_bytes(&self) -> u64 {
        self.inner.eviction.max_bytes()
    }

    pub fn metrics(&self) -> CacheMetrics {
        let mut metrics = self.inner.metrics.snapshot();
        metrics.coalesced_waits = self.inner.coalescer.coalesced_waits();
        metrics
    }

    pub fn in_flight_count(&self) -> usize {
        self.inner.coalescer.in_flight_count()
    }
}

impl<K: CacheKey> CacheInner<K> {
    async fn store_bytes(&self, key: &K, data: &[u8]) -> Result<()> {
        let new_size = data.len() as u64;
        let prior = self.store.prior_entry(key).await;
        let state = self.ledger.read();

        let projected = match (state, prior) {
            (LedgerState::Known { bytes, .. }, PriorEntry::Absent) => {
                Some(bytes.saturating_add(new_size))
            }
            (LedgerState::Known { bytes, .. }, PriorEntry::Present(old)) => {
                Some(bytes.saturating_sub(old).saturating_add(new_size))
            }
            _ => None,
        };

        if self.eviction.should_schedule(state, projected) {
            self.eviction.schedule(false);
        }

        self.ledger.begin_mutation();
        let outcome = match self.store.write(key, data).await {
            Ok(outcome) => outcome,
            Err(e) => {
                self.ledger.end_mutation(Some((0, 0)));
                self.metrics.record_write_failure();
                error!("Failed to write {} cache entry {:?}: {}", K::KIND, key, e);
                return Err(e);
            }
        };
        self.metrics.record_write(outcome.new_size);

        let delta = outcome.ledger_delta();
        let state = self.ledger.end_mutation(delta);
        if delta.is_none() {
            debug!("Prior size of {:?} unreadable, ledger invalidated", key);
        }
        // A pass scheduled before the write may have read the ledger before
        // this delta landed, so check again against the settled value
        if self
            .eviction
            .should_schedule(state, state.size_info().map(|i| i.bytes))
        {
            self.eviction.schedule(false);
        }

        Ok(())
    }
}
