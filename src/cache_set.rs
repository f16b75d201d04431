//! Cache Set Module
//!
//! The page-image, thumbnail and book-file caches of one server instance,
//! opened together against a shared configuration. Switching or removing an
//! account goes through here so no instance can see another's files.

use crate::cache::{BookFileCache, PageCache, ThumbnailCache};
use crate::cache_types::{BookFileKey, CacheKind, PageKey, SizeInfo};
use crate::config::SharedConfig;
use crate::eviction::{CacheBudget, EvictionOutcome};
use crate::metrics::CacheMetrics;
use crate::namespace::{DirectoryLayout, NamespaceResolver};
use crate::size_ledger::format_bytes_human;
use crate::{CacheError, Result};
use serde::{Deserialize, Serialize};
use std::io::ErrorKind;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

/// Size, budget and counters of one cache kind
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KindReport {
    pub kind: CacheKind,
    pub root: PathBuf,
    pub bytes: u64,
    pub count: u64,
    pub max_bytes: u64,
    pub usage_percent: f64,
    pub human_size: String,
    pub metrics: CacheMetrics,
}

impl KindReport {
    fn new(kind: CacheKind, root: PathBuf, size: SizeInfo, max_bytes: u64, metrics: CacheMetrics) -> Self {
        let usage_percent = if max_bytes > 0 {
            size.bytes as f64 * 100.0 / max_bytes as f64
        } else {
            0.0
        };
        Self {
            kind,
            root,
            bytes: size.bytes,
            count: size.count,
            max_bytes,
            usage_percent,
            human_size: format_bytes_human(size.bytes),
            metrics,
        }
    }
}

/// Per-kind reports for one instance
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SizeReport {
    pub instance_id: String,
    pub total_bytes: u64,
    pub kinds: Vec<KindReport>,
}

/// All caches belonging to one server instance
#[derive(Clone)]
pub struct CacheSet {
    instance_id: String,
    pages: PageCache,
    thumbnails: ThumbnailCache,
    book_files: BookFileCache,
}

impl CacheSet {
    /// Open the three caches and schedule their startup eviction checks.
    pub async fn open(config: &SharedConfig, instance_id: &str) -> Result<Self> {
        let set = Self::open_idle(config, instance_id).await?;
        for kind in CacheKind::ALL {
            set.trigger_eviction(kind, false);
        }
        Ok(set)
    }

    /// Open the three caches without background work.
    pub async fn open_idle(config: &SharedConfig, instance_id: &str) -> Result<Self> {
        let snapshot = config.snapshot();
        let layout = DirectoryLayout::new(snapshot.cache.cache_dir.clone());
        let policy = snapshot.cache.eviction.policy();
        let budget: Arc<dyn CacheBudget> = Arc::new(config.clone());

        let (pages, thumbnails, book_files) = futures::try_join!(
            PageCache::open_idle(instance_id, &layout, Arc::clone(&budget), policy),
            ThumbnailCache::open_idle(instance_id, &layout, Arc::clone(&budget), policy),
            BookFileCache::open_idle(instance_id, &layout, Arc::clone(&budget), policy),
        )?;

        info!(
            "Opened caches for instance '{}' under {:?}",
            instance_id,
            layout.base_dir()
        );

        Ok(Self {
            instance_id: instance_id.to_string(),
            pages,
            thumbnails,
            book_files,
        })
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn pages(&self) -> &PageCache {
        &self.pages
    }

    pub fn thumbnails(&self) -> &ThumbnailCache {
        &self.thumbnails
    }

    pub fn book_files(&self) -> &BookFileCache {
        &self.book_files
    }

    /// Sizes of all three caches, scanning any whose ledger is unknown.
    pub async fn size_report(&self) -> Result<SizeReport> {
        let (pages, thumbnails, book_files) = futures::try_join!(
            self.pages.size_info(),
            self.thumbnails.size_info(),
            self.book_files.size_info(),
        )?;

        let kinds = vec![
            KindReport::new(
                CacheKind::PageImage,
                self.pages.root().to_path_buf(),
                pages,
                self.pages.max_bytes(),
                self.pages.metrics(),
            ),
            KindReport::new(
                CacheKind::Thumbnail,
                self.thumbnails.root().to_path_buf(),
                thumbnails,
                self.thumbnails.max_bytes(),
                self.thumbnails.metrics(),
            ),
            KindReport::new(
                CacheKind::BookFile,
                self.book_files.root().to_path_buf(),
                book_files,
                self.book_files.max_bytes(),
                self.book_files.metrics(),
            ),
        ];

        Ok(SizeReport {
            instance_id: self.instance_id.clone(),
            total_bytes: kinds.iter().map(|k| k.bytes).sum(),
            kinds,
        })
    }

    pub fn trigger_eviction(&self, kind: CacheKind, force: bool) {
        match kind {
            CacheKind::PageImage => self.pages.trigger_eviction(force),
            CacheKind::Thumbnail => self.thumbnails.trigger_eviction(force),
            CacheKind::BookFile => self.book_files.trigger_eviction(force),
        }
    }

    pub async fn run_eviction(&self, kind: CacheKind, force: bool) -> Result<EvictionOutcome> {
        match kind {
            CacheKind::PageImage => self.pages.run_eviction(force).await,
            CacheKind::Thumbnail => self.thumbnails.run_eviction(force).await,
            CacheKind::BookFile => self.book_files.run_eviction(force).await,
        }
    }

    pub async fn clear_kind(&self, kind: CacheKind) -> Result<()> {
        match kind {
            CacheKind::PageImage => self.pages.invalidate_all().await,
            CacheKind::Thumbnail => self.thumbnails.invalidate_all().await,
            CacheKind::BookFile => self.book_files.invalidate_all().await,
        }
    }

    /// Remove every cached page and downloaded file of one book.
    pub async fn drop_book(&self, book_id: &str) -> Result<()> {
        self.pages
            .invalidate_subtree(&PageKey::book_prefix(book_id)?)
            .await?;
        self.book_files
            .invalidate_subtree(&BookFileKey::book_prefix(book_id)?)
            .await?;
        info!(
            "Dropped cached content of book '{}' for instance '{}'",
            book_id, self.instance_id
        );
        Ok(())
    }

    /// Wipe all three namespaces of this instance and remove their roots.
    pub async fn remove_instance(self) -> Result<()> {
        futures::try_join!(
            self.pages.invalidate_all(),
            self.thumbnails.invalidate_all(),
            self.book_files.invalidate_all(),
        )?;

        for root in [self.pages.root(), self.thumbnails.root(), self.book_files.root()] {
            match tokio::fs::remove_dir(root).await {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => {
                    return Err(CacheError::DeleteError(format!(
                        "Failed to remove namespace root {:?}: {}",
                        root, e
                    )))
                }
            }
        }

        info!("Removed all cached content for instance '{}'", self.instance_id);
        Ok(())
    }
}

/// Remove one kind's content for every instance under `resolver`.
///
/// Caches already open for any instance keep their ledgers; call
/// `invalidate_all` on them afterwards so they restart from zero.
pub async fn purge_kind_for_all_instances(
    resolver: &dyn NamespaceResolver,
    kind: CacheKind,
) -> Result<()> {
    let root = resolver.kind_root(kind);
    match tokio::fs::remove_dir_all(&root).await {
        Ok(()) => {}
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => {
            return Err(CacheError::DeleteError(format!(
                "Failed to purge {} caches at {:?}: {}",
                kind, root, e
            )))
        }
    }
    tokio::fs::create_dir_all(&root).await?;
    info!("Purged {} caches for all instances at {:?}", kind, root);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache_types::{ThumbnailKey, ThumbnailType};
    use crate::config::Config;
    use tempfile::TempDir;

    fn shared_config(dir: &TempDir) -> SharedConfig {
        let mut config = Config::default();
        config.cache.cache_dir = dir.path().to_path_buf();
        SharedConfig::new(config)
    }

    #[tokio::test]
    async fn test_instances_are_isolated() {
        let dir = TempDir::new().unwrap();
        let config = shared_config(&dir);
        let a = CacheSet::open_idle(&config, "server-a").await.unwrap();
        let b = CacheSet::open_idle(&config, "server-b").await.unwrap();
        let key = ThumbnailKey::new(ThumbnailType::Series, "1").unwrap();

        a.thumbnails().store(&key, b"cover").await.unwrap();

        assert!(a.thumbnails().has(&key).await);
        assert!(!b.thumbnails().has(&key).await);
        assert_ne!(a.thumbnails().path_for(&key), b.thumbnails().path_for(&key));
    }

    #[tokio::test]
    async fn test_drop_book_removes_pages_and_files() {
        let dir = TempDir::new().unwrap();
        let config = shared_config(&dir);
        let set = CacheSet::open_idle(&config, "default").await.unwrap();

        let page = PageKey::new("book-7", 1, "001.jpg").unwrap();
        let other = PageKey::new("book-8", 1, "001.jpg").unwrap();
        let epub = BookFileKey::epub("book-7").unwrap();
        set.pages().store(&page, &[1u8; 10]).await.unwrap();
        set.pages().store(&other, &[1u8; 10]).await.unwrap();
        set.book_files().store(&epub, &[2u8; 20]).await.unwrap();

        set.drop_book("book-7").await.unwrap();

        assert!(!set.pages().has(&page).await);
        assert!(set.pages().has(&other).await);
        assert!(!set.book_files().has(&epub).await);
    }

    #[tokio::test]
    async fn test_size_report_totals() {
        let dir = TempDir::new().unwrap();
        let config = shared_config(&dir);
        let set = CacheSet::open_idle(&config, "default").await.unwrap();

        set.pages()
            .store(&PageKey::new("b", 1, "1.png").unwrap(), &[0u8; 100])
            .await
            .unwrap();
        set.book_files()
            .store(&BookFileKey::original("b", "b.cbz").unwrap(), &[0u8; 50])
            .await
            .unwrap();

        let report = set.size_report().await.unwrap();

        assert_eq!(report.total_bytes, 150);
        assert_eq!(report.kinds.len(), 3);
        assert_eq!(report.kinds[0].kind, CacheKind::PageImage);
        assert_eq!(report.kinds[0].count, 1);
        assert_eq!(report.kinds[1].bytes, 0);
    }

    #[tokio::test]
    async fn test_remove_instance_removes_roots() {
        let dir = TempDir::new().unwrap();
        let config = shared_config(&dir);
        let set = CacheSet::open_idle(&config, "gone").await.unwrap();
        let page_root = set.pages().root().to_path_buf();
        set.pages()
            .store(&PageKey::new("b", 1, "1.png").unwrap(), b"x")
            .await
            .unwrap();

        set.remove_instance().await.unwrap();

        assert!(!page_root.exists());
    }

    #[tokio::test]
    async fn test_purge_kind_for_all_instances() {
        let dir = TempDir::new().unwrap();
        let config = shared_config(&dir);
        let a = CacheSet::open_idle(&config, "a").await.unwrap();
        let b = CacheSet::open_idle(&config, "b").await.unwrap();
        let key = ThumbnailKey::new(ThumbnailType::Book, "1").unwrap();
        let page = PageKey::new("b", 1, "1.png").unwrap();
        a.thumbnails().store(&key, b"x").await.unwrap();
        b.thumbnails().store(&key, b"y").await.unwrap();
        a.pages().store(&page, b"z").await.unwrap();

        let layout = DirectoryLayout::new(dir.path());
        purge_kind_for_all_instances(&layout, CacheKind::Thumbnail)
            .await
            .unwrap();

        assert!(!a.thumbnails().has(&key).await);
        assert!(!b.thumbnails().has(&key).await);
        assert!(a.pages().has(&page).await);
    }
}
