//! Integration tests for recovering from an unknown ledger
//!
//! Starting from an unknown ledger, `size_info()` or an eviction pass leaves
//! the ledger known and equal to a fresh scan.

use media_disk_cache::cache_types::{CacheKind, LedgerState, SizeInfo, ThumbnailKey, ThumbnailType};
use media_disk_cache::entry_store::EntryStore;
use media_disk_cache::eviction::EvictionPolicy;
use media_disk_cache::namespace::DirectoryLayout;
use media_disk_cache::ThumbnailCache;
use std::sync::Arc;
use tempfile::TempDir;

async fn open(dir: &TempDir) -> ThumbnailCache {
    ThumbnailCache::open_idle(
        "default",
        &DirectoryLayout::new(dir.path()),
        Arc::new(|_: CacheKind| 1u64 << 30),
        EvictionPolicy::default(),
    )
    .await
    .unwrap()
}

fn seed(cache: &ThumbnailCache) {
    for (i, size) in [120usize, 340, 56].iter().enumerate() {
        let key = ThumbnailKey::new(ThumbnailType::Book, format!("b{}", i)).unwrap();
        let path = cache.path_for(&key);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, vec![9u8; *size]).unwrap();
    }
    // Interrupted write leftovers are hidden and never counted
    std::fs::write(cache.root().join("book").join(".b9.jpg.abc.tmp"), [0u8; 999]).unwrap();
}

async fn fresh_scan(cache: &ThumbnailCache) -> SizeInfo {
    let scan = EntryStore::new(cache.root().to_path_buf()).scan().await.unwrap();
    SizeInfo {
        bytes: scan.total_size,
        count: scan.file_count(),
    }
}

#[tokio::test]
async fn test_size_info_heals_unknown_ledger() {
    let temp_dir = TempDir::new().unwrap();
    let cache = open(&temp_dir).await;
    seed(&cache);
    assert_eq!(cache.ledger_state(), LedgerState::Unknown);

    let info = cache.size_info().await.unwrap();

    assert_eq!(info, SizeInfo { bytes: 516, count: 3 });
    assert_eq!(info, fresh_scan(&cache).await);
    assert_eq!(
        cache.ledger_state(),
        LedgerState::Known {
            bytes: 516,
            count: 3
        }
    );
}

#[tokio::test]
async fn test_eviction_pass_heals_unknown_ledger() {
    let temp_dir = TempDir::new().unwrap();
    let cache = open(&temp_dir).await;
    seed(&cache);

    cache.run_eviction(false).await.unwrap();

    let expected = fresh_scan(&cache).await;
    assert_eq!(cache.ledger_state().size_info(), Some(expected));
}

#[tokio::test]
async fn test_unknown_ledger_ignores_deltas_until_scanned() {
    let temp_dir = TempDir::new().unwrap();
    let cache = open(&temp_dir).await;
    seed(&cache);

    let key = ThumbnailKey::new(ThumbnailType::Series, "s1").unwrap();
    cache.store(&key, &[1u8; 44]).await.unwrap();
    cache
        .invalidate(&ThumbnailKey::new(ThumbnailType::Book, "b0").unwrap())
        .await
        .unwrap();

    let info = cache.size_info().await.unwrap();
    assert_eq!(info, fresh_scan(&cache).await);
    assert_eq!(info, SizeInfo { bytes: 440, count: 3 });
}

#[tokio::test]
async fn test_open_sweeps_orphaned_temp_files() {
    let temp_dir = TempDir::new().unwrap();
    let cache = open(&temp_dir).await;
    seed(&cache);
    let orphan = cache.root().join("book").join(".b9.jpg.abc.tmp");
    assert!(orphan.exists());

    let reopened = open(&temp_dir).await;

    assert!(!orphan.exists());
    assert_eq!(reopened.size_info().await.unwrap().count, 3);
}
