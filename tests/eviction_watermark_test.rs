//! Integration tests for watermark-driven eviction
//!
//! A pass over a namespace above the high watermark deletes files oldest
//! first until occupancy is at or below the target watermark, and never
//! deletes more than needed to get there.

use media_disk_cache::cache_types::{CacheKind, LedgerState, PageKey, SizeInfo};
use media_disk_cache::entry_store::EntryStore;
use media_disk_cache::eviction::{EvictionOutcome, EvictionPolicy, SkipReason};
use media_disk_cache::namespace::DirectoryLayout;
use media_disk_cache::PageCache;
use quickcheck::{QuickCheck, TestResult};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tempfile::TempDir;

const MB: u64 = 1_000_000;

// ============================================================================
// Helpers
// ============================================================================

async fn open_with_budget(dir: &Path, budget: Arc<AtomicU64>) -> PageCache {
    PageCache::open_idle(
        "default",
        &DirectoryLayout::new(dir),
        Arc::new(move |_: CacheKind| budget.load(Ordering::SeqCst)),
        EvictionPolicy::default(),
    )
    .await
    .unwrap()
}

fn set_age(path: &Path, age_secs: u64) {
    let file = std::fs::File::options().write(true).open(path).unwrap();
    file.set_modified(SystemTime::now() - Duration::from_secs(age_secs))
        .unwrap();
}

/// Write files directly under `root`, oldest first.
fn write_aged_files(root: &Path, sizes: &[u64]) -> Vec<PathBuf> {
    sizes
        .iter()
        .enumerate()
        .map(|(i, size)| {
            let path = root.join(format!("book-{}", i % 3)).join(format!("{:04}.bin", i));
            std::fs::create_dir_all(path.parent().unwrap()).unwrap();
            std::fs::write(&path, vec![0u8; *size as usize]).unwrap();
            set_age(&path, 10_000 - i as u64 * 10);
            path
        })
        .collect()
}

// ============================================================================
// Example scenario: 100 MB budget, 95 MB stored in 10 files
// ============================================================================

#[tokio::test]
async fn test_hundred_megabyte_scenario() {
    let temp_dir = TempDir::new().unwrap();
    let budget = Arc::new(AtomicU64::new(10_000 * MB));
    let cache = open_with_budget(temp_dir.path(), Arc::clone(&budget)).await;
    cache.invalidate_all().await.unwrap();

    let file_size = 95 * MB / 10;
    let mut keys = Vec::new();
    for i in 0..10u32 {
        let key = PageKey::new("book-1", i, format!("{:03}.jpg", i)).unwrap();
        let path = cache.store(&key, &vec![1u8; file_size as usize]).await.unwrap();
        set_age(&path, 1_000 - i as u64 * 10);
        keys.push(key);
    }
    assert_eq!(
        cache.ledger_state(),
        LedgerState::Known {
            bytes: 95 * MB,
            count: 10
        }
    );

    budget.store(100 * MB, Ordering::SeqCst);
    let outcome = cache.run_eviction(false).await.unwrap();

    assert_eq!(
        outcome,
        EvictionOutcome::Evicted {
            files_removed: 2,
            bytes_freed: 2 * file_size,
            remaining_bytes: 8 * file_size,
        }
    );
    assert!(!cache.has(&keys[0]).await);
    assert!(!cache.has(&keys[1]).await);
    for key in &keys[2..] {
        assert!(cache.has(key).await);
    }

    assert_eq!(
        cache.ledger_state(),
        LedgerState::Known {
            bytes: 8 * file_size,
            count: 8
        }
    );

    let scan = EntryStore::new(cache.root().to_path_buf()).scan().await.unwrap();
    assert_eq!(
        cache.size_info().await.unwrap(),
        SizeInfo {
            bytes: scan.total_size,
            count: scan.file_count()
        }
    );
    assert!(scan.total_size <= 80 * MB);
}

#[tokio::test]
async fn test_within_budget_after_scan_does_not_delete() {
    let temp_dir = TempDir::new().unwrap();
    let budget = Arc::new(AtomicU64::new(10_000));
    let cache = open_with_budget(temp_dir.path(), budget).await;
    let paths = write_aged_files(cache.root(), &[3_000, 3_000, 2_000]);

    let outcome = cache.run_eviction(false).await.unwrap();

    assert_eq!(
        outcome,
        EvictionOutcome::Reconciled {
            total_bytes: 8_000,
            file_count: 3,
            ledger_updated: true
        }
    );
    assert!(paths.iter().all(|p| p.exists()));

    let second = cache.run_eviction(true).await.unwrap();
    assert_eq!(second, EvictionOutcome::Skipped(SkipReason::WithinBudget));
}

#[tokio::test]
async fn test_unknown_ledger_set_from_scan_after_eviction() {
    let temp_dir = TempDir::new().unwrap();
    let budget = Arc::new(AtomicU64::new(10_000));
    let cache = open_with_budget(temp_dir.path(), budget).await;
    let paths = write_aged_files(cache.root(), &[4_000, 4_000, 4_000]);

    let outcome = cache.run_eviction(false).await.unwrap();

    assert_eq!(
        outcome,
        EvictionOutcome::Evicted {
            files_removed: 1,
            bytes_freed: 4_000,
            remaining_bytes: 8_000
        }
    );
    assert!(!paths[0].exists());
    assert_eq!(
        cache.ledger_state(),
        LedgerState::Known {
            bytes: 8_000,
            count: 2
        }
    );
    // Emptied directory pruned, namespace root kept
    assert!(!paths[0].parent().unwrap().exists());
    assert!(cache.root().exists());
}

#[tokio::test]
async fn test_budget_change_applies_on_next_decision() {
    let temp_dir = TempDir::new().unwrap();
    let budget = Arc::new(AtomicU64::new(1_000_000));
    let cache = open_with_budget(temp_dir.path(), Arc::clone(&budget)).await;
    cache.invalidate_all().await.unwrap();

    let key = PageKey::new("b", 1, "1.jpg").unwrap();
    cache.store(&key, &[0u8; 5_000]).await.unwrap();
    assert_eq!(cache.max_bytes(), 1_000_000);

    budget.store(1_000, Ordering::SeqCst);
    assert_eq!(cache.max_bytes(), 1_000);

    let outcome = cache.run_eviction(false).await.unwrap();
    assert!(matches!(outcome, EvictionOutcome::Evicted { files_removed: 1, .. }));
    assert!(!cache.has(&key).await);
}

// ============================================================================
// Property: convergence without over-eviction
// ============================================================================

fn prop_watermark_convergence(raw_sizes: Vec<u16>) -> TestResult {
    let sizes: Vec<u64> = raw_sizes.iter().map(|s| (*s as u64 % 2_000) + 1).collect();
    if sizes.is_empty() || sizes.len() > 30 {
        return TestResult::discard();
    }
    let total: u64 = sizes.iter().sum();
    let max_bytes = 10_000u64;
    let high = max_bytes * 90 / 100;
    let target = max_bytes * 80 / 100;
    if total <= high {
        return TestResult::discard();
    }

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap();

    runtime.block_on(async {
        let temp_dir = TempDir::new().unwrap();
        let cache = open_with_budget(temp_dir.path(), Arc::new(AtomicU64::new(max_bytes))).await;
        let paths = write_aged_files(cache.root(), &sizes);

        let outcome = cache.run_eviction(false).await.unwrap();
        let (files_removed, remaining) = match outcome {
            EvictionOutcome::Evicted {
                files_removed,
                remaining_bytes,
                ..
            } => (files_removed as usize, remaining_bytes),
            _ => return TestResult::failed(),
        };

        // Exactly the oldest prefix was removed
        for (i, path) in paths.iter().enumerate() {
            if path.exists() != (i >= files_removed) {
                return TestResult::failed();
            }
        }

        // At or below target, and one fewer deletion would not have been
        let last_removed = sizes[files_removed - 1];
        TestResult::from_bool(remaining <= target && remaining + last_removed > target)
    })
}

#[test]
fn test_watermark_convergence_property() {
    QuickCheck::new()
        .tests(30)
        .quickcheck(prop_watermark_convergence as fn(Vec<u16>) -> TestResult);
}

// ============================================================================
// Opportunistic trigger: a write crossing the high watermark evicts unaided
// ============================================================================

/// Poll until a pass has recorded its evictions and the ledger is at or below `limit`.
async fn wait_for_ledger_at_most(cache: &PageCache, limit: u64) -> LedgerState {
    for _ in 0..200 {
        let state = cache.ledger_state();
        let recorded = cache.metrics().files_evicted > 0;
        if recorded && matches!(state, LedgerState::Known { bytes, .. } if bytes <= limit) {
            return state;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    cache.ledger_state()
}

async fn fill_then_cross(crossing_via_ensure: bool) {
    let temp_dir = TempDir::new().unwrap();
    let cache = open_with_budget(temp_dir.path(), Arc::new(AtomicU64::new(1_000))).await;
    cache.invalidate_all().await.unwrap();

    // 850 bytes: under the 900 byte high watermark, nothing scheduled
    for i in 0..17u32 {
        let key = PageKey::new("book", i, format!("{:02}.jpg", i)).unwrap();
        cache.store(&key, &[0u8; 50]).await.unwrap();
    }
    assert_eq!(cache.metrics().eviction_passes, 0);

    let crossing = PageKey::new("book", 17, "17.jpg").unwrap();
    if crossing_via_ensure {
        cache
            .ensure(&crossing, || async { Ok(bytes::Bytes::from(vec![0u8; 100])) })
            .await
            .unwrap();
    } else {
        cache.store(&crossing, &[0u8; 100]).await.unwrap();
    }

    let target = EvictionPolicy::default().target_watermark(1_000);
    let state = wait_for_ledger_at_most(&cache, target).await;
    let scan = EntryStore::new(cache.root().to_path_buf()).scan().await.unwrap();

    assert!(
        matches!(state, LedgerState::Known { bytes, .. } if bytes <= target),
        "ledger left at {:?}",
        state
    );
    assert_eq!(
        state,
        LedgerState::Known {
            bytes: scan.total_size,
            count: scan.file_count()
        }
    );
    assert!(scan.total_size <= target);
    assert!(cache.metrics().files_evicted > 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_store_crossing_high_watermark_evicts_in_background() {
    fill_then_cross(false).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_ensure_crossing_high_watermark_evicts_in_background() {
    fill_then_cross(true).await;
}
