//! Eviction Engine Module
//!
//! Enforces a byte budget on one cache namespace with a two-watermark policy:
//! a pass starts when occupancy exceeds the high watermark and deletes the
//! oldest files (by modification time) until occupancy is at or below the
//! target watermark. Passes are admitted through the size ledger's cleanup
//! gate, which rejects overlapping passes and throttles back-to-back ones.
//!
//! The gap between the watermarks keeps the very next write after a pass from
//! starting another one.

use crate::cache_types::{CacheKind, LedgerState};
use crate::entry_store::EntryStore;
use crate::metrics::MetricsRecorder;
use crate::size_ledger::{format_bytes_human, SizeLedger};
use crate::Result;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Default percentage of the budget that starts an eviction pass
pub const DEFAULT_TRIGGER_PERCENT: u8 = 90;
/// Default percentage of the budget an eviction pass reduces occupancy to
pub const DEFAULT_TARGET_PERCENT: u8 = 80;
/// Default minimum spacing between unforced eviction passes
pub const DEFAULT_THROTTLE_INTERVAL: Duration = Duration::from_secs(5);

/// Source of the maximum byte budget per cache kind.
///
/// Consulted on every eviction decision, so budget changes take effect on the
/// next write without reopening the cache.
pub trait CacheBudget: Send + Sync {
    fn max_bytes(&self, kind: CacheKind) -> u64;
}

impl<F> CacheBudget for F
where
    F: Fn(CacheKind) -> u64 + Send + Sync,
{
    fn max_bytes(&self, kind: CacheKind) -> u64 {
        self(kind)
    }
}

/// Watermark percentages and throttle for eviction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EvictionPolicy {
    pub trigger_percent: u8,
    pub target_percent: u8,
    pub throttle_interval: Duration,
}

impl Default for EvictionPolicy {
    fn default() -> Self {
        Self {
            trigger_percent: DEFAULT_TRIGGER_PERCENT,
            target_percent: DEFAULT_TARGET_PERCENT,
            throttle_interval: DEFAULT_THROTTLE_INTERVAL,
        }
    }
}

impl EvictionPolicy {
    pub fn high_watermark(&self, max_bytes: u64) -> u64 {
        percent_of(max_bytes, self.trigger_percent)
    }

    pub fn target_watermark(&self, max_bytes: u64) -> u64 {
        percent_of(max_bytes, self.target_percent)
    }
}

fn percent_of(value: u64, percent: u8) -> u64 {
    (value as u128 * percent as u128 / 100) as u64
}

/// Why a pass did no filesystem work
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Ledger is known and at or below the high watermark
    WithinBudget,
    /// Another pass is running, or the last one finished too recently
    Throttled,
}

/// Result of one eviction pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictionOutcome {
    Skipped(SkipReason),
    /// Scanned and found at or below the high watermark
    Reconciled {
        total_bytes: u64,
        file_count: u64,
        ledger_updated: bool,
    },
    Evicted {
        files_removed: u64,
        bytes_freed: u64,
        remaining_bytes: u64,
    },
}

/// Clears the cleanup-in-progress flag however the pass exits
struct CleanupGuard<'a> {
    ledger: &'a SizeLedger,
}

impl Drop for CleanupGuard<'_> {
    fn drop(&mut self) {
        self.ledger.end_cleanup(Instant::now());
    }
}

/// Eviction driver for one namespace
pub struct EvictionEngine {
    kind: CacheKind,
    store: EntryStore,
    ledger: Arc<SizeLedger>,
    budget: Arc<dyn CacheBudget>,
    policy: EvictionPolicy,
    metrics: Arc<MetricsRecorder>,
}

impl EvictionEngine {
    pub fn new(
        kind: CacheKind,
        store: EntryStore,
        ledger: Arc<SizeLedger>,
        budget: Arc<dyn CacheBudget>,
        policy: EvictionPolicy,
        metrics: Arc<MetricsRecorder>,
    ) -> Self {
        Self {
            kind,
            store,
            ledger,
            budget,
            policy,
            metrics,
        }
    }

    pub fn policy(&self) -> &EvictionPolicy {
        &self.policy
    }

    pub fn max_bytes(&self) -> u64 {
        self.budget.max_bytes(self.kind)
    }

    pub fn high_watermark(&self) -> u64 {
        self.policy.high_watermark(self.max_bytes())
    }

    pub fn target_watermark(&self) -> u64 {
        self.policy.target_watermark(self.max_bytes())
    }

    /// Whether a write projected to reach `projected_bytes` should schedule a pass.
    pub fn should_schedule(&self, state: LedgerState, projected_bytes: Option<u64>) -> bool {
        match (state, projected_bytes) {
            (LedgerState::Known { .. }, Some(projected)) => projected > self.high_watermark(),
            _ => true,
        }
    }

    /// Run a pass on a detached task so the caller never waits on a scan.
    pub fn schedule(self: &Arc<Self>, force: bool) {
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = engine.run(force).await {
                warn!("Background eviction for {} cache failed: {}", engine.kind, e);
            }
        });
    }

    /// Run one eviction pass.
    ///
    /// `force` bypasses the time throttle, never the in-progress check. An
    /// unknown ledger always forces.
    pub async fn run(&self, force: bool) -> Result<EvictionOutcome> {
        let max_bytes = self.max_bytes();
        let high_watermark = self.policy.high_watermark(max_bytes);
        let target_watermark = self.policy.target_watermark(max_bytes);

        let state = self.ledger.read();
        if let LedgerState::Known { bytes, .. } = state {
            if bytes <= high_watermark {
                return Ok(EvictionOutcome::Skipped(SkipReason::WithinBudget));
            }
        }

        let force = force || !state.is_valid();
        if !self
            .ledger
            .try_begin_cleanup(self.policy.throttle_interval, force, Instant::now())
        {
            debug!("Eviction for {} cache skipped: pass running or throttled", self.kind);
            return Ok(EvictionOutcome::Skipped(SkipReason::Throttled));
        }
        let _cleanup = CleanupGuard {
            ledger: &self.ledger,
        };

        let ticket = self.ledger.scan_ticket();
        let scan = match self.store.scan().await {
            Ok(scan) => {
                self.metrics.record_scan(true);
                scan
            }
            Err(e) => {
                self.metrics.record_scan(false);
                self.ledger.invalidate();
                warn!("Eviction scan of {} cache failed, size left unknown: {}", self.kind, e);
                return Err(e);
            }
        };

        let total_bytes = scan.total_size;
        let file_count = scan.file_count();

        if total_bytes <= high_watermark {
            // A known ledger may already include writes the scan missed
            let was_valid = self.ledger.read().is_valid();
            let state = self.ledger.install_scan(total_bytes, file_count, ticket);
            debug!(
                "{} cache within budget after scan: {} in {} files (high watermark {})",
                self.kind,
                format_bytes_human(total_bytes),
                file_count,
                format_bytes_human(high_watermark)
            );
            return Ok(EvictionOutcome::Reconciled {
                total_bytes,
                file_count,
                ledger_updated: !was_valid && state.is_valid(),
            });
        }

        info!(
            "[CACHE_EVICTION] Starting eviction: kind={}, usage={} / {} ({:.1}%), target={} ({}%), files={}",
            self.kind,
            format_bytes_human(total_bytes),
            format_bytes_human(max_bytes),
            if max_bytes > 0 {
                total_bytes as f64 * 100.0 / max_bytes as f64
            } else {
                100.0
            },
            format_bytes_human(target_watermark),
            self.policy.target_percent,
            file_count
        );

        let mut files = scan.files;
        // Oldest first; entries without a readable mtime go first
        files.sort_by(|a, b| a.modified.cmp(&b.modified));

        let mut remaining = total_bytes;
        let mut bytes_freed = 0u64;
        let mut files_removed = 0u64;
        let mut removed_paths = Vec::new();

        self.ledger.begin_eviction();
        for file in files {
            if remaining <= target_watermark {
                break;
            }
            match self.store.remove_scanned(&file.path).await {
                Ok(freed) => {
                    remaining = remaining.saturating_sub(freed);
                    bytes_freed += freed;
                    files_removed += 1;
                    removed_paths.push(file.path);
                }
                Err(e) => {
                    debug!("Skipping eviction of {:?}: {}", file.path, e);
                }
            }
        }
        let state = self
            .ledger
            .end_eviction(ticket, total_bytes, file_count, bytes_freed, files_removed);
        if !state.is_valid() {
            debug!("{} cache changed during eviction, size left unknown", self.kind);
        }

        let dirs_removed = self.store.prune_empty_dirs(&removed_paths).await;
        self.metrics.record_eviction(files_removed, bytes_freed);

        info!(
            "[CACHE_EVICTION] Eviction completed: kind={}, files_removed={}, freed={}, remaining={}, empty_dirs_removed={}",
            self.kind,
            files_removed,
            format_bytes_human(bytes_freed),
            format_bytes_human(remaining),
            dirs_removed
        );

        Ok(EvictionOutcome::Evicted {
            files_removed,
            bytes_freed,
            remaining_bytes: remaining,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::SystemTime;
    use tempfile::TempDir;

    fn engine(dir: &TempDir, max_bytes: u64, policy: EvictionPolicy) -> (EvictionEngine, Arc<SizeLedger>) {
        let ledger = Arc::new(SizeLedger::new());
        let engine = EvictionEngine::new(
            CacheKind::PageImage,
            EntryStore::new(dir.path().to_path_buf()),
            Arc::clone(&ledger),
            Arc::new(move |_: CacheKind| max_bytes),
            policy,
            Arc::new(MetricsRecorder::new()),
        );
        (engine, ledger)
    }

    fn write_aged(dir: &TempDir, name: &str, size: usize, age_secs: u64) {
        let path = dir.path().join(name);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, vec![0u8; size]).unwrap();
        let file = std::fs::File::options().write(true).open(&path).unwrap();
        file.set_modified(SystemTime::now() - Duration::from_secs(age_secs))
            .unwrap();
    }

    #[test]
    fn test_default_policy_watermarks() {
        let policy = EvictionPolicy::default();
        assert_eq!(policy.high_watermark(1_000), 900);
        assert_eq!(policy.target_watermark(1_000), 800);
        assert_eq!(policy.throttle_interval, Duration::from_secs(5));
    }

    #[test]
    fn test_watermarks_do_not_overflow_large_budgets() {
        let policy = EvictionPolicy::default();
        assert_eq!(policy.high_watermark(u64::MAX), (u64::MAX as u128 * 90 / 100) as u64);
    }

    #[test]
    fn test_closure_budget() {
        let budget = |kind: CacheKind| match kind {
            CacheKind::Thumbnail => 10,
            _ => 20,
        };
        assert_eq!(budget.max_bytes(CacheKind::Thumbnail), 10);
        assert_eq!(budget.max_bytes(CacheKind::BookFile), 20);
    }

    #[tokio::test]
    async fn test_known_ledger_below_high_watermark_skips() {
        let dir = TempDir::new().unwrap();
        let (engine, ledger) = engine(&dir, 1_000, EvictionPolicy::default());
        ledger.set_absolute(900, 3);

        let outcome = engine.run(true).await.unwrap();
        assert_eq!(outcome, EvictionOutcome::Skipped(SkipReason::WithinBudget));
    }

    #[tokio::test]
    async fn test_unknown_ledger_is_reconciled() {
        let dir = TempDir::new().unwrap();
        write_aged(&dir, "a/1.jpg", 100, 10);
        write_aged(&dir, "b/2.jpg", 50, 5);
        let (engine, ledger) = engine(&dir, 1_000, EvictionPolicy::default());

        let outcome = engine.run(false).await.unwrap();

        assert_eq!(
            outcome,
            EvictionOutcome::Reconciled {
                total_bytes: 150,
                file_count: 2,
                ledger_updated: true
            }
        );
        assert_eq!(ledger.read(), LedgerState::Known { bytes: 150, count: 2 });
        assert!(!ledger.cleanup_in_progress());
    }

    #[tokio::test]
    async fn test_evicts_oldest_until_target() {
        let dir = TempDir::new().unwrap();
        write_aged(&dir, "book/old.jpg", 300, 30);
        write_aged(&dir, "book/mid.jpg", 300, 20);
        write_aged(&dir, "book/new.jpg", 300, 10);
        write_aged(&dir, "other/newest.jpg", 100, 1);
        let (engine, ledger) = engine(&dir, 1_000, EvictionPolicy::default());
        ledger.set_absolute(1_000, 4);

        let outcome = engine.run(false).await.unwrap();

        assert_eq!(
            outcome,
            EvictionOutcome::Evicted {
                files_removed: 1,
                bytes_freed: 300,
                remaining_bytes: 700
            }
        );
        assert!(!dir.path().join("book/old.jpg").exists());
        assert!(dir.path().join("book/mid.jpg").exists());
        assert_eq!(ledger.read(), LedgerState::Known { bytes: 700, count: 3 });
    }

    #[tokio::test]
    async fn test_missing_root_reconciles_to_zero() {
        let dir = TempDir::new().unwrap();
        let ledger = Arc::new(SizeLedger::new());
        let engine = EvictionEngine::new(
            CacheKind::Thumbnail,
            EntryStore::new(dir.path().join("never-created")),
            Arc::clone(&ledger),
            Arc::new(|_: CacheKind| 1_000u64),
            EvictionPolicy::default(),
            Arc::new(MetricsRecorder::new()),
        );

        engine.run(false).await.unwrap();
        assert_eq!(ledger.read(), LedgerState::Known { bytes: 0, count: 0 });
    }
}
