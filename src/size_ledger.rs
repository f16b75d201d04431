//! Size Ledger Module
//!
//! In-memory aggregate of occupied bytes and entry count for one cache
//! namespace, kept alongside the filesystem so that size checks never need a
//! directory walk while the numbers are trusted.
//!
//! The ledger is either `Known` or `Unknown`. Deltas are only applied to a
//! known ledger; an unknown ledger stays unknown until a scan supplies an
//! absolute value. It also owns the cleanup admission gate that keeps
//! eviction passes from overlapping or running back-to-back.
//!
//! # Scan installation
//!
//! A scan of an unknown namespace races with writes and deletes that cannot
//! update the ledger yet. Every such mutation is bracketed by
//! [`SizeLedger::begin_mutation`] / [`SizeLedger::end_mutation`], which bump a
//! mutation epoch. A scan result is installed only if no mutation is pending
//! and the epoch still matches the [`ScanTicket`] taken before the walk;
//! otherwise the ledger stays unknown and the next trigger rescans.

use crate::cache_types::LedgerState;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::debug;

/// Mutation epoch observed before a scan started
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanTicket(u64);

#[derive(Debug)]
struct LedgerInner {
    state: LedgerState,
    epoch: u64,
    pending_mutations: u32,
    cleanup_in_progress: bool,
    last_cleanup_at: Option<Instant>,
}

impl LedgerInner {
    fn can_install(&self, ticket: ScanTicket) -> bool {
        !self.state.is_valid() && self.pending_mutations == 0 && self.epoch == ticket.0
    }
}

/// Concurrency-safe byte/count ledger with a cleanup throttle
#[derive(Debug)]
pub struct SizeLedger {
    inner: Mutex<LedgerInner>,
}

impl SizeLedger {
    /// Created unknown: nothing is trusted until the first scan.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(LedgerInner {
                state: LedgerState::Unknown,
                epoch: 0,
                pending_mutations: 0,
                cleanup_in_progress: false,
                last_cleanup_at: None,
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, LedgerInner> {
        // Every critical section leaves the ledger consistent, so a poisoned
        // lock still guards valid data
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn read(&self) -> LedgerState {
        self.lock().state
    }

    /// Replace both counters and mark the ledger known.
    pub fn set_absolute(&self, bytes: u64, count: u64) {
        let mut inner = self.lock();
        inner.state = LedgerState::Known { bytes, count };
        inner.epoch += 1;
        debug!("Size ledger set: bytes={}, count={}", bytes, count);
    }

    /// Take a ticket before walking the namespace.
    pub fn scan_ticket(&self) -> ScanTicket {
        ScanTicket(self.lock().epoch)
    }

    /// Install a scan result if nothing changed the namespace during the walk.
    ///
    /// Returns the resulting state. A known ledger is never overwritten: it
    /// may already include writes the scan missed.
    pub fn install_scan(&self, bytes: u64, count: u64, ticket: ScanTicket) -> LedgerState {
        let mut inner = self.lock();
        if inner.can_install(ticket) {
            inner.state = LedgerState::Known { bytes, count };
            debug!("Size ledger reconciled: bytes={}, count={}", bytes, count);
        } else if !inner.state.is_valid() {
            debug!("Scan result discarded: namespace changed during scan");
        }
        inner.state
    }

    /// Register a write or delete that is about to touch the namespace.
    pub fn begin_mutation(&self) {
        let mut inner = self.lock();
        inner.pending_mutations += 1;
        inner.epoch += 1;
    }

    /// Finish a mutation started with [`SizeLedger::begin_mutation`].
    ///
    /// `Some(delta)` applies to a known ledger; `None` means the change could
    /// not be measured and invalidates it.
    pub fn end_mutation(&self, delta: Option<(i64, i64)>) -> LedgerState {
        let mut inner = self.lock();
        inner.pending_mutations = inner.pending_mutations.saturating_sub(1);
        inner.epoch += 1;
        match delta {
            Some((bytes_delta, count_delta)) => apply_delta_locked(&mut inner, bytes_delta, count_delta),
            None => {
                if inner.state.is_valid() {
                    debug!("Size ledger invalidated: unmeasurable change");
                }
                inner.state = LedgerState::Unknown;
            }
        }
        inner.state
    }

    /// Mark the start of an eviction pass's deletions.
    ///
    /// Blocks concurrent scan installs without invalidating the pass's own
    /// ticket.
    pub fn begin_eviction(&self) {
        self.lock().pending_mutations += 1;
    }

    /// Account for an eviction pass that removed `bytes_freed` / `files_removed`
    /// from a namespace scanned at `scanned_bytes` / `scanned_count`.
    ///
    /// A known ledger takes the exact negative delta. An unknown one is set to
    /// the post-eviction scan totals when nothing else changed the namespace.
    pub fn end_eviction(
        &self,
        ticket: ScanTicket,
        scanned_bytes: u64,
        scanned_count: u64,
        bytes_freed: u64,
        files_removed: u64,
    ) -> LedgerState {
        let mut inner = self.lock();
        inner.pending_mutations = inner.pending_mutations.saturating_sub(1);
        if inner.state.is_valid() {
            apply_delta_locked(&mut inner, -(bytes_freed as i64), -(files_removed as i64));
        } else if inner.can_install(ticket) {
            inner.state = LedgerState::Known {
                bytes: scanned_bytes.saturating_sub(bytes_freed),
                count: scanned_count.saturating_sub(files_removed),
            };
        }
        inner.epoch += 1;
        inner.state
    }

    /// Apply a signed change to a known ledger, clamping at zero.
    ///
    /// Returns the resulting state. A no-op while unknown.
    pub fn apply_delta(&self, bytes_delta: i64, count_delta: i64) -> LedgerState {
        let mut inner = self.lock();
        apply_delta_locked(&mut inner, bytes_delta, count_delta);
        inner.state
    }

    pub fn invalidate(&self) {
        let mut inner = self.lock();
        if inner.state.is_valid() {
            debug!("Size ledger invalidated");
        }
        inner.state = LedgerState::Unknown;
        inner.epoch += 1;
    }

    /// Admission gate into an eviction pass.
    ///
    /// Refuses while another pass is running, and (unless `force`) within
    /// `min_interval` of the previous pass completing.
    pub fn try_begin_cleanup(&self, min_interval: Duration, force: bool, now: Instant) -> bool {
        let mut inner = self.lock();
        if inner.cleanup_in_progress {
            return false;
        }
        if !force {
            if let Some(last) = inner.last_cleanup_at {
                if now.saturating_duration_since(last) < min_interval {
                    return false;
                }
            }
        }
        inner.cleanup_in_progress = true;
        true
    }

    pub fn end_cleanup(&self, now: Instant) {
        let mut inner = self.lock();
        inner.cleanup_in_progress = false;
        inner.last_cleanup_at = Some(now);
    }

    pub fn cleanup_in_progress(&self) -> bool {
        self.lock().cleanup_in_progress
    }
}

impl Default for SizeLedger {
    fn default() -> Self {
        Self::new()
    }
}

fn apply_delta_locked(inner: &mut LedgerInner, bytes_delta: i64, count_delta: i64) {
    if let LedgerState::Known { bytes, count } = inner.state {
        inner.state = LedgerState::Known {
            bytes: apply_clamped(bytes, bytes_delta),
            count: apply_clamped(count, count_delta),
        };
    }
}

fn apply_clamped(value: u64, delta: i64) -> u64 {
    if delta >= 0 {
        value.saturating_add(delta as u64)
    } else {
        value.saturating_sub(delta.unsigned_abs())
    }
}

/// Format bytes in human-readable units (KiB, MiB, GiB, TiB)
pub fn format_bytes_human(bytes: u64) -> String {
    const KIB: u64 = 1024;
    const MIB: u64 = KIB * 1024;
    const GIB: u64 = MIB * 1024;
    const TIB: u64 = GIB * 1024;

    if bytes >= TIB {
        format!("{:.1} TiB", bytes as f64 / TIB as f64)
    } else if bytes >= GIB {
        format!("{:.1} GiB", bytes as f64 / GIB as f64)
    } else if bytes >= MIB {
        format!("{:.1} MiB", bytes as f64 / MIB as f64)
    } else if bytes >= KIB {
        format!("{:.1} KiB", bytes as f64 / KIB as f64)
    } else {
        format!("{} B", bytes)
    }
}
