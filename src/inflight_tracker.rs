//! In-flight fetch tracker for request coalescing.
//!
//! `FetchCoalescer` guarantees that at most one producer (network fetch,
//! render) runs per key at a time. Concurrent callers for the same key attach
//! to the running unit of work and observe the identical outcome.
//!
//! # Architecture
//!
//! When several requests arrive for the same missing key:
//! 1. The first request registers as the "Fetcher" and its producer is spawned
//!    as a detached task owned by the coalescer
//! 2. Later requests become "Waiters" and subscribe to the key's broadcast channel
//! 3. When the producer settles, the key is removed from the pending map and the
//!    outcome (value or error) is broadcast to every subscriber
//!
//! Removal happens before the broadcast, so a retry issued from inside a
//! waiter's continuation always starts a fresh attempt. Dropping one caller's
//! future only drops its receiver; the spawned producer keeps running for the
//! others.

use crate::{CacheError, Result};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::fmt::Debug;
use std::future::Future;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::debug;

/// Only one message (the outcome) is ever sent per channel.
const BROADCAST_CHANNEL_CAPACITY: usize = 1;

type PendingMap<K, T> = Arc<DashMap<K, broadcast::Sender<Result<T>>>>;

/// Single-flight coordinator keyed by `K`, sharing outcomes of type `T`
pub struct FetchCoalescer<K, T> {
    pending: PendingMap<K, T>,
    producers_started: AtomicU64,
    coalesced_waits: AtomicU64,
}

/// Role assigned to a request after registration.
pub enum FetchRole<K, T>
where
    K: Eq + Hash,
{
    /// First request for this key - responsible for running the producer.
    Fetcher(FetchGuard<K, T>, broadcast::Receiver<Result<T>>),
    /// Subsequent request - waits for the running producer's outcome.
    Waiter(broadcast::Receiver<Result<T>>),
}

/// Guard that removes the key entry on completion or drop.
///
/// Cleanup happens even if the producer task panics or is aborted; waiters
/// then observe a closed channel.
pub struct FetchGuard<K, T>
where
    K: Eq + Hash,
{
    key: K,
    sender: broadcast::Sender<Result<T>>,
    pending: PendingMap<K, T>,
    completed: bool,
}

impl<K, T> FetchCoalescer<K, T>
where
    K: Eq + Hash + Clone + Debug + Send + Sync + 'static,
    T: Clone + Send + 'static,
{
    pub fn new() -> Self {
        Self {
            pending: Arc::new(DashMap::new()),
            producers_started: AtomicU64::new(0),
            coalesced_waits: AtomicU64::new(0),
        }
    }

    /// Atomically register interest in `key`.
    pub fn try_register(&self, key: &K) -> FetchRole<K, T> {
        match self.pending.entry(key.clone()) {
            Entry::Vacant(vacant) => {
                let (tx, rx) = broadcast::channel(BROADCAST_CHANNEL_CAPACITY);
                vacant.insert(tx.clone());

                let guard = FetchGuard {
                    key: key.clone(),
                    sender: tx,
                    pending: Arc::clone(&self.pending),
                    completed: false,
                };
                FetchRole::Fetcher(guard, rx)
            }
            Entry::Occupied(occupied) => FetchRole::Waiter(occupied.get().subscribe()),
        }
    }

    /// Run `producer` for `key` unless a run is already in flight, and wait
    /// for the shared outcome.
    ///
    /// The producer is spawned onto the runtime, so cancelling this future
    /// does not cancel the work other callers may be waiting on.
    pub async fn fetch<F, Fut>(&self, key: &K, producer: F) -> Result<T>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let mut receiver = match self.try_register(key) {
            FetchRole::Fetcher(guard, receiver) => {
                self.producers_started.fetch_add(1, Ordering::Relaxed);
                debug!("Starting producer for {:?}", key);
                tokio::spawn(async move {
                    let outcome = producer().await;
                    guard.complete(outcome);
                });
                receiver
            }
            FetchRole::Waiter(receiver) => {
                self.coalesced_waits.fetch_add(1, Ordering::Relaxed);
                debug!("Joining in-flight fetch for {:?}", key);
                receiver
            }
        };

        match receiver.recv().await {
            Ok(outcome) => outcome,
            Err(_) => Err(CacheError::FetchAbandoned(format!(
                "Producer for {:?} ended without an outcome",
                key
            ))),
        }
    }

    /// Number of keys with a producer currently running.
    pub fn in_flight_count(&self) -> usize {
        self.pending.len()
    }

    pub fn is_in_flight(&self, key: &K) -> bool {
        self.pending.contains_key(key)
    }

    /// Total producers started since construction.
    pub fn producers_started(&self) -> u64 {
        self.producers_started.load(Ordering::Relaxed)
    }

    /// Total callers that attached to an already running producer.
    pub fn coalesced_waits(&self) -> u64 {
        self.coalesced_waits.load(Ordering::Relaxed)
    }
}

impl<K, T> Default for FetchCoalescer<K, T>
where
    K: Eq + Hash + Clone + Debug + Send + Sync + 'static,
    T: Clone + Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, T> FetchGuard<K, T>
where
    K: Eq + Hash,
{
    /// Remove the key, then broadcast the outcome to every waiter.
    pub fn complete(mut self, outcome: Result<T>) {
        self.completed = true;
        self.pending.remove(&self.key);
        // No receivers is fine: every caller may have been cancelled
        let _ = self.sender.send(outcome);
    }

    pub fn key(&self) -> &K {
        &self.key
    }
}

impl<K, T> Drop for FetchGuard<K, T>
where
    K: Eq + Hash,
{
    fn drop(&mut self) {
        if !self.completed {
            // Producer never reported; closing the channel wakes the waiters
            self.pending.remove(&self.key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    type Coalescer = FetchCoalescer<String, Vec<u8>>;

    fn key(s: &str) -> String {
        s.to_string()
    }

    #[test]
    fn test_first_register_returns_fetcher() {
        let tracker = Coalescer::new();

        let _guard = match tracker.try_register(&key("book/1")) {
            FetchRole::Fetcher(guard, _) => guard,
            FetchRole::Waiter(_) => panic!("Expected Fetcher, got Waiter"),
        };

        assert_eq!(tracker.in_flight_count(), 1);
    }

    #[test]
    fn test_second_register_returns_waiter() {
        let tracker = Coalescer::new();

        let _guard = match tracker.try_register(&key("book/1")) {
            FetchRole::Fetcher(guard, _) => guard,
            FetchRole::Waiter(_) => panic!("Expected Fetcher for first registration"),
        };

        match tracker.try_register(&key("book/1")) {
            FetchRole::Fetcher(..) => panic!("Expected Waiter, got Fetcher"),
            FetchRole::Waiter(_) => {}
        }

        assert_eq!(tracker.in_flight_count(), 1);
    }

    #[test]
    fn test_complete_removes_entry() {
        let tracker = Coalescer::new();

        let guard = match tracker.try_register(&key("book/1")) {
            FetchRole::Fetcher(guard, _) => guard,
            FetchRole::Waiter(_) => panic!("Expected Fetcher"),
        };
        guard.complete(Err(CacheError::producer("HTTP 500")));

        assert_eq!(tracker.in_flight_count(), 0);
    }

    #[test]
    fn test_drop_without_complete_removes_entry() {
        let tracker = Coalescer::new();

        {
            let _guard = match tracker.try_register(&key("book/1")) {
                FetchRole::Fetcher(guard, _) => guard,
                FetchRole::Waiter(_) => panic!("Expected Fetcher"),
            };
            assert_eq!(tracker.in_flight_count(), 1);
        }

        assert_eq!(tracker.in_flight_count(), 0);
        assert!(matches!(
            tracker.try_register(&key("book/1")),
            FetchRole::Fetcher(..)
        ));
    }

    #[tokio::test]
    async fn test_waiter_receives_error_outcome() {
        let tracker = Coalescer::new();

        let guard = match tracker.try_register(&key("book/1")) {
            FetchRole::Fetcher(guard, _) => guard,
            FetchRole::Waiter(_) => panic!("Expected Fetcher"),
        };
        let mut rx = match tracker.try_register(&key("book/1")) {
            FetchRole::Waiter(rx) => rx,
            FetchRole::Fetcher(..) => panic!("Expected Waiter"),
        };

        tokio::spawn(async move {
            guard.complete(Err(CacheError::producer("connection reset")));
        });

        let outcome = rx.recv().await.unwrap();
        assert_eq!(
            outcome.unwrap_err(),
            CacheError::ProducerError("connection reset".to_string())
        );
    }

    #[tokio::test]
    async fn test_waiter_detects_channel_closure_on_drop() {
        let tracker = Coalescer::new();

        let guard = match tracker.try_register(&key("book/1")) {
            FetchRole::Fetcher(guard, _) => guard,
            FetchRole::Waiter(_) => panic!("Expected Fetcher"),
        };
        let mut rx = match tracker.try_register(&key("book/1")) {
            FetchRole::Waiter(rx) => rx,
            FetchRole::Fetcher(..) => panic!("Expected Waiter"),
        };

        drop(guard);

        assert!(rx.recv().await.is_err());
    }

    #[tokio::test]
    async fn test_concurrent_fetches_run_producer_once() {
        let tracker = Arc::new(Coalescer::new());
        let calls = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let tracker = Arc::clone(&tracker);
            let calls = Arc::clone(&calls);
            handles.push(tokio::spawn(async move {
                tracker
                    .fetch(&key("series/9"), move || async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Ok(vec![1, 2, 3])
                    })
                    .await
            }));
        }

        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap(), vec![1, 2, 3]);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(tracker.producers_started(), 1);
        assert_eq!(tracker.coalesced_waits(), 7);
        assert_eq!(tracker.in_flight_count(), 0);
    }

    #[tokio::test]
    async fn test_retry_after_failure_starts_fresh_attempt() {
        let tracker = Coalescer::new();

        let first = tracker
            .fetch(&key("k"), || async { Err(CacheError::producer("timeout")) })
            .await;
        assert!(first.is_err());
        assert!(!tracker.is_in_flight(&key("k")));

        let second = tracker.fetch(&key("k"), || async { Ok(vec![7]) }).await;
        assert_eq!(second.unwrap(), vec![7]);
        assert_eq!(tracker.producers_started(), 2);
    }

    #[tokio::test]
    async fn test_cancelled_caller_does_not_cancel_producer() {
        let tracker = Arc::new(Coalescer::new());
        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();

        let first = {
            let tracker = Arc::clone(&tracker);
            tokio::spawn(async move {
                tracker
                    .fetch(&key("k"), move || async move {
                        let _ = release_rx.await;
                        Ok(vec![42])
                    })
                    .await
            })
        };

        while !tracker.is_in_flight(&key("k")) {
            tokio::task::yield_now().await;
        }

        let second = {
            let tracker = Arc::clone(&tracker);
            tokio::spawn(async move {
                tracker
                    .fetch(&key("k"), || async {
                        Err(CacheError::producer("producer must not run twice"))
                    })
                    .await
            })
        };

        while tracker.coalesced_waits() == 0 {
            tokio::task::yield_now().await;
        }

        first.abort();
        let _ = release_tx.send(());

        assert_eq!(second.await.unwrap().unwrap(), vec![42]);
    }

    #[tokio::test]
    async fn test_panicking_producer_reports_abandoned() {
        let tracker = Coalescer::new();

        async fn crash() -> Result<Vec<u8>> {
            panic!("renderer crashed")
        }

        let outcome = tracker.fetch(&key("k"), crash).await;

        assert!(matches!(outcome, Err(CacheError::FetchAbandoned(_))));
        assert_eq!(tracker.in_flight_count(), 0);
    }
}
