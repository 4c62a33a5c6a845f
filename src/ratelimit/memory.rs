//! In-process counter store.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace};

use super::clock::{Clock, SystemClock};
use super::counter::{deadline, CounterEntry};
use super::store::{CounterStore, StoreResult};

/// Default interval between sweeps of expired entries.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(300);

struct Shared {
    /// Counter entries indexed by key
    entries: Mutex<HashMap<String, CounterEntry>>,
    clock: Arc<dyn Clock>,
}

impl Shared {
    fn sweep(&self) -> usize {
        let now = self.clock.now();
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, entry| !entry.is_expired(now));
        before - entries.len()
    }
}

/// A counter store held in process memory.
///
/// Every read-modify-write happens under one mutex, which makes
/// `increment` atomic per key. Expired entries are treated as absent on
/// read, so the optional background sweeper only bounds memory.
pub struct MemoryStore {
    shared: Arc<Shared>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl MemoryStore {
    /// Create an empty store on the system clock.
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock::new()))
    }

    /// Create an empty store reading time from `clock`.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            shared: Arc::new(Shared {
                entries: Mutex::new(HashMap::new()),
                clock,
            }),
            sweeper: Mutex::new(None),
        }
    }

    /// Create an empty store on the system clock that sweeps every
    /// `interval`, if created inside a Tokio runtime.
    ///
    /// Outside a runtime the store still works; expired entries are then
    /// only dropped by [`sweep`](Self::sweep) or overwritten on increment.
    pub fn sweeping(interval: Duration) -> Self {
        let store = Self::new();
        if tokio::runtime::Handle::try_current().is_ok() {
            store.start_sweeper(interval);
        }
        store
    }

    /// Spawn a task that drops expired entries every `interval`.
    ///
    /// Must be called from within a Tokio runtime. Calling it again replaces
    /// the running sweeper. The task stops on [`close`](Self::close) or when
    /// the store is dropped.
    pub fn start_sweeper(&self, interval: Duration) {
        let shared = Arc::clone(&self.shared);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let removed = shared.sweep();
                if removed > 0 {
                    debug!(removed = removed, "Swept expired rate limit counters");
                }
            }
        });

        info!(interval = ?interval, "Started counter sweeper");
        if let Some(previous) = self.sweeper.lock().replace(handle) {
            previous.abort();
        }
    }

    /// Remove every expired entry now, returning how many were dropped.
    pub fn sweep(&self) -> usize {
        self.shared.sweep()
    }

    /// Stop the background sweeper, if one is running.
    pub fn close(&self) {
        if let Some(handle) = self.sweeper.lock().take() {
            handle.abort();
            debug!("Stopped counter sweeper");
        }
    }

    /// Whether a background sweeper is running.
    pub fn is_sweeping(&self) -> bool {
        self.sweeper
            .lock()
            .as_ref()
            .map_or(false, |handle| !handle.is_finished())
    }

    /// Get the number of stored entries, expired ones included.
    pub fn len(&self) -> usize {
        self.shared.entries.lock().len()
    }

    /// Whether the store holds no entries at all.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Clear all counters.
    pub fn clear(&self) {
        self.shared.entries.lock().clear();
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for MemoryStore {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStore")
            .field("entries", &self.len())
            .field("clock", &self.shared.clock)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl CounterStore for MemoryStore {
    async fn get(&self, key: &str) -> StoreResult<Option<CounterEntry>> {
        let now = self.shared.clock.now();
        let entries = self.shared.entries.lock();
        Ok(entries
            .get(key)
            .filter(|entry| !entry.is_expired(now))
            .copied())
    }

    async fn set(&self, key: &str, count: u64, ttl: Duration) -> StoreResult<()> {
        let window_end = deadline(self.shared.clock.now(), ttl);
        self.shared
            .entries
            .lock()
            .insert(key.to_string(), CounterEntry { count, window_end });
        Ok(())
    }

    async fn increment(&self, key: &str, ttl: Duration) -> StoreResult<CounterEntry> {
        let now = self.shared.clock.now();
        let mut entries = self.shared.entries.lock();

        let entry = match entries.get_mut(key) {
            Some(entry) if !entry.is_expired(now) => {
                entry.count = entry.count.saturating_add(1);
                *entry
            }
            _ => {
                trace!(key = %key, "Starting new counter window");
                let entry = CounterEntry::first(now, ttl);
                entries.insert(key.to_string(), entry);
                entry
            }
        };

        Ok(entry)
    }

    async fn reset(&self, key: &str) -> StoreResult<()> {
        self.shared.entries.lock().remove(key);
        Ok(())
    }

    fn close(&self) {
        MemoryStore::close(self);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::clock::MockClock;
    use chrono::Utc;

    const WINDOW: Duration = Duration::from_millis(1000);

    fn store_with_clock() -> (MemoryStore, MockClock) {
        let clock = MockClock::new(Utc::now());
        let store = MemoryStore::with_clock(Arc::new(clock.clone()));
        (store, clock)
    }

    #[tokio::test]
    async fn test_increment_counts_within_window() {
        let (store, clock) = store_with_clock();
        let start = clock.now();

        for expected in 1..=3 {
            let entry = store.increment("client", WINDOW).await.unwrap();
            assert_eq!(entry.count, expected);
        }

        let entry = store.get("client").await.unwrap().unwrap();
        assert_eq!(entry.count, 3);
        assert_eq!(entry.window_end, start + chrono::Duration::milliseconds(1000));
    }

    #[tokio::test]
    async fn test_increment_keeps_first_window_end() {
        let (store, clock) = store_with_clock();
        let first = store.increment("client", WINDOW).await.unwrap();

        clock.advance(Duration::from_millis(400));
        let second = store.increment("client", WINDOW).await.unwrap();

        assert_eq!(second.count, 2);
        assert_eq!(second.window_end, first.window_end);
    }

    #[tokio::test]
    async fn test_increment_restarts_after_expiry() {
        let (store, clock) = store_with_clock();
        for _ in 0..5 {
            store.increment("client", WINDOW).await.unwrap();
        }

        clock.advance(WINDOW);
        assert!(store.get("client").await.unwrap().is_none());

        let entry = store.increment("client", WINDOW).await.unwrap();
        assert_eq!(entry.count, 1);
        assert_eq!(entry.window_end, clock.now() + chrono::Duration::milliseconds(1000));
    }

    #[tokio::test]
    async fn test_get_does_not_mutate() {
        let (store, _clock) = store_with_clock();
        assert!(store.get("missing").await.unwrap().is_none());
        assert!(store.is_empty());

        store.increment("client", WINDOW).await.unwrap();
        for _ in 0..3 {
            assert_eq!(store.get("client").await.unwrap().unwrap().count, 1);
        }
    }

    #[tokio::test]
    async fn test_set_and_reset() {
        let (store, _clock) = store_with_clock();

        store.set("client", 42, WINDOW).await.unwrap();
        assert_eq!(store.get("client").await.unwrap().unwrap().count, 42);
        assert_eq!(store.increment("client", WINDOW).await.unwrap().count, 43);

        store.reset("client").await.unwrap();
        assert!(store.get("client").await.unwrap().is_none());
        assert_eq!(store.increment("client", WINDOW).await.unwrap().count, 1);
    }

    #[tokio::test]
    async fn test_keys_are_isolated() {
        let (store, _clock) = store_with_clock();

        store.increment("a", WINDOW).await.unwrap();
        store.increment("a", WINDOW).await.unwrap();
        store.increment("b", WINDOW).await.unwrap();

        assert_eq!(store.get("a").await.unwrap().unwrap().count, 2);
        assert_eq!(store.get("b").await.unwrap().unwrap().count, 1);
    }

    #[tokio::test]
    async fn test_sweep_removes_only_expired() {
        let (store, clock) = store_with_clock();
        store.increment("short", Duration::from_millis(100)).await.unwrap();
        store.increment("long", Duration::from_secs(60)).await.unwrap();

        clock.advance(Duration::from_millis(500));
        assert_eq!(store.sweep(), 1);
        assert_eq!(store.len(), 1);
        assert!(store.get("long").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_increment_saturates_at_max() {
        let (store, _clock) = store_with_clock();

        store.set("client", u64::MAX, WINDOW).await.unwrap();
        let entry = store.increment("client", WINDOW).await.unwrap();
        assert_eq!(entry.count, u64::MAX);
    }

    #[tokio::test]
    async fn test_sweeping_store_starts_inside_runtime() {
        let store = MemoryStore::sweeping(DEFAULT_SWEEP_INTERVAL);
        assert!(store.is_sweeping());

        store.close();
        assert!(!store.is_sweeping());
    }

    #[test]
    fn test_sweeping_store_outside_runtime_is_passive() {
        let store = MemoryStore::sweeping(DEFAULT_SWEEP_INTERVAL);
        assert!(!store.is_sweeping());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_increments_lose_nothing() {
        let store = Arc::new(MemoryStore::new());

        let handles: Vec<_> = (0..100)
            .map(|_| {
                let store = Arc::clone(&store);
                tokio::spawn(async move { store.increment("hot", WINDOW * 60).await.unwrap().count })
            })
            .collect();

        let mut counts = Vec::with_capacity(100);
        for handle in handles {
            counts.push(handle.await.unwrap());
        }
        counts.sort_unstable();

        assert_eq!(counts, (1..=100).collect::<Vec<u64>>());
        assert_eq!(store.get("hot").await.unwrap().unwrap().count, 100);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_runs_and_closes() {
        let clock = MockClock::new(Utc::now());
        let store = MemoryStore::with_clock(Arc::new(clock.clone()));
        store.increment("client", WINDOW).await.unwrap();
        clock.advance(WINDOW * 2);

        store.start_sweeper(Duration::from_secs(300));
        assert!(store.is_sweeping());

        tokio::time::sleep(Duration::from_secs(301)).await;
        assert!(store.is_empty());

        store.close();
        assert!(!store.is_sweeping());
    }
}
