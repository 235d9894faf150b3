//! Result cache with TTL expiry, an optional entry cap and single-flight
//! computation.
//!
//! A miss spawns the computation on the runtime and records it as in flight;
//! concurrent callers for the same key await that one computation. Because it
//! runs on its own task, a caller that gives up does not cancel it for the
//! others. Only successful results are stored.

use crate::error::{LabError, Result};
use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt::Debug;
use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Keys that belong to one experiment, so they can be invalidated together
pub trait ExperimentScoped {
    fn experiment_id(&self) -> &str;
}

/// Expiry and size bounds of a cache
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CachePolicy {
    /// Lifetime of an entry from its creation; `None` keeps entries until evicted
    #[serde(with = "humantime_serde")]
    pub ttl: Option<Duration>,
    /// Maximum number of entries; the oldest are evicted first
    pub capacity: Option<usize>,
}

impl CachePolicy {
    pub fn ttl(ttl: Duration) -> Self {
        Self {
            ttl: Some(ttl),
            capacity: None,
        }
    }

    pub fn capacity(capacity: usize) -> Self {
        Self {
            ttl: None,
            capacity: Some(capacity),
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = Some(capacity);
        self
    }
}

/// Point-in-time counters of a cache
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStatus {
    pub name: String,
    /// Unexpired entries
    pub entry_count: usize,
    pub in_flight: usize,
    pub ttl_ms: Option<u64>,
    pub capacity: Option<usize>,
    pub hits: u64,
    pub misses: u64,
    /// `hits / (hits + misses)`, 0 before the first lookup
    pub hit_rate: f64,
}

type SharedResult<V> = Shared<BoxFuture<'static, Result<Arc<V>>>>;

struct Entry<V> {
    value: Arc<V>,
    created: Instant,
}

struct Flight<V> {
    id: u64,
    result: SharedResult<V>,
}

struct CacheState<K, V> {
    entries: HashMap<K, Entry<V>>,
    inflight: HashMap<K, Flight<V>>,
    next_flight: u64,
    hits: u64,
    misses: u64,
}

/// Generic keyed result cache
pub struct ResultCache<K, V> {
    name: &'static str,
    policy: CachePolicy,
    state: Arc<Mutex<CacheState<K, V>>>,
}

impl<K, V> ResultCache<K, V>
where
    K: Eq + Hash + Clone + Debug + Send + 'static,
    V: Send + Sync + 'static,
{
    pub fn new(name: &'static str, policy: CachePolicy) -> Self {
        Self {
            name,
            policy,
            state: Arc::new(Mutex::new(CacheState {
                entries: HashMap::new(),
                inflight: HashMap::new(),
                next_flight: 0,
                hits: 0,
                misses: 0,
            })),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn policy(&self) -> &CachePolicy {
        &self.policy
    }

    fn is_fresh(&self, entry: &Entry<V>) -> bool {
        self.policy
            .ttl
            .map_or(true, |ttl| entry.created.elapsed() < ttl)
    }

    /// Return the cached value for `key`, or compute it once.
    ///
    /// `compute` is called at most once per miss and only builds the future;
    /// the future itself runs on a spawned task. Concurrent callers with the
    /// same key share the result, failures included, but a failure is never
    /// stored.
    pub async fn get_or_compute<F, Fut>(&self, key: K, compute: F) -> Result<Arc<V>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V>> + Send + 'static,
    {
        let pending = {
            let mut state = self.state.lock();
            let cached = state
                .entries
                .get(&key)
                .map(|entry| (self.is_fresh(entry), Arc::clone(&entry.value)));
            match cached {
                Some((true, value)) => {
                    state.hits += 1;
                    return Ok(value);
                }
                Some((false, _)) => {
                    state.entries.remove(&key);
                }
                None => {}
            }

            if let Some(flight) = state.inflight.get(&key) {
                let pending = flight.result.clone();
                state.hits += 1;
                tracing::trace!(cache = self.name, ?key, "joined in-flight computation");
                pending
            } else {
                state.misses += 1;
                let id = state.next_flight;
                state.next_flight += 1;
                tracing::debug!(cache = self.name, ?key, "cache miss");

                let task = tokio::spawn(run_flight(
                    Arc::clone(&self.state),
                    key.clone(),
                    id,
                    compute(),
                    self.policy.capacity,
                    self.name,
                ));
                let result: SharedResult<V> = async move {
                    match task.await {
                        Ok(result) => result,
                        Err(e) => Err(LabError::from(e)),
                    }
                }
                .boxed()
                .shared();
                state.inflight.insert(
                    key,
                    Flight {
                        id,
                        result: result.clone(),
                    },
                );
                result
            }
        };
        pending.await
    }

    /// Fresh cached value without computing or touching the counters
    pub fn peek(&self, key: &K) -> Option<Arc<V>> {
        let state = self.state.lock();
        state
            .entries
            .get(key)
            .filter(|entry| self.is_fresh(entry))
            .map(|entry| Arc::clone(&entry.value))
    }

    /// Drop one key, detaching any computation in flight for it
    pub fn remove(&self, key: &K) -> bool {
        let mut state = self.state.lock();
        let had_entry = state.entries.remove(key).is_some();
        let had_flight = state.inflight.remove(key).is_some();
        had_entry || had_flight
    }

    /// Drop every entry and detach every in-flight computation
    pub fn invalidate_all(&self) -> usize {
        let mut state = self.state.lock();
        let removed = state.entries.len() + state.inflight.len();
        state.entries.clear();
        state.inflight.clear();
        tracing::debug!(cache = self.name, removed, "cleared cache");
        removed
    }

    /// Remove expired entries; returns how many were dropped
    pub fn purge_expired(&self) -> usize {
        let Some(ttl) = self.policy.ttl else {
            return 0;
        };
        let mut state = self.state.lock();
        let before = state.entries.len();
        state.entries.retain(|_, entry| entry.created.elapsed() < ttl);
        before - state.entries.len()
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn status(&self) -> CacheStatus {
        let state = self.state.lock();
        let lookups = state.hits + state.misses;
        CacheStatus {
            name: self.name.to_string(),
            entry_count: state.entries.values().filter(|e| self.is_fresh(e)).count(),
            in_flight: state.inflight.len(),
            ttl_ms: self.policy.ttl.map(|ttl| ttl.as_millis() as u64),
            capacity: self.policy.capacity,
            hits: state.hits,
            misses: state.misses,
            hit_rate: if lookups == 0 {
                0.0
            } else {
                state.hits as f64 / lookups as f64
            },
        }
    }
}

impl<K, V> ResultCache<K, V>
where
    K: ExperimentScoped + Eq + Hash + Clone + Debug + Send + 'static,
    V: Send + Sync + 'static,
{
    /// Drop everything cached for one experiment.
    ///
    /// Computations in flight still answer the callers already waiting on
    /// them, but their results are not stored.
    pub fn invalidate(&self, experiment_id: &str) -> usize {
        let mut state = self.state.lock();
        let before = state.entries.len() + state.inflight.len();
        state.entries.retain(|key, _| key.experiment_id() != experiment_id);
        state.inflight.retain(|key, _| key.experiment_id() != experiment_id);
        let removed = before - state.entries.len() - state.inflight.len();
        tracing::debug!(cache = self.name, experiment = experiment_id, removed, "invalidated cache entries");
        removed
    }
}

impl<K, V> Debug for ResultCache<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResultCache")
            .field("name", &self.name)
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

/// Releases the in-flight slot of a computation that unwinds or is dropped
/// before it settles.
struct FlightGuard<K: Eq + Hash, V> {
    state: Arc<Mutex<CacheState<K, V>>>,
    key: Option<K>,
    id: u64,
}

impl<K: Eq + Hash, V> FlightGuard<K, V> {
    fn settle(&mut self) -> Option<K> {
        self.key.take()
    }
}

impl<K: Eq + Hash, V> Drop for FlightGuard<K, V> {
    fn drop(&mut self) {
        let Some(key) = self.key.take() else {
            return;
        };
        let mut state = self.state.lock();
        if state.inflight.get(&key).map(|flight| flight.id) == Some(self.id) {
            state.inflight.remove(&key);
        }
    }
}

async fn run_flight<K, V, Fut>(
    state: Arc<Mutex<CacheState<K, V>>>,
    key: K,
    id: u64,
    computation: Fut,
    capacity: Option<usize>,
    name: &'static str,
) -> Result<Arc<V>>
where
    K: Eq + Hash + Clone + Debug,
    Fut: Future<Output = Result<V>>,
{
    let started = Instant::now();
    let mut guard = FlightGuard {
        state: Arc::clone(&state),
        key: Some(key),
        id,
    };
    let result = computation.await.map(Arc::new);
    let Some(key) = guard.settle() else {
        return result;
    };

    let mut state = state.lock();
    let current = state.inflight.get(&key).map(|flight| flight.id) == Some(id);
    if !current {
        tracing::debug!(cache = name, ?key, "discarding result of invalidated computation");
        return result;
    }
    state.inflight.remove(&key);

    match &result {
        Ok(value) => {
            tracing::debug!(
                cache = name,
                ?key,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "cached computed value"
            );
            state.entries.insert(
                key,
                Entry {
                    value: Arc::clone(value),
                    created: Instant::now(),
                },
            );
            if let Some(capacity) = capacity {
                while state.entries.len() > capacity {
                    let oldest = state
                        .entries
                        .iter()
                        .min_by_key(|(_, entry)| entry.created)
                        .map(|(key, _)| key.clone());
                    match oldest {
                        Some(oldest) => {
                            state.entries.remove(&oldest);
                            tracing::debug!(cache = name, key = ?oldest, "evicted oldest entry");
                        }
                        None => break,
                    }
                }
            }
        }
        Err(e) => {
            tracing::warn!(cache = name, ?key, error = %e, "computation failed, not caching");
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CodecError;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Notify;
    use tracing_test::traced_test;

    #[derive(Debug, Clone, PartialEq, Eq, Hash)]
    struct Key(&'static str, u32);

    impl ExperimentScoped for Key {
        fn experiment_id(&self) -> &str {
            self.0
        }
    }

    #[tokio::test]
    async fn test_hit_after_miss() {
        let cache: ResultCache<Key, u32> = ResultCache::new("test", CachePolicy::default());
        let calls = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            let calls = Arc::clone(&calls);
            let value = cache
                .get_or_compute(Key("a", 1), move || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(7)
                })
                .await
                .unwrap();
            assert_eq!(*value, 7);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let status = cache.status();
        assert_eq!((status.hits, status.misses), (2, 1));
        assert_eq!(status.entry_count, 1);
    }

    #[tokio::test]
    async fn test_single_flight() {
        let cache: Arc<ResultCache<Key, u32>> =
            Arc::new(ResultCache::new("test", CachePolicy::default()));
        let calls = Arc::new(AtomicUsize::new(0));
        let gate = Arc::new(Notify::new());

        let mut handles = Vec::new();
        for _ in 0..16 {
            let cache = Arc::clone(&cache);
            let calls = Arc::clone(&calls);
            let gate = Arc::clone(&gate);
            handles.push(tokio::spawn(async move {
                cache
                    .get_or_compute(Key("a", 1), move || async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        gate.notified().await;
                        Ok(42)
                    })
                    .await
            }));
        }
        while cache.status().in_flight == 0 {
            tokio::task::yield_now().await;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        gate.notify_one();

        for handle in handles {
            assert_eq!(*handle.await.unwrap().unwrap(), 42);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failures_are_not_cached() {
        let cache: ResultCache<Key, u32> = ResultCache::new("test", CachePolicy::default());
        let err = cache
            .get_or_compute(Key("a", 1), || async {
                Err::<u32, _>(LabError::from(CodecError::MalformedHeader("short".into())))
            })
            .await
            .unwrap_err();
        assert!(matches!(err, LabError::Codec(CodecError::MalformedHeader(_))));
        assert!(cache.is_empty());
        assert_eq!(cache.status().in_flight, 0);

        let value = cache
            .get_or_compute(Key("a", 1), || async { Ok(3) })
            .await
            .unwrap();
        assert_eq!(*value, 3);
    }

    async fn exploding_decode() -> Result<u32> {
        panic!("decode blew up")
    }

    #[tokio::test]
    async fn test_panicked_computation_is_retried() {
        let cache: ResultCache<Key, u32> = ResultCache::new("test", CachePolicy::default());
        let err = cache
            .get_or_compute(Key("a", 1), exploding_decode)
            .await
            .unwrap_err();
        assert!(matches!(err, LabError::Task(_)));
        assert!(err.is_transient());
        assert_eq!(cache.status().in_flight, 0);
        assert!(cache.is_empty());

        let value = cache
            .get_or_compute(Key("a", 1), || async { Ok(2) })
            .await
            .unwrap();
        assert_eq!(*value, 2);
        assert_eq!(cache.status().misses, 2);
    }

    #[tokio::test]
    async fn test_ttl_expiry() {
        let cache: ResultCache<Key, u32> =
            ResultCache::new("test", CachePolicy::ttl(Duration::from_millis(30)));
        cache.get_or_compute(Key("a", 1), || async { Ok(1) }).await.unwrap();
        assert!(cache.peek(&Key("a", 1)).is_some());

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(cache.peek(&Key("a", 1)).is_none());
        assert_eq!(cache.status().entry_count, 0);
        assert_eq!(cache.purge_expired(), 1);

        let value = cache.get_or_compute(Key("a", 1), || async { Ok(2) }).await.unwrap();
        assert_eq!(*value, 2);
    }

    #[tokio::test]
    async fn test_capacity_evicts_oldest() {
        let cache: ResultCache<Key, u32> = ResultCache::new("test", CachePolicy::capacity(2));
        for i in 0..3 {
            cache.get_or_compute(Key("a", i), move || async move { Ok(i) }).await.unwrap();
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        assert_eq!(cache.len(), 2);
        assert!(cache.peek(&Key("a", 0)).is_none());
        assert!(cache.peek(&Key("a", 2)).is_some());
    }

    #[tokio::test]
    #[traced_test]
    async fn test_invalidate_recomputes() {
        let cache: ResultCache<Key, u32> = ResultCache::new("test", CachePolicy::default());
        cache.get_or_compute(Key("a", 1), || async { Ok(1) }).await.unwrap();
        cache.get_or_compute(Key("b", 1), || async { Ok(1) }).await.unwrap();

        assert_eq!(cache.invalidate("a"), 1);
        assert!(logs_contain("invalidated cache entries"));

        let value = cache.get_or_compute(Key("a", 1), || async { Ok(5) }).await.unwrap();
        assert_eq!(*value, 5);
        assert!(cache.peek(&Key("b", 1)).is_some());
    }

    #[tokio::test]
    async fn test_invalidate_during_flight_delivers_but_does_not_retain() {
        let cache: Arc<ResultCache<Key, u32>> =
            Arc::new(ResultCache::new("test", CachePolicy::default()));
        let gate = Arc::new(Notify::new());

        let waiter = {
            let cache = Arc::clone(&cache);
            let gate = Arc::clone(&gate);
            tokio::spawn(async move {
                cache
                    .get_or_compute(Key("a", 1), move || async move {
                        gate.notified().await;
                        Ok(10)
                    })
                    .await
            })
        };
        while cache.status().in_flight == 0 {
            tokio::task::yield_now().await;
        }

        cache.invalidate("a");
        gate.notify_one();
        assert_eq!(*waiter.await.unwrap().unwrap(), 10);
        assert!(cache.peek(&Key("a", 1)).is_none());

        let value = cache.get_or_compute(Key("a", 1), || async { Ok(11) }).await.unwrap();
        assert_eq!(*value, 11);
    }

    #[tokio::test]
    async fn test_abandoned_caller_does_not_cancel() {
        let cache: Arc<ResultCache<Key, u32>> =
            Arc::new(ResultCache::new("test", CachePolicy::default()));
        let gate = Arc::new(Notify::new());

        let caller = {
            let cache = Arc::clone(&cache);
            let gate = Arc::clone(&gate);
            tokio::spawn(async move {
                cache
                    .get_or_compute(Key("a", 1), move || async move {
                        gate.notified().await;
                        Ok(99)
                    })
                    .await
            })
        };
        while cache.status().in_flight == 0 {
            tokio::task::yield_now().await;
        }
        caller.abort();
        gate.notify_one();

        while cache.status().in_flight > 0 {
            tokio::task::yield_now().await;
        }
        assert_eq!(cache.peek(&Key("a", 1)).as_deref(), Some(&99));
    }
}
