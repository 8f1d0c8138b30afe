//! In-memory cache store with request coalescing.

use chrono::{DateTime, TimeDelta, Utc};
use futures::future::{BoxFuture, FutureExt, Shared};
use market_core::{Clock, DataError, Result, SystemClock};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;
use tracing::{debug, instrument, trace};

use crate::policy::TtlDecision;

type InFlight = Shared<BoxFuture<'static, Result<Value>>>;

/// Cache entry with absolute expiry.
#[derive(Debug, Clone)]
struct CacheEntry {
    value: Value,
    created_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
}

impl CacheEntry {
    fn new(value: Value, now: DateTime<Utc>, ttl: Duration) -> Self {
        Self {
            value,
            created_at: now,
            expires_at: now + TimeDelta::from_std(ttl).unwrap_or(TimeDelta::MAX),
        }
    }

    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    fn is_fresh_for(&self, now: DateTime<Utc>, max_age: Duration) -> bool {
        !self.is_expired(now)
            && now.signed_duration_since(self.created_at)
                <= TimeDelta::from_std(max_age).unwrap_or(TimeDelta::MAX)
    }
}

/// A value read through the cache, with whether it was served from a stored entry.
#[derive(Debug, Clone, PartialEq)]
pub struct Cached<T> {
    /// The value.
    pub value: T,
    /// True if served from a stored entry, false if computed by this call
    /// or by the in-flight computation it joined.
    pub from_cache: bool,
}

impl<T> Cached<T> {
    /// Cache status as reported in response headers.
    #[must_use]
    pub const fn status(&self) -> &'static str {
        if self.from_cache { "HIT" } else { "MISS" }
    }

    /// Maps the value, keeping the cache status.
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Cached<U> {
        Cached {
            value: f(self.value),
            from_cache: self.from_cache,
        }
    }
}

struct Inner {
    clock: Arc<dyn Clock>,
    entries: RwLock<HashMap<String, CacheEntry>>,
    in_flight: Mutex<HashMap<String, InFlight>>,
}

/// Process-wide key/value cache with expiry.
///
/// Values are held as JSON. The store is a cheap handle: clones share the
/// same entries. [`CacheStore::get_or_set`] runs at most one computation per
/// key at a time; concurrent callers for the same key await that computation.
#[derive(Clone)]
pub struct CacheStore {
    inner: Arc<Inner>,
}

impl fmt::Debug for CacheStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheStore")
            .field("entries", &self.len())
            .field("in_flight", &self.in_flight_len())
            .finish()
    }
}

impl Default for CacheStore {
    fn default() -> Self {
        Self::new()
    }
}

impl CacheStore {
    /// Creates an empty cache reading time from the system clock.
    #[must_use]
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Creates an empty cache reading time from `clock`.
    #[must_use]
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Arc::new(Inner {
                clock,
                entries: RwLock::new(HashMap::new()),
                in_flight: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Returns the stored value, evicting it if expired.
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        self.get_value(key, None).map(decode).transpose()
    }

    /// Stores `value` for `ttl`. A zero TTL stores nothing.
    pub fn set<T: Serialize>(&self, key: &str, value: &T, ttl: Duration) -> Result<()> {
        let value = encode(value)?;
        self.set_value(key, value, ttl);
        Ok(())
    }

    /// Stores `value` with the write TTL of `decision`.
    pub fn set_with_policy<T: Serialize>(
        &self,
        key: &str,
        value: &T,
        decision: TtlDecision,
    ) -> Result<()> {
        self.set(key, value, decision.write_ttl)
    }

    /// Returns the stored value or computes, stores and returns it.
    ///
    /// A stored entry is served if it is younger than `decision.read_ttl`.
    /// Otherwise the call joins the computation already running for `key`,
    /// or starts `compute` and stores its value for `decision.write_ttl`.
    /// A failed computation stores nothing and every waiter receives the
    /// error; the next call starts over.
    pub async fn get_or_set<T, F, Fut>(
        &self,
        key: &str,
        decision: TtlDecision,
        compute: F,
    ) -> Result<Cached<T>>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        self.get_or_set_if(key, decision, compute, |_: &T| true)
            .await
    }

    /// [`get_or_set`](Self::get_or_set) that stores a computed value only if
    /// `keep` accepts it.
    ///
    /// A rejected value is still returned to every waiter of that
    /// computation, but never becomes visible to later callers.
    #[instrument(skip(self, compute, keep), fields(key = %key))]
    pub async fn get_or_set_if<T, F, Fut, K>(
        &self,
        key: &str,
        decision: TtlDecision,
        compute: F,
        keep: K,
    ) -> Result<Cached<T>>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>> + Send + 'static,
        K: FnOnce(&T) -> bool + Send + 'static,
    {
        let task = {
            let mut in_flight = self
                .inner
                .in_flight
                .lock()
                .unwrap_or_else(PoisonError::into_inner);

            if let Some(task) = in_flight.get(key) {
                debug!("Joining in-flight computation");
                task.clone()
            } else {
                let stored = if decision.bypass_read() {
                    None
                } else {
                    self.get_value(key, Some(decision.read_ttl))
                };
                if let Some(value) = stored {
                    trace!("Cache hit");
                    return Ok(Cached {
                        value: decode(value)?,
                        from_cache: true,
                    });
                }

                debug!("Cache miss, computing");
                let task =
                    self.spawn_compute(key.to_string(), decision.write_ttl, compute(), keep);
                in_flight.insert(key.to_string(), task.clone());
                task
            }
        };

        let value = task.await?;
        Ok(Cached {
            value: decode(value)?,
            from_cache: false,
        })
    }

    /// Removes an entry. Returns true if it existed.
    pub fn invalidate(&self, key: &str) -> bool {
        self.inner
            .entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key)
            .is_some()
    }

    /// Removes every expired entry and returns how many were removed.
    #[instrument(skip(self))]
    pub fn purge_expired(&self) -> usize {
        let now = self.inner.clock.now();
        let mut entries = self
            .inner
            .entries
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let before = entries.len();
        entries.retain(|_, entry| !entry.is_expired(now));
        let removed = before - entries.len();
        if removed > 0 {
            debug!("Purged {} expired cache entries", removed);
        }
        removed
    }

    /// Number of stored entries, including expired ones not yet purged.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner
            .entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Returns true if nothing is stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Removes every entry.
    pub fn clear(&self) {
        self.inner
            .entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        debug!("Cleared all cache entries");
    }

    fn in_flight_len(&self) -> usize {
        self.inner
            .in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    fn spawn_compute<T, Fut, K>(
        &self,
        key: String,
        write_ttl: Duration,
        compute: Fut,
        keep: K,
    ) -> InFlight
    where
        T: Serialize + Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
        K: FnOnce(&T) -> bool + Send + 'static,
    {
        let store = self.clone();
        async move {
            let result = compute
                .await
                .and_then(|value| Ok((keep(&value), encode(&value)?)));
            let result = match result {
                Ok((true, value)) => {
                    store.set_value(&key, value.clone(), write_ttl);
                    Ok(value)
                }
                Ok((false, value)) => {
                    debug!(key = %key, "Computed value rejected, nothing cached");
                    Ok(value)
                }
                Err(e) => {
                    debug!(key = %key, error = %e, "Computation failed, nothing cached");
                    Err(e)
                }
            };
            store
                .inner
                .in_flight
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&key);
            result
        }
        .boxed()
        .shared()
    }

    fn get_value(&self, key: &str, max_age: Option<Duration>) -> Option<Value> {
        let now = self.inner.clock.now();
        {
            let entries = self
                .inner
                .entries
                .read()
                .unwrap_or_else(PoisonError::into_inner);
            match entries.get(key) {
                None => return None,
                Some(entry) if !entry.is_expired(now) => {
                    let fresh = max_age.is_none_or(|age| entry.is_fresh_for(now, age));
                    return fresh.then(|| entry.value.clone());
                }
                Some(_) => {}
            }
        }

        let mut entries = self
            .inner
            .entries
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if entries.get(key).is_some_and(|entry| entry.is_expired(now)) {
            entries.remove(key);
            trace!(key = %key, "Evicted expired entry");
        }
        None
    }

    fn set_value(&self, key: &str, value: Value, ttl: Duration) {
        if ttl.is_zero() {
            return;
        }
        let entry = CacheEntry::new(value, self.inner.clock.now(), ttl);
        self.inner
            .entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_string(), entry);
    }
}

fn encode<T: Serialize>(value: &T) -> Result<Value> {
    serde_json::to_value(value).map_err(|e| DataError::Parse(e.to_string()))
}

fn decode<T: DeserializeOwned>(value: Value) -> Result<T> {
    serde_json::from_value(value).map_err(|e| DataError::Parse(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use market_core::ManualClock;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn clock() -> Arc<ManualClock> {
        Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 1, 8, 5, 0, 0).unwrap(),
        ))
    }

    #[test]
    fn test_get_set_and_expiry() {
        let clock = clock();
        let cache = CacheStore::with_clock(clock.clone());

        assert_eq!(cache.get::<u32>("k").unwrap(), None);
        cache.set("k", &7u32, Duration::from_secs(60)).unwrap();
        assert_eq!(cache.get::<u32>("k").unwrap(), Some(7));

        clock.advance(Duration::from_secs(61));
        assert_eq!(cache.get::<u32>("k").unwrap(), None);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_zero_ttl_stores_nothing() {
        let cache = CacheStore::with_clock(clock());
        cache.set("k", &1u32, Duration::ZERO).unwrap();
        assert!(cache.is_empty());
    }

    #[test]
    fn test_purge_and_invalidate() {
        let clock = clock();
        let cache = CacheStore::with_clock(clock.clone());
        cache.set("short", &1u32, Duration::from_secs(10)).unwrap();
        cache.set("long", &2u32, Duration::from_secs(100)).unwrap();

        clock.advance(Duration::from_secs(20));
        assert_eq!(cache.purge_expired(), 1);
        assert_eq!(cache.len(), 1);

        assert!(cache.invalidate("long"));
        assert!(!cache.invalidate("long"));
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_get_or_set_computes_once_then_hits() {
        let clock = clock();
        let cache = CacheStore::with_clock(clock.clone());
        let calls = Arc::new(AtomicUsize::new(0));
        let decision = TtlDecision::fixed(Duration::from_secs(60));

        for expected_from_cache in [false, true] {
            let calls = calls.clone();
            let cached = cache
                .get_or_set("k", decision, move || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, DataError>(vec![1.5, 2.5])
                })
                .await
                .unwrap();
            assert_eq!(cached.value, vec![1.5, 2.5]);
            assert_eq!(cached.from_cache, expected_from_cache);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        // Expired: computed again.
        clock.advance(Duration::from_secs(61));
        let calls_after = calls.clone();
        let cached = cache
            .get_or_set("k", decision, move || async move {
                calls_after.fetch_add(1, Ordering::SeqCst);
                Ok::<_, DataError>(vec![3.5])
            })
            .await
            .unwrap();
        assert_eq!(cached.status(), "MISS");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_concurrent_callers_share_one_computation() {
        let cache = CacheStore::with_clock(clock());
        let calls = Arc::new(AtomicUsize::new(0));
        let decision = TtlDecision::fixed(Duration::from_secs(60));

        let tasks = (0..8).map(|_| {
            let cache = cache.clone();
            let calls = calls.clone();
            async move {
                cache
                    .get_or_set("shared", decision, move || async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        Ok::<_, DataError>(42u32)
                    })
                    .await
            }
        });

        let results = futures::future::join_all(tasks).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        for result in results {
            let cached = result.unwrap();
            assert_eq!(cached.value, 42);
            assert!(!cached.from_cache);
        }
    }

    #[tokio::test]
    async fn test_failure_is_shared_and_not_cached() {
        let cache = CacheStore::with_clock(clock());
        let decision = TtlDecision::fixed(Duration::from_secs(60));

        let failing = || async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            Err::<u32, _>(DataError::Network("connection reset".into()))
        };
        let (a, b) = tokio::join!(
            cache.get_or_set("k", decision, failing),
            cache.get_or_set("k", decision, failing),
        );
        assert!(matches!(a, Err(DataError::Network(_))));
        assert!(matches!(b, Err(DataError::Network(_))));
        assert!(cache.is_empty());

        let cached = cache
            .get_or_set("k", decision, || async { Ok::<_, DataError>(5u32) })
            .await
            .unwrap();
        assert_eq!(cached.value, 5);
        assert!(!cached.from_cache);
    }

    #[tokio::test]
    async fn test_rejected_value_is_shared_and_not_cached() {
        let cache = CacheStore::with_clock(clock());
        let decision = TtlDecision::fixed(Duration::from_secs(60));
        let calls = Arc::new(AtomicUsize::new(0));

        let partial = || {
            let calls = calls.clone();
            move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(10)).await;
                Ok::<_, DataError>(vec![1u32])
            }
        };
        let complete = |v: &Vec<u32>| v.len() > 1;

        let (a, b) = tokio::join!(
            cache.get_or_set_if("k", decision, partial(), complete),
            cache.get_or_set_if("k", decision, partial(), complete),
        );
        assert_eq!(a.unwrap().value, vec![1]);
        assert_eq!(b.unwrap().value, vec![1]);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(cache.is_empty());

        let next = cache
            .get_or_set_if("k", decision, partial(), complete)
            .await
            .unwrap();
        assert_eq!(next.status(), "MISS");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_refresh_bypasses_stored_entry() {
        let cache = CacheStore::with_clock(clock());
        cache.set("k", &1u32, Duration::from_secs(60)).unwrap();

        let refresh = TtlDecision {
            read_ttl: Duration::ZERO,
            write_ttl: Duration::from_secs(60),
        };
        let cached = cache
            .get_or_set("k", refresh, || async { Ok::<_, DataError>(2u32) })
            .await
            .unwrap();
        assert_eq!(cached.value, 2);
        assert!(!cached.from_cache);
        assert_eq!(cache.get::<u32>("k").unwrap(), Some(2));
    }

    #[tokio::test]
    async fn test_read_ttl_shorter_than_entry() {
        let clock = clock();
        let cache = CacheStore::with_clock(clock.clone());
        cache.set("k", &1u32, Duration::from_secs(3600)).unwrap();
        clock.advance(Duration::from_secs(120));

        let decision = TtlDecision::fixed(Duration::from_secs(60));
        let cached = cache
            .get_or_set("k", decision, || async { Ok::<_, DataError>(2u32) })
            .await
            .unwrap();
        assert_eq!(cached.value, 2);
    }
}
