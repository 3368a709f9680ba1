//! TTL + LRU cache with single-flight loading.
//!
//! Concurrent `get_or_load` calls for the same key share one in-flight load.
//! Every waiter gets that load's result; only successes are cached.
//!
//! Lock order is `in_flight` before `inner`.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Duration, Utc};
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use parking_lot::Mutex;
use serde::Serialize;

use crate::error::{AppError, Result};
use crate::utils::clock::Clock;

type SharedLoad<V> = Shared<BoxFuture<'static, std::result::Result<V, Arc<AppError>>>>;

struct Entry<V> {
    value: V,
    expires_at: DateTime<Utc>,
    tick: u64,
}

struct Inner<K, V> {
    entries: HashMap<K, Entry<V>>,
    /// Access order, oldest first
    order: BTreeMap<u64, K>,
    tick: u64,
}

impl<K: Eq + Hash + Clone, V> Inner<K, V> {
    fn next_tick(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }

    fn touch(&mut self, key: &K) {
        let tick = self.next_tick();
        if let Some(entry) = self.entries.get_mut(key) {
            self.order.remove(&entry.tick);
            entry.tick = tick;
            self.order.insert(tick, key.clone());
        }
    }

    fn remove(&mut self, key: &K) -> Option<Entry<V>> {
        let entry = self.entries.remove(key)?;
        self.order.remove(&entry.tick);
        Some(entry)
    }

    fn pop_oldest(&mut self) -> Option<K> {
        let (_, key) = self.order.pop_first()?;
        self.entries.remove(&key);
        Some(key)
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
    pub loads: u64,
    pub coalesced: u64,
    pub evictions: u64,
}

pub struct TtlCache<K, V> {
    inner: Mutex<Inner<K, V>>,
    in_flight: Mutex<HashMap<K, SharedLoad<V>>>,
    max_entries: usize,
    default_ttl: Duration,
    clock: Arc<dyn Clock>,
    hits: AtomicU64,
    misses: AtomicU64,
    loads: AtomicU64,
    coalesced: AtomicU64,
    evictions: AtomicU64,
}

impl<K, V> TtlCache<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub fn new(max_entries: usize, default_ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Mutex::new(Inner {
                entries: HashMap::new(),
                order: BTreeMap::new(),
                tick: 0,
            }),
            in_flight: Mutex::new(HashMap::new()),
            max_entries: max_entries.max(1),
            default_ttl,
            clock,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            loads: AtomicU64::new(0),
            coalesced: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    /// Fresh value for `key`, refreshing its recency. Expired entries are
    /// dropped on the way.
    fn lookup(&self, key: &K) -> Option<V> {
        let now = self.clock.now();
        let mut inner = self.inner.lock();
        let expired = inner.entries.get(key)?.expires_at <= now;
        if expired {
            inner.remove(key);
            return None;
        }
        inner.touch(key);
        inner.entries.get(key).map(|e| e.value.clone())
    }

    pub fn get(&self, key: &K) -> Option<V> {
        let found = self.lookup(key);
        if found.is_some() {
            self.hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
        }
        found
    }

    /// Insert with an explicit TTL, evicting least recently used entries
    /// above capacity.
    pub fn set(&self, key: K, value: V, ttl: Duration) {
        let expires_at = self.clock.now() + ttl;
        let mut inner = self.inner.lock();
        inner.remove(&key);
        let tick = inner.next_tick();
        inner.order.insert(tick, key.clone());
        inner.entries.insert(
            key,
            Entry {
                value,
                expires_at,
                tick,
            },
        );

        while inner.entries.len() > self.max_entries {
            if inner.pop_oldest().is_none() {
                break;
            }
            self.evictions.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Cached value, or the result of the single in-flight load for `key`.
    ///
    /// `loader` only runs when nothing is cached and no load is in flight.
    /// A failed load is reported to every waiter and not cached.
    pub async fn get_or_load<F, Fut>(&self, key: K, ttl: Duration, loader: F) -> Result<V>
    where
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = Result<V>> + Send + 'static,
    {
        if let Some(value) = self.get(&key) {
            return Ok(value);
        }

        let load = {
            let mut in_flight = self.in_flight.lock();
            // Another load may have finished between the miss and this lock.
            if let Some(value) = self.lookup(&key) {
                return Ok(value);
            }
            match in_flight.get(&key) {
                Some(pending) => {
                    self.coalesced.fetch_add(1, Ordering::Relaxed);
                    pending.clone()
                }
                None => {
                    self.loads.fetch_add(1, Ordering::Relaxed);
                    let load = loader().map(|r| r.map_err(Arc::new)).boxed().shared();
                    in_flight.insert(key.clone(), load.clone());
                    load
                }
            }
        };

        let result = load.clone().await;

        {
            let mut in_flight = self.in_flight.lock();
            let ours = in_flight.get(&key).is_some_and(|p| p.ptr_eq(&load));
            if ours {
                in_flight.remove(&key);
                if let Ok(value) = &result {
                    self.set(key, value.clone(), ttl);
                }
            }
        }

        result.map_err(AppError::Shared)
    }

    pub fn remove(&self, key: &K) -> Option<V> {
        self.inner.lock().remove(key).map(|e| e.value)
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.entries.clear();
        inner.order.clear();
    }

    /// Drop every expired entry. Returns how many were removed.
    pub fn sweep_expired(&self) -> usize {
        let now = self.clock.now();
        let mut inner = self.inner.lock();
        let expired: Vec<K> = inner
            .entries
            .iter()
            .filter(|(_, e)| e.expires_at <= now)
            .map(|(k, _)| k.clone())
            .collect();
        for key in &expired {
            inner.remove(key);
        }
        expired.len()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.len(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            loads: self.loads.load(Ordering::Relaxed),
            coalesced: self.coalesced.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }
}
