//! Keyed query cache with coalesced fetches and background revalidation.
//!
//! Each key holds a *confirmed* value (last fetch result) and an optional
//! *pending* value written by [`QueryCache::mutate`]. Readers see the pending
//! value when present. A fetch that resolves replaces both, so server truth
//! always wins once it arrives.
//!
//! Fetches run on spawned tokio tasks and are shared between every caller
//! asking for the same key. Must be used from within a tokio runtime.

use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use tender_api::ApiError;
use tokio::time::Instant;
use tracing::{debug, warn};

pub type FetchFuture<V> = BoxFuture<'static, Result<V, ApiError>>;
type SharedFetch<V> = Shared<FetchFuture<V>>;
type FetchFn<K, V> = dyn Fn(K) -> FetchFuture<V> + Send + Sync;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RevalidateTrigger {
    Focus,
    Reconnect,
}

#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub revalidate_on_focus: bool,
    pub revalidate_on_reconnect: bool,
    /// Entries older than this count as stale. `None` means only explicit
    /// invalidation or triggers make an entry stale.
    pub stale_after: Option<Duration>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            revalidate_on_focus: false,
            revalidate_on_reconnect: true,
            stale_after: None,
        }
    }
}

/// Point-in-time view of one cache entry.
#[derive(Debug, Clone, PartialEq)]
pub struct QuerySnapshot<V> {
    pub data: Option<V>,
    /// No data yet and a fetch is outstanding.
    pub is_loading: bool,
    /// A fetch is outstanding, with or without data on display.
    pub is_validating: bool,
    pub is_stale: bool,
    /// The displayed value is a local overwrite not yet confirmed by a fetch.
    pub is_optimistic: bool,
    /// Last fetch failure; kept apart from `data`, which is never blanked by it.
    pub error: Option<ApiError>,
    pub fetched_at: Option<Instant>,
}

impl<V> QuerySnapshot<V> {
    fn empty() -> Self {
        Self {
            data: None,
            is_loading: false,
            is_validating: false,
            is_stale: false,
            is_optimistic: false,
            error: None,
            fetched_at: None,
        }
    }
}

struct Entry<V> {
    confirmed: Option<V>,
    pending: Option<V>,
    fetched_at: Option<Instant>,
    invalidated: bool,
    error: Option<ApiError>,
    in_flight: Option<SharedFetch<V>>,
    epoch: u64,
    observers: usize,
}

impl<V> Default for Entry<V> {
    fn default() -> Self {
        Self {
            confirmed: None,
            pending: None,
            fetched_at: None,
            invalidated: false,
            error: None,
            in_flight: None,
            epoch: 0,
            observers: 0,
        }
    }
}

impl<V: Clone> Entry<V> {
    fn displayed(&self) -> Option<&V> {
        self.pending.as_ref().or(self.confirmed.as_ref())
    }

    fn is_stale(&self, stale_after: Option<Duration>) -> bool {
        if self.displayed().is_none() {
            return false;
        }
        if self.invalidated {
            return true;
        }
        match (stale_after, self.fetched_at) {
            (Some(max_age), Some(fetched_at)) => fetched_at.elapsed() >= max_age,
            (Some(_), None) => true,
            (None, _) => false,
        }
    }

    fn snapshot(&self, stale_after: Option<Duration>) -> QuerySnapshot<V> {
        let data = self.displayed().cloned();
        QuerySnapshot {
            is_loading: data.is_none() && self.in_flight.is_some(),
            is_validating: self.in_flight.is_some(),
            is_stale: self.is_stale(stale_after),
            is_optimistic: self.pending.is_some(),
            error: self.error.clone(),
            fetched_at: self.fetched_at,
            data,
        }
    }
}

struct Inner<K, V> {
    entries: Mutex<HashMap<K, Entry<V>>>,
    fetch: Box<FetchFn<K, V>>,
    config: CacheConfig,
}

impl<K: Eq + Hash, V> Inner<K, V> {
    fn complete(&self, key: &K, epoch: u64, result: &Result<V, ApiError>)
    where
        V: Clone,
    {
        let mut entries = self.entries.lock();
        let Some(entry) = entries.get_mut(key) else {
            return;
        };
        if entry.epoch != epoch {
            debug!("discarding result of a cancelled fetch");
            return;
        }
        entry.in_flight = None;
        match result {
            Ok(value) => {
                entry.confirmed = Some(value.clone());
                entry.pending = None;
                entry.fetched_at = Some(Instant::now());
                entry.invalidated = false;
                entry.error = None;
            }
            Err(err) => {
                warn!(error = %err, "fetch failed; keeping previous data");
                entry.error = Some(err.clone());
            }
        }
    }
}

/// Shared handle to a process-wide query cache. Clones address the same store.
pub struct QueryCache<K, V> {
    inner: Arc<Inner<K, V>>,
}

impl<K, V> Clone for QueryCache<K, V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K, V> fmt::Debug for QueryCache<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryCache")
            .field("entries", &self.inner.entries.lock().len())
            .field("config", &self.inner.config)
            .finish()
    }
}

impl<K, V> QueryCache<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub fn new<F>(config: CacheConfig, fetch: F) -> Self
    where
        F: Fn(K) -> FetchFuture<V> + Send + Sync + 'static,
    {
        Self {
            inner: Arc::new(Inner {
                entries: Mutex::new(HashMap::new()),
                fetch: Box::new(fetch),
                config,
            }),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.inner.config
    }

    /// Reads the entry without triggering any fetch.
    pub fn snapshot(&self, key: &K) -> QuerySnapshot<V> {
        let entries = self.inner.entries.lock();
        entries
            .get(key)
            .map(|entry| entry.snapshot(self.inner.config.stale_after))
            .unwrap_or_else(QuerySnapshot::empty)
    }

    /// Serves `key`. Without data this waits for the (shared) fetch; with
    /// data it answers immediately and revalidates in the background when
    /// the entry is stale.
    pub async fn get(&self, key: &K) -> QuerySnapshot<V> {
        let (has_data, stale) = {
            let entries = self.inner.entries.lock();
            match entries.get(key) {
                Some(entry) => (
                    entry.displayed().is_some(),
                    entry.is_stale(self.inner.config.stale_after),
                ),
                None => (false, false),
            }
        };

        if !has_data {
            let _ = self.start_fetch(key).await;
        } else if stale {
            debug!("serving stale entry while revalidating");
            let _ = self.start_fetch(key);
        }
        self.snapshot(key)
    }

    /// Forces a fetch (joining one already in flight) and waits for it.
    pub async fn refetch(&self, key: &K) -> Result<V, ApiError> {
        self.start_fetch(key).await
    }

    /// Marks `key` stale so the next `get` revalidates. Returns false if the key is unknown.
    pub fn invalidate(&self, key: &K) -> bool {
        let mut entries = self.inner.entries.lock();
        match entries.get_mut(key) {
            Some(entry) => {
                entry.invalidated = true;
                true
            }
            None => false,
        }
    }

    pub fn invalidate_all(&self) -> usize {
        let mut entries = self.inner.entries.lock();
        for entry in entries.values_mut() {
            entry.invalidated = true;
        }
        entries.len()
    }

    /// Optimistically overwrites the displayed value of `key` without a fetch.
    ///
    /// Returns `None` when the key has no data to update.
    pub fn mutate<R>(&self, key: &K, update: impl FnOnce(&mut V) -> R) -> Option<R> {
        let mut entries = self.inner.entries.lock();
        let entry = entries.get_mut(key)?;
        let mut value = entry.displayed()?.clone();
        let out = update(&mut value);
        entry.pending = Some(value);
        Some(out)
    }

    /// Revalidates every observed entry with data when `trigger` is enabled.
    pub fn revalidate_on(&self, trigger: RevalidateTrigger) -> usize {
        let enabled = match trigger {
            RevalidateTrigger::Focus => self.inner.config.revalidate_on_focus,
            RevalidateTrigger::Reconnect => self.inner.config.revalidate_on_reconnect,
        };
        if !enabled {
            return 0;
        }

        let keys = {
            let mut entries = self.inner.entries.lock();
            entries
                .iter_mut()
                .filter(|(_, entry)| entry.observers > 0 && entry.displayed().is_some())
                .map(|(key, entry)| {
                    entry.invalidated = true;
                    key.clone()
                })
                .collect::<Vec<_>>()
        };
        debug!(?trigger, count = keys.len(), "revalidating observed entries");
        for key in &keys {
            let _ = self.start_fetch(key);
        }
        keys.len()
    }

    /// Registers a view interested in `key`. When the last observer of a key
    /// is dropped, an outstanding fetch for it is cancelled.
    pub fn observe(&self, key: &K) -> QueryObserver<K, V> {
        let mut entries = self.inner.entries.lock();
        entries.entry(key.clone()).or_default().observers += 1;
        QueryObserver {
            cache: self.clone(),
            key: key.clone(),
        }
    }

    /// Drops interest in the outstanding fetch for `key`; its result will not be applied.
    pub fn cancel(&self, key: &K) -> bool {
        let mut entries = self.inner.entries.lock();
        let Some(entry) = entries.get_mut(key) else {
            return false;
        };
        if entry.in_flight.take().is_some() {
            entry.epoch += 1;
            true
        } else {
            false
        }
    }

    fn start_fetch(&self, key: &K) -> SharedFetch<V> {
        let mut entries = self.inner.entries.lock();
        let entry = entries.entry(key.clone()).or_default();
        if let Some(in_flight) = &entry.in_flight {
            return in_flight.clone();
        }

        let epoch = entry.epoch;
        let request = (self.inner.fetch)(key.clone());
        let weak: Weak<Inner<K, V>> = Arc::downgrade(&self.inner);
        let owned_key = key.clone();
        let shared = async move {
            let result = request.await;
            if let Some(inner) = weak.upgrade() {
                inner.complete(&owned_key, epoch, &result);
            }
            result
        }
        .boxed()
        .shared();

        entry.in_flight = Some(shared.clone());
        drop(entries);

        tokio::spawn(shared.clone());
        shared
    }
}

/// Guard for a mounted view of one key. See [`QueryCache::observe`].
pub struct QueryObserver<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    cache: QueryCache<K, V>,
    key: K,
}

impl<K, V> QueryObserver<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub fn key(&self) -> &K {
        &self.key
    }
}

impl<K, V> Drop for QueryObserver<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn drop(&mut self) {
        let last = {
            let mut entries = self.cache.inner.entries.lock();
            match entries.get_mut(&self.key) {
                Some(entry) => {
                    entry.observers = entry.observers.saturating_sub(1);
                    entry.observers == 0
                }
                None => false,
            }
        };
        if last && self.cache.cancel(&self.key) {
            debug!("last observer dropped; cancelled outstanding fetch");
        }
    }
}
