//! Keyed cache of remote read results.
//!
//! Entries are created by the first read of a key and fetched in a tokio
//! task. Concurrent reads of a pending key share one in-flight request.
//! Every fetch is stamped with a cache-wide generation; a result is applied
//! only if its generation is still the latest requested for that key, so a
//! fetch superseded by an invalidation-triggered refetch can never overwrite
//! newer data. Unsubscribed entries are kept in an LRU and dropped once it
//! overflows.

pub mod key;

use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::marker::PhantomData;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::future::{BoxFuture, FutureExt, Shared};
use lru::LruCache;
use tracing::{debug, trace, warn};

use crate::config::CacheConfig;
use crate::error::ServiceError;

pub use key::{QueryKey, QueryOp};

type Erased = Arc<dyn Any + Send + Sync>;
type ErasedFetcher = Arc<dyn Fn() -> BoxFuture<'static, anyhow::Result<Erased>> + Send + Sync>;
type InFlight = Shared<BoxFuture<'static, ()>>;
type Listener = Arc<dyn Fn(QueryStatus) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryStatus {
    Pending,
    Resolved,
    Errored,
}

/// Per-read freshness and failure policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReadOptions {
    /// Refetch a resolved entry on read once it is this old.
    pub stale_after: Option<Duration>,
    /// Automatic retries after a transport failure.
    pub retries: u32,
}

impl ReadOptions {
    pub fn from_config(config: &CacheConfig) -> Self {
        Self {
            stale_after: config.stale_after(),
            retries: config.retries,
        }
    }

    pub fn no_retry(mut self) -> Self {
        self.retries = 0;
        self
    }
}

/// A cacheable read: key, options and a reusable fetcher.
pub struct Query<T> {
    key: QueryKey,
    options: ReadOptions,
    fetcher: ErasedFetcher,
    _output: PhantomData<fn() -> T>,
}

impl<T: Send + Sync + 'static> Query<T> {
    pub fn new<F, Fut>(key: QueryKey, options: ReadOptions, fetch: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        let fetcher: ErasedFetcher = Arc::new(move || {
            let fut = fetch();
            async move { fut.await.map(|value| Arc::new(value) as Erased) }.boxed()
        });
        Self {
            key,
            options,
            fetcher,
            _output: PhantomData,
        }
    }
}

impl<T> Query<T> {
    pub fn key(&self) -> &QueryKey {
        &self.key
    }

    pub fn options(&self) -> ReadOptions {
        self.options
    }

    pub fn with_options(mut self, options: ReadOptions) -> Self {
        self.options = options;
        self
    }
}

impl<T> Clone for Query<T> {
    fn clone(&self) -> Self {
        Self {
            key: self.key.clone(),
            options: self.options,
            fetcher: self.fetcher.clone(),
            _output: PhantomData,
        }
    }
}

/// Snapshot of one cache entry.
///
/// `value` keeps the last resolved data while a refetch is pending or after
/// a refetch failed.
#[derive(Debug)]
pub struct QueryEntry<T> {
    pub key: QueryKey,
    pub status: QueryStatus,
    pub value: Option<Arc<T>>,
    pub error: Option<ServiceError>,
    pub last_resolved_at: Option<DateTime<Utc>>,
    pub is_stale: bool,
}

impl<T> Clone for QueryEntry<T> {
    fn clone(&self) -> Self {
        Self {
            key: self.key.clone(),
            status: self.status,
            value: self.value.clone(),
            error: self.error.clone(),
            last_resolved_at: self.last_resolved_at,
            is_stale: self.is_stale,
        }
    }
}

impl<T> QueryEntry<T> {
    fn missing(key: QueryKey) -> Self {
        Self {
            key,
            status: QueryStatus::Pending,
            value: None,
            error: None,
            last_resolved_at: None,
            is_stale: true,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.status == QueryStatus::Pending
    }

    pub fn is_resolved(&self) -> bool {
        self.status == QueryStatus::Resolved
    }

    pub fn is_errored(&self) -> bool {
        self.status == QueryStatus::Errored
    }

    /// The resolved value, only when the entry is currently resolved.
    pub fn data(&self) -> Option<&T> {
        if self.is_resolved() {
            self.value.as_deref()
        } else {
            None
        }
    }
}

struct Slot {
    status: QueryStatus,
    value: Option<Erased>,
    error: Option<ServiceError>,
    last_resolved_at: Option<DateTime<Utc>>,
    stale: bool,
    generation: u64,
    in_flight: Option<InFlight>,
    /// `resolve` calls waiting on this entry; it is not evicted while set.
    waiters: usize,
    fetcher: ErasedFetcher,
    options: ReadOptions,
}

impl Slot {
    fn new(fetcher: ErasedFetcher, options: ReadOptions) -> Self {
        Self {
            status: QueryStatus::Pending,
            value: None,
            error: None,
            last_resolved_at: None,
            stale: true,
            generation: 0,
            in_flight: None,
            waiters: 0,
            fetcher,
            options,
        }
    }

    fn is_stale(&self, now: DateTime<Utc>) -> bool {
        if self.stale {
            return true;
        }
        match (self.status, self.options.stale_after, self.last_resolved_at) {
            (QueryStatus::Resolved, Some(max_age), Some(at)) => {
                let age = now.signed_duration_since(at).to_std().unwrap_or(Duration::ZERO);
                age >= max_age
            }
            _ => false,
        }
    }

    fn snapshot<T: Send + Sync + 'static>(&self, key: &QueryKey) -> QueryEntry<T> {
        let value = self.value.clone().and_then(|v| match v.downcast::<T>() {
            Ok(v) => Some(v),
            Err(_) => {
                warn!(key = %key, "cached value has a different type than requested");
                None
            }
        });
        QueryEntry {
            key: key.clone(),
            status: self.status,
            value,
            error: self.error.clone(),
            last_resolved_at: self.last_resolved_at,
            is_stale: self.is_stale(Utc::now()),
        }
    }
}

struct Notification {
    listeners: Vec<Listener>,
    status: QueryStatus,
}

impl Notification {
    fn deliver(self) {
        for listener in self.listeners {
            listener(self.status);
        }
    }
}

struct CacheState {
    slots: HashMap<QueryKey, Slot>,
    listeners: HashMap<QueryKey, HashMap<u64, Listener>>,
    idle: LruCache<QueryKey, ()>,
    next_generation: u64,
    next_listener: u64,
}

impl CacheState {
    fn notification(&self, key: &QueryKey, status: QueryStatus) -> Option<Notification> {
        let listeners = self.listeners.get(key)?;
        Some(Notification {
            listeners: listeners.values().cloned().collect(),
            status,
        })
    }

    fn has_listeners(&self, key: &QueryKey) -> bool {
        self.listeners.get(key).is_some_and(|l| !l.is_empty())
    }

    /// Track an unsubscribed entry, dropping the least recently used settled
    /// entry if the idle set overflows.
    ///
    /// An overflowed entry that is still fetching or awaited stays in the map
    /// untracked; it is tracked again when it settles or its last waiter
    /// leaves.
    fn mark_idle(&mut self, key: &QueryKey) {
        if let Some((evicted, ())) = self.idle.push(key.clone(), ()) {
            if &evicted == key {
                return;
            }
            let settled = self
                .slots
                .get(&evicted)
                .is_some_and(|slot| slot.in_flight.is_none() && slot.waiters == 0);
            if settled {
                self.slots.remove(&evicted);
                trace!(key = %evicted, "evicted idle entry");
            }
        }
    }

    fn release_waiter(&mut self, key: &QueryKey) {
        let Some(slot) = self.slots.get_mut(key) else {
            return;
        };
        slot.waiters = slot.waiters.saturating_sub(1);
        let untracked = slot.waiters == 0 && !self.idle.contains(key);
        if untracked && !self.has_listeners(key) {
            self.mark_idle(key);
        }
    }
}

/// Holds an entry in place while `resolve` waits on it.
struct Waiter<'a> {
    cache: &'a QueryCache,
    key: &'a QueryKey,
}

impl Drop for Waiter<'_> {
    fn drop(&mut self) {
        self.cache.lock().release_waiter(self.key);
    }
}

struct Inner {
    state: Mutex<CacheState>,
}

/// Shared handle to the query cache; clones refer to the same entries.
#[derive(Clone)]
pub struct QueryCache {
    inner: Arc<Inner>,
}

impl QueryCache {
    pub fn new(config: &CacheConfig) -> Self {
        let capacity = NonZeroUsize::new(config.max_idle_entries).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(CacheState {
                    slots: HashMap::new(),
                    listeners: HashMap::new(),
                    idle: LruCache::new(capacity),
                    next_generation: 1,
                    next_listener: 1,
                }),
            }),
        }
    }

    // A panicking listener runs outside the lock, so a poisoned state is
    // still consistent.
    fn lock(&self) -> MutexGuard<'_, CacheState> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Current entry for the query's key, fetching it if absent or stale.
    ///
    /// Must be called inside a tokio runtime. A pending key is never fetched
    /// twice: the caller joins the request already in flight.
    pub fn read<T: Send + Sync + 'static>(&self, query: &Query<T>) -> QueryEntry<T> {
        self.read_with(query, false)
    }

    fn read_with<T: Send + Sync + 'static>(&self, query: &Query<T>, wait: bool) -> QueryEntry<T> {
        let (entry, notification) = {
            let mut state = self.lock();
            let key = &query.key;

            if !state.slots.contains_key(key) {
                state
                    .slots
                    .insert(key.clone(), Slot::new(query.fetcher.clone(), query.options));
                if !state.has_listeners(key) {
                    state.mark_idle(key);
                }
            } else {
                state.idle.promote(key);
            }
            if wait {
                if let Some(slot) = state.slots.get_mut(key) {
                    slot.waiters += 1;
                }
            }

            // An entry invalidated while its fetch was in flight may be
            // about to receive pre-write data, so it is fetched again.
            let needs_fetch = state.slots.get(key).is_some_and(|slot| {
                slot.is_stale(Utc::now()) && (slot.in_flight.is_none() || slot.stale)
            });
            let notification = if needs_fetch {
                self.start_fetch(&mut state, key)
            } else {
                None
            };

            let entry = match state.slots.get(key) {
                Some(slot) => slot.snapshot(key),
                None => QueryEntry::missing(key.clone()),
            };
            (entry, notification)
        };

        if let Some(notification) = notification {
            notification.deliver();
        }
        entry
    }

    /// Read, then wait until the latest generation for the key has settled.
    ///
    /// The entry cannot be evicted while this waits, so the result is only
    /// pending if the cache was cleared in the meantime.
    pub async fn resolve<T: Send + Sync + 'static>(&self, query: &Query<T>) -> QueryEntry<T> {
        self.read_with(query, true);
        let _waiter = Waiter {
            cache: self,
            key: &query.key,
        };
        loop {
            let fetch = {
                let state = self.lock();
                let Some(slot) = state.slots.get(&query.key) else {
                    return QueryEntry::missing(query.key.clone());
                };
                match &slot.in_flight {
                    Some(fetch) => fetch.clone(),
                    None => return slot.snapshot(&query.key),
                }
            };
            fetch.await;
        }
    }

    /// Manually retry: fetch again even if the entry is fresh or errored.
    pub fn refetch<T: Send + Sync + 'static>(&self, query: &Query<T>) -> QueryEntry<T> {
        {
            let mut state = self.lock();
            if let Some(slot) = state.slots.get_mut(&query.key) {
                slot.stale = true;
            }
        }
        self.read(query)
    }

    /// Entry for `key` without triggering a fetch.
    pub fn peek<T: Send + Sync + 'static>(&self, key: &QueryKey) -> Option<QueryEntry<T>> {
        let state = self.lock();
        state.slots.get(key).map(|slot| slot.snapshot(key))
    }

    /// Whether the entry for `key` would be refetched by its next read.
    pub fn is_stale(&self, key: &QueryKey) -> Option<bool> {
        let state = self.lock();
        state.slots.get(key).map(|slot| slot.is_stale(Utc::now()))
    }

    /// Register `listener` for every status transition of `key`.
    pub fn subscribe<F>(&self, key: &QueryKey, listener: F) -> Subscription
    where
        F: Fn(QueryStatus) + Send + Sync + 'static,
    {
        let mut state = self.lock();
        let id = state.next_listener;
        state.next_listener += 1;
        state
            .listeners
            .entry(key.clone())
            .or_default()
            .insert(id, Arc::new(listener));
        state.idle.pop(key);

        Subscription {
            cache: Arc::downgrade(&self.inner),
            key: key.clone(),
            id,
            active: AtomicBool::new(true),
        }
    }

    fn unsubscribe(&self, key: &QueryKey, id: u64) {
        let mut state = self.lock();
        let now_idle = match state.listeners.get_mut(key) {
            Some(listeners) => {
                listeners.remove(&id);
                listeners.is_empty()
            }
            None => return,
        };
        if now_idle {
            state.listeners.remove(key);
            if state.slots.contains_key(key) {
                state.mark_idle(key);
            }
        }
    }

    /// Mark every entry under `prefix` stale.
    ///
    /// Subscribed entries are refetched now, superseding any fetch already in
    /// flight; the rest are refetched on their next read. Returns the number
    /// of entries marked.
    pub(crate) fn invalidate(&self, prefix: &QueryKey) -> usize {
        let (count, notifications) = {
            let mut state = self.lock();
            let keys: Vec<QueryKey> = state
                .slots
                .keys()
                .filter(|key| key.starts_with(prefix))
                .cloned()
                .collect();

            let mut notifications = Vec::new();
            for key in &keys {
                if let Some(slot) = state.slots.get_mut(key) {
                    slot.stale = true;
                }
                if state.has_listeners(key) {
                    notifications.extend(self.start_fetch(&mut state, key));
                }
            }
            debug!(prefix = %prefix, entries = keys.len(), "invalidated");
            (keys.len(), notifications)
        };

        for notification in notifications {
            notification.deliver();
        }
        count
    }

    /// Drop every entry and listener. Fetches still in flight settle into
    /// nothing.
    pub fn clear(&self) {
        let mut state = self.lock();
        let dropped = state.slots.len();
        state.slots.clear();
        state.listeners.clear();
        state.idle.clear();
        debug!(entries = dropped, "query cache cleared");
    }

    pub fn len(&self) -> usize {
        self.lock().slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn start_fetch(&self, state: &mut CacheState, key: &QueryKey) -> Option<Notification> {
        let generation = state.next_generation;
        state.next_generation += 1;

        let slot = state.slots.get_mut(key)?;
        let superseding = slot.in_flight.is_some();
        slot.generation = generation;
        slot.status = QueryStatus::Pending;
        slot.stale = false;

        let fetcher = slot.fetcher.clone();
        let retries = slot.options.retries;
        let cache = Arc::downgrade(&self.inner);
        let fetch_key = key.clone();
        let fetch = async move {
            let result = run_fetch(&fetcher, retries, &fetch_key).await;
            if let Some(inner) = cache.upgrade() {
                QueryCache { inner }.settle(&fetch_key, generation, result);
            }
        }
        .boxed()
        .shared();

        slot.in_flight = Some(fetch.clone());
        tokio::spawn(fetch);
        trace!(key = %key, generation, "fetch started");

        if superseding {
            None
        } else {
            state.notification(key, QueryStatus::Pending)
        }
    }

    fn settle(&self, key: &QueryKey, generation: u64, result: Result<Erased, ServiceError>) {
        let notification = {
            let mut state = self.lock();
            let Some(slot) = state.slots.get_mut(key) else {
                trace!(key = %key, generation, "fetch settled for a dropped entry");
                return;
            };
            if slot.generation != generation {
                debug!(key = %key, generation, latest = slot.generation, "discarding superseded fetch");
                return;
            }

            slot.in_flight = None;
            let status = match result {
                Ok(value) => {
                    slot.value = Some(value);
                    slot.error = None;
                    slot.last_resolved_at = Some(Utc::now());
                    QueryStatus::Resolved
                }
                Err(e) => {
                    debug!(key = %key, error = %e, "fetch failed");
                    slot.error = Some(e);
                    QueryStatus::Errored
                }
            };
            slot.status = status;

            if !state.has_listeners(key) {
                state.mark_idle(key);
            }
            state.notification(key, status)
        };

        if let Some(notification) = notification {
            notification.deliver();
        }
    }
}

async fn run_fetch(
    fetcher: &ErasedFetcher,
    retries: u32,
    key: &QueryKey,
) -> Result<Erased, ServiceError> {
    let mut attempt = 0;
    loop {
        match fetcher().await {
            Ok(value) => return Ok(value),
            Err(e) => {
                let err = ServiceError::from_remote(&e);
                if err.is_validation() || attempt >= retries {
                    return Err(err);
                }
                attempt += 1;
                debug!(key = %key, attempt, error = %err, "retrying fetch");
            }
        }
    }
}

/// Listener registration; cancelled explicitly or on drop.
pub struct Subscription {
    cache: Weak<Inner>,
    key: QueryKey,
    id: u64,
    active: AtomicBool,
}

impl Subscription {
    pub fn key(&self) -> &QueryKey {
        &self.key
    }

    /// Stop receiving notifications. Safe to call repeatedly, and after the
    /// entry or the whole cache is gone.
    pub fn cancel(&self) {
        if !self.active.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(inner) = self.cache.upgrade() {
            QueryCache { inner }.unsubscribe(&self.key, self.id);
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel();
    }
}
