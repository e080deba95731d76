//! Cache Store Module
//!
//! Main cache engine combining the ordered map with the pending-fetch
//! registry: LRU eviction in prune batches, hit/miss accounting, fetch
//! coalescing, and writer precedence over in-flight fetches.

use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::cache::{CacheStats, FetchRequest, Fetcher, OrderedMap};
use crate::config::CacheConfig;
use crate::error::ConfigError;
use crate::tasks::spawn_fetch_workers;

// == Cache State ==
/// Everything guarded by the cache-wide mutex: the ordered map, the
/// pending-fetch registry, the stats, and the sizing parameters.
///
/// A key is never in both the map and the registry: `set` removes a
/// pending request before inserting, and a completing worker removes
/// the request before inserting.
pub(crate) struct CacheState<K, V> {
    map: OrderedMap<K, V>,
    pending: HashMap<K, Arc<FetchRequest<V>>>,
    stats: CacheStats,
    capacity: usize,
    prune_size: usize,
}

impl<K, V> CacheState<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    fn new(capacity: usize, prune_size: usize) -> Self {
        Self {
            // One spare node so the insert that follows a prune always
            // finds a free slot.
            map: OrderedMap::with_capacity(capacity + 1),
            pending: HashMap::new(),
            stats: CacheStats::new(),
            capacity,
            prune_size,
        }
    }

    /// Pops up to `count` entries from the head, stopping early when
    /// the map runs empty.
    fn prune(&mut self, count: usize) {
        for _ in 0..count {
            if self.map.pop_head().is_none() {
                break;
            }
            self.stats.record_eviction();
        }
    }

    fn store(&mut self, key: K, value: V) {
        let inserted = self.map.set(key, value);
        debug_assert!(inserted.is_ok(), "node pool exhausted after prune");
    }

    /// Reseats every entry into a larger pool, oldest first, so the
    /// recency order survives the move.
    fn grow(&mut self, capacity: usize) {
        let mut grown = OrderedMap::with_capacity(capacity + 1);
        while let Some((key, value)) = self.map.pop_head() {
            let reseated = grown.set(key, value);
            debug_assert!(reseated.is_ok(), "grown pool smaller than contents");
        }
        self.map = grown;
    }

    /// True while a fetch for the key is outstanding.
    pub(crate) fn is_pending(&self, key: &K) -> bool {
        self.pending.contains_key(key)
    }

    /// Claims the pending request for completion, if it still exists.
    pub(crate) fn take_pending(&mut self, key: &K) -> Option<Arc<FetchRequest<V>>> {
        self.pending.remove(key)
    }

    /// Inserts a successfully fetched value, pruning first when full.
    pub(crate) fn admit(&mut self, key: K, value: V) {
        if self.map.len() >= self.capacity {
            let batch = self.prune_size;
            self.prune(batch);
        }
        self.store(key, value);
    }
}

/// How a miss participates in the fetch for its key.
enum Miss<V> {
    /// Joined a fetch another caller already started
    Joined(Arc<FetchRequest<V>>),
    /// First caller for this key; responsible for enqueueing it
    Owner(Arc<FetchRequest<V>>),
}

// == LRU Cache ==
/// Concurrency-safe LRU cache with request coalescing and an optional
/// fetch worker pool.
///
/// The handle is cheap to clone; all clones share the same cache.
/// Reads hit the bounded in-memory table; misses on a fetching cache
/// enqueue the key for the worker pool and wait for the result, with
/// concurrent misses for one key sharing a single fetch. A `set`
/// racing an in-flight fetch always wins: every waiter observes the
/// written value and the fetch result is discarded.
pub struct LruCache<K, V> {
    state: Arc<Mutex<CacheState<K, V>>>,
    fetcher: Option<Arc<dyn Fetcher<K, V>>>,
    fetch_tx: Arc<Mutex<Option<mpsc::Sender<K>>>>,
    workers: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl<K, V> Clone for LruCache<K, V> {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
            fetcher: self.fetcher.clone(),
            fetch_tx: Arc::clone(&self.fetch_tx),
            workers: Arc::clone(&self.workers),
        }
    }
}

impl<K, V> LruCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    // == Constructor ==
    /// Creates a plain lookup cache without a fetcher.
    ///
    /// Equivalent to the full constructor with no fetcher and no worker
    /// pool.
    pub fn new(capacity: usize, prune_size: usize) -> Result<Self, ConfigError> {
        let config = CacheConfig::new(capacity, prune_size);
        config.validate(false)?;
        Ok(Self {
            state: Arc::new(Mutex::new(CacheState::new(capacity, prune_size))),
            fetcher: None,
            fetch_tx: Arc::new(Mutex::new(None)),
            workers: Arc::new(Mutex::new(Vec::new())),
        })
    }

    // == Get ==
    /// Looks up a key, fetching it on a miss when a fetcher is set.
    ///
    /// A hit refreshes the key's recency. A miss on a fetching cache
    /// joins the in-flight fetch for the key if one exists, otherwise
    /// enqueues the key for the worker pool; either way the call waits
    /// for the outcome without holding the cache mutex. Enqueueing
    /// blocks while the fetch queue is full.
    ///
    /// After [`close`](LruCache::close), misses are returned as `None`
    /// without fetching.
    pub async fn get(&self, key: &K) -> Option<V> {
        let miss = {
            let mut state = self.state.lock();

            if let Some(value) = state.map.get(key).cloned() {
                state.stats.record_hit();
                state.map.move_to_tail(key);
                return Some(value);
            }

            state.stats.record_miss();
            self.fetcher.as_ref()?;

            match state.pending.get(key) {
                Some(request) => Miss::Joined(Arc::clone(request)),
                None => {
                    let request = Arc::new(FetchRequest::new());
                    state.pending.insert(key.clone(), Arc::clone(&request));
                    Miss::Owner(request)
                }
            }
        };

        match miss {
            Miss::Joined(request) => request.wait().await,
            Miss::Owner(request) => {
                self.enqueue(key.clone(), &request).await;
                request.wait().await
            }
        }
    }

    /// Hands a key to the worker pool, blocking while the queue is full.
    ///
    /// If the queue is gone (the cache was closed), the request this
    /// call owns is failed so its waiters are released; a racing `set`
    /// may already have claimed and completed it, in which case there
    /// is nothing to clean up.
    async fn enqueue(&self, key: K, request: &Arc<FetchRequest<V>>) {
        let sender = self.fetch_tx.lock().clone();
        let delivered = match sender {
            Some(tx) => tx.send(key.clone()).await.is_ok(),
            None => false,
        };

        if !delivered {
            let failed = {
                let mut state = self.state.lock();
                let owned = state
                    .pending
                    .get(&key)
                    .is_some_and(|current| Arc::ptr_eq(current, request));
                if owned {
                    state.pending.remove(&key);
                }
                owned
            };
            if failed {
                request.complete(None);
            }
        }
    }

    // == Set ==
    /// Writes a key-value pair, returning true if the cache pruned to
    /// make room.
    ///
    /// A write wins over an in-flight fetch for the same key: every
    /// caller waiting on that fetch wakes with this value, and the
    /// fetch's own result is discarded when it completes.
    pub fn set(&self, key: K, value: V) -> bool {
        let mut state = self.state.lock();

        let in_cache = state.map.get(&key).is_some();
        if in_cache {
            state.map.move_to_tail(&key);
        } else if let Some(request) = state.pending.remove(&key) {
            request.complete(Some(value.clone()));
        }

        let mut pruned = false;
        if !in_cache && state.map.len() >= state.capacity {
            let batch = state.prune_size;
            state.prune(batch);
            pruned = true;
        }

        // Insert after the prune so the value being written is never
        // the one evicted, even with capacity 1.
        state.store(key, value);
        pruned
    }

    // == Peek ==
    /// Returns a value without refreshing recency, touching stats, or
    /// triggering a fetch.
    pub fn peek(&self, key: &K) -> Option<V> {
        self.state.lock().map.get(key).cloned()
    }

    // == Contains ==
    /// Returns true if the key is cached. No side effects.
    pub fn contains(&self, key: &K) -> bool {
        self.state.lock().map.get(key).is_some()
    }

    // == Remove ==
    /// Removes a key from the cache.
    ///
    /// An in-flight fetch for the key is left alone: if it completes
    /// successfully afterwards it will re-insert the key. Use `set` to
    /// override an in-flight fetch, or `close` to stop fetching.
    pub fn remove(&self, key: &K) {
        self.state.lock().map.remove(key);
    }

    // == Remove Oldest ==
    /// Removes the least recently used entry. No-op when empty.
    pub fn remove_oldest(&self) {
        self.state.lock().map.pop_head();
    }

    // == Remove Newest ==
    /// Removes the most recently used entry. No-op when empty.
    pub fn remove_newest(&self) {
        self.state.lock().map.pop_tail();
    }

    // == Length ==
    /// Returns the current number of cached entries.
    pub fn len(&self) -> usize {
        self.state.lock().map.len()
    }

    /// Returns true if the cache holds no entries.
    pub fn is_empty(&self) -> bool {
        self.state.lock().map.is_empty()
    }

    // == Stats ==
    /// Returns a snapshot of the hit/miss/eviction counters.
    pub fn stats(&self) -> CacheStats {
        let state = self.state.lock();
        let mut stats = state.stats.clone();
        stats.set_entries(state.map.len());
        stats
    }

    /// Sets all stat counters back to zero.
    pub fn reset_stats(&self) {
        self.state.lock().stats.reset();
    }

    // == Purge ==
    /// Drops every cached entry, preserving stats and in-flight
    /// fetches. A fetch completing after the purge may re-insert its
    /// key.
    pub fn purge(&self) {
        self.state.lock().map.clear();
    }

    // == Resize ==
    /// Changes the capacity and prune size.
    ///
    /// Shrinking below the current length prunes the oldest entries
    /// down to the new capacity, ignoring the prune size. Growing past
    /// the backing pool reseats every entry, which is the one expensive
    /// operation on this type.
    pub fn resize(&self, capacity: usize, prune_size: usize) -> Result<(), ConfigError> {
        CacheConfig::new(capacity, prune_size).validate(false)?;

        let mut state = self.state.lock();
        if state.map.capacity() < capacity + 1 {
            state.grow(capacity);
        } else if capacity < state.map.len() {
            let excess = state.map.len() - capacity;
            state.prune(excess);
        }
        state.capacity = capacity;
        state.prune_size = prune_size;
        Ok(())
    }

    // == Close ==
    /// Shuts down the fetch worker pool.
    ///
    /// Closes the key queue, waits for the workers to drain it and
    /// exit, then fails any request still pending with `None` so no
    /// waiter blocks forever. Safe to call more than once; a no-op for
    /// a cache without a fetcher.
    pub async fn close(&self) {
        // Dropping the sender closes the queue; workers finish the
        // buffered keys before exiting.
        drop(self.fetch_tx.lock().take());

        let workers = std::mem::take(&mut *self.workers.lock());
        if !workers.is_empty() {
            debug!(workers = workers.len(), "waiting for fetch workers");
        }
        for worker in workers {
            let _ = worker.await;
        }

        let abandoned: Vec<_> = {
            let mut state = self.state.lock();
            state.pending.drain().map(|(_, request)| request).collect()
        };
        if !abandoned.is_empty() {
            debug!(requests = abandoned.len(), "failing requests pending at close");
        }
        for request in abandoned {
            request.complete(None);
        }
    }
}

impl<K, V> LruCache<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    // == Fetching Constructor ==
    /// Creates a cache that back-fills misses through `fetcher`.
    ///
    /// Spawns `config.fetch_workers` worker tasks draining a bounded
    /// queue of `config.fetch_queue_size` keys, so this must be called
    /// from within a tokio runtime. With more than one worker the
    /// fetcher is invoked concurrently and must tolerate it.
    pub fn with_fetcher<F>(config: CacheConfig, fetcher: F) -> Result<Self, ConfigError>
    where
        F: Fetcher<K, V> + 'static,
    {
        config.validate(true)?;

        let fetcher: Arc<dyn Fetcher<K, V>> = Arc::new(fetcher);
        let state = Arc::new(Mutex::new(CacheState::new(
            config.capacity,
            config.prune_size,
        )));
        let (fetch_tx, fetch_rx) = mpsc::channel(config.fetch_queue_size);
        let workers = spawn_fetch_workers(
            Arc::clone(&state),
            Arc::clone(&fetcher),
            fetch_rx,
            config.fetch_workers,
        );

        Ok(Self {
            state,
            fetcher: Some(fetcher),
            fetch_tx: Arc::new(Mutex::new(Some(fetch_tx))),
            workers: Arc::new(Mutex::new(workers)),
        })
    }
}

impl<K, V> fmt::Display for LruCache<K, V>
where
    K: Eq + Hash + Clone,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        write!(
            f,
            "LruCache(capacity: {}, len: {})",
            state.capacity,
            state.map.len()
        )
    }
}

impl<K, V> fmt::Debug for LruCache<K, V>
where
    K: Eq + Hash + Clone,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // try_lock so a Debug print can never deadlock with an operation
        match self.state.try_lock() {
            Some(state) => f
                .debug_struct("LruCache")
                .field("capacity", &state.capacity)
                .field("len", &state.map.len())
                .field("pending", &state.pending.len())
                .finish(),
            None => f.debug_struct("LruCache").finish_non_exhaustive(),
        }
    }
}
