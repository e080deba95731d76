//! Integration Tests for Fetching
//!
//! Exercises the full cache against a mock backing store: coalescing of
//! concurrent misses, writer precedence over in-flight fetches, worker
//! pool parallelism, queue backpressure, and shutdown.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use fetching_lru::{CacheConfig, Fetcher, LruCache};
use tokio::time::sleep;

// == Helpers ==

/// Concurrency-safe backing store standing in for a slow origin.
///
/// Maps every key below `size` to itself and counts lookups so tests
/// can assert how often the cache reached out.
struct Storage {
    values: HashMap<u32, u32>,
    delay: Duration,
    lookups: AtomicUsize,
}

impl Storage {
    fn new(size: u32, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            values: (0..size).map(|i| (i, i)).collect(),
            delay,
            lookups: AtomicUsize::new(0),
        })
    }

    fn lookups(&self) -> usize {
        self.lookups.load(Ordering::SeqCst)
    }
}

/// Newtype around `Arc<Storage>` so `Fetcher` can be implemented on it
/// locally (a direct impl on `Arc<Storage>` would violate the orphan
/// rule, since both `Arc` and `Storage`'s type parameters are foreign
/// from this crate's perspective).
#[derive(Clone)]
struct SharedStorage(Arc<Storage>);

impl std::ops::Deref for SharedStorage {
    type Target = Storage;

    fn deref(&self) -> &Storage {
        &self.0
    }
}

#[async_trait]
impl Fetcher<u32, u32> for SharedStorage {
    async fn fetch(&self, key: &u32) -> Option<u32> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        sleep(self.delay).await;
        self.values.get(key).copied()
    }
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

// == Basic Fetching ==

#[tokio::test]
async fn test_fetch_miss_then_hit() {
    init_tracing();
    let storage = Storage::new(1000, Duration::from_millis(50));
    let cache = LruCache::with_fetcher(
        CacheConfig::new(100, 10).fetch_pool(1, 1000),
        SharedStorage(Arc::clone(&storage)),
    )
    .unwrap();

    // The key is not cached, so it is fetched from storage
    assert_eq!(cache.get(&77).await, Some(77));
    assert_eq!(storage.lookups(), 1);
    let stats = cache.stats();
    assert_eq!(stats.hits, 0);
    assert_eq!(stats.misses, 1);

    // The same key is now served from the cache
    assert_eq!(cache.get(&77).await, Some(77));
    assert_eq!(storage.lookups(), 1);
    let stats = cache.stats();
    assert_eq!(stats.hits, 1);
    assert_eq!(stats.misses, 1);

    cache.close().await;
}

#[tokio::test]
async fn test_set_overrides_fetched_value() {
    let storage = Storage::new(1000, Duration::from_millis(10));
    let cache = LruCache::with_fetcher(
        CacheConfig::new(100, 10).fetch_pool(1, 1000),
        SharedStorage(Arc::clone(&storage)),
    )
    .unwrap();

    assert_eq!(cache.get(&77).await, Some(77));

    // Writes beat the backing store without touching it
    cache.set(88, 8888);
    assert_eq!(cache.get(&88).await, Some(8888));

    cache.set(77, 11111);
    assert_eq!(cache.get(&77).await, Some(11111));

    assert_eq!(storage.lookups(), 1);
    cache.close().await;
}

#[tokio::test]
async fn test_unfetchable_keys_are_not_cached() {
    let storage = Storage::new(1000, Duration::from_millis(5));
    let cache = LruCache::with_fetcher(
        CacheConfig::new(100, 10).fetch_pool(1, 1000),
        SharedStorage(Arc::clone(&storage)),
    )
    .unwrap();

    let initial_len = cache.len();
    for round in 0..10 {
        // Key 5000 is beyond the storage range
        assert_eq!(cache.get(&5000).await, None);
        assert_eq!(cache.len(), initial_len);
        // Every miss goes back to storage: failures are never cached
        assert_eq!(storage.lookups(), round + 1);
    }

    cache.close().await;
}

// == Coalescing ==

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_gets_coalesce() {
    init_tracing();
    let storage = Storage::new(1000, Duration::from_millis(100));
    let cache = LruCache::with_fetcher(
        CacheConfig::new(100, 10).fetch_pool(1, 1000),
        SharedStorage(Arc::clone(&storage)),
    )
    .unwrap();

    // Three concurrent misses for the same key share one fetch
    let waiters: Vec<_> = (0..3)
        .map(|_| {
            let cache = cache.clone();
            tokio::spawn(async move { cache.get(&77).await })
        })
        .collect();
    for waiter in waiters {
        assert_eq!(waiter.await.unwrap(), Some(77));
    }
    assert_eq!(storage.lookups(), 1);

    // Distinct keys fetch independently, duplicates still coalesce
    let keys = [40, 50, 40, 50, 60];
    let waiters: Vec<_> = keys
        .iter()
        .map(|&key| {
            let cache = cache.clone();
            tokio::spawn(async move { (key, cache.get(&key).await) })
        })
        .collect();
    for waiter in waiters {
        let (key, value) = waiter.await.unwrap();
        assert_eq!(value, Some(key));
    }
    assert_eq!(storage.lookups(), 4);

    cache.close().await;
}

// == Writer Precedence ==

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_set_preempts_inflight_fetch() {
    let storage = Storage::new(1000, Duration::from_millis(150));
    let cache = LruCache::with_fetcher(
        CacheConfig::new(100, 10).fetch_pool(1, 1000),
        SharedStorage(Arc::clone(&storage)),
    )
    .unwrap();

    let waiter = {
        let cache = cache.clone();
        tokio::spawn(async move { cache.get(&100).await })
    };

    // Let the fetch start, then write the key
    sleep(Duration::from_millis(20)).await;
    cache.set(100, 3000);

    // The waiter wakes with the written value, not the fetched one
    assert_eq!(waiter.await.unwrap(), Some(3000));

    // Even after the fetch finishes, its value stays discarded
    sleep(Duration::from_millis(200)).await;
    assert_eq!(cache.get(&100).await, Some(3000));

    cache.close().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_repeated_fetch_interrupts() {
    let storage = Storage::new(1000, Duration::from_millis(150));
    let cache = LruCache::with_fetcher(
        CacheConfig::new(100, 10).fetch_pool(4, 1000),
        SharedStorage(Arc::clone(&storage)),
    )
    .unwrap();

    for key in 0..5 {
        let waiter = {
            let cache = cache.clone();
            tokio::spawn(async move { cache.get(&key).await })
        };
        sleep(Duration::from_millis(20)).await;
        cache.set(key, 12345);

        assert_eq!(waiter.await.unwrap(), Some(12345));

        // Wait out the fetch, then confirm the write stuck
        sleep(Duration::from_millis(200)).await;
        assert_eq!(cache.get(&key).await, Some(12345));
    }

    cache.close().await;
}

// == Worker Pool ==

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_parallel_fetches_across_workers() {
    let storage = Storage::new(1000, Duration::from_millis(30));
    let cache = LruCache::with_fetcher(
        CacheConfig::new(100, 10).fetch_pool(8, 64),
        SharedStorage(Arc::clone(&storage)),
    )
    .unwrap();

    // Three callers per key across twenty keys
    let waiters: Vec<_> = (0..20)
        .flat_map(|key| {
            (0..3).map(move |_| key).collect::<Vec<_>>()
        })
        .map(|key| {
            let cache = cache.clone();
            tokio::spawn(async move { (key, cache.get(&key).await) })
        })
        .collect();

    for waiter in waiters {
        let (key, value) = waiter.await.unwrap();
        assert_eq!(value, Some(key));
    }

    // One fetch per distinct key despite sixty callers
    assert_eq!(storage.lookups(), 20);
    assert_eq!(cache.len(), 20);

    cache.close().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_full_queue_applies_backpressure() {
    let storage = Storage::new(1000, Duration::from_millis(5));
    let cache = LruCache::with_fetcher(
        CacheConfig::new(100, 10).fetch_pool(2, 1),
        SharedStorage(Arc::clone(&storage)),
    )
    .unwrap();

    // Far more traffic than the one-slot queue can hold at once
    let mut waiters = Vec::new();
    for key in 0..50 {
        let reader = cache.clone();
        waiters.push(tokio::spawn(async move { (key, reader.get(&key).await) }));
        let writer = cache.clone();
        tokio::spawn(async move { writer.set(key + 2000, key + 2000) });
    }

    for waiter in waiters {
        let (key, value) = waiter.await.unwrap();
        assert_eq!(value, Some(key));
    }

    cache.close().await;
}

// == Independence ==

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_caches_share_no_state() {
    let storage = Storage::new(1000, Duration::from_millis(2));
    let cache1 = LruCache::with_fetcher(
        CacheConfig::new(1000, 100).fetch_pool(4, 64),
        SharedStorage(Arc::clone(&storage)),
    )
    .unwrap();
    let cache2 = LruCache::with_fetcher(
        CacheConfig::new(1000, 100).fetch_pool(4, 64),
        SharedStorage(Arc::clone(&storage)),
    )
    .unwrap();

    for key in 0..50 {
        cache1.set(key, key + 1000);
        cache2.set(key, key + 2000);
    }

    for key in 0..50 {
        assert_eq!(cache1.get(&key).await, Some(key + 1000));
        assert_eq!(cache2.get(&key).await, Some(key + 2000));
    }

    // Keys neither cache has written are fetched by each independently
    for key in 500..510 {
        assert_eq!(cache1.get(&key).await, Some(key));
        assert_eq!(cache2.get(&key).await, Some(key));
    }
    assert_eq!(storage.lookups(), 20);

    cache1.close().await;
    cache2.close().await;
}

// == Peek ==

#[tokio::test]
async fn test_peek_never_fetches() {
    let storage = Storage::new(1000, Duration::from_millis(5));
    let cache = LruCache::with_fetcher(
        CacheConfig::new(100, 10).fetch_pool(2, 64),
        SharedStorage(Arc::clone(&storage)),
    )
    .unwrap();

    assert_eq!(cache.peek(&100), None);
    sleep(Duration::from_millis(50)).await;
    assert_eq!(storage.lookups(), 0);

    let stats = cache.stats();
    assert_eq!(stats.hits, 0);
    assert_eq!(stats.misses, 0);

    cache.set(100, 1000);
    assert_eq!(cache.peek(&100), Some(1000));
    assert_eq!(storage.lookups(), 0);

    cache.close().await;
}

// == Shutdown ==

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_close_completes_pending_work() {
    init_tracing();
    let storage = Storage::new(1000, Duration::from_millis(100));
    let cache = LruCache::with_fetcher(
        CacheConfig::new(100, 10).fetch_pool(2, 64),
        SharedStorage(Arc::clone(&storage)),
    )
    .unwrap();

    let waiters: Vec<_> = (0..10)
        .map(|key| {
            let cache = cache.clone();
            tokio::spawn(async move { cache.get(&key).await })
        })
        .collect();

    // Close while fetches are still in flight; workers drain the queue
    sleep(Duration::from_millis(50)).await;
    cache.close().await;

    for (key, waiter) in waiters.into_iter().enumerate() {
        assert_eq!(waiter.await.unwrap(), Some(key as u32));
    }
}

#[tokio::test]
async fn test_get_after_close_is_a_plain_miss() {
    let storage = Storage::new(1000, Duration::from_millis(5));
    let cache = LruCache::with_fetcher(
        CacheConfig::new(100, 10).fetch_pool(2, 64),
        SharedStorage(Arc::clone(&storage)),
    )
    .unwrap();

    assert_eq!(cache.get(&1).await, Some(1));
    cache.close().await;
    // Closing twice is harmless
    cache.close().await;

    let lookups = storage.lookups();
    assert_eq!(cache.get(&2).await, None);
    assert_eq!(storage.lookups(), lookups);

    // Entries cached before the close are still served
    assert_eq!(cache.get(&1).await, Some(1));
}

// == Interactions With Removal ==

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_purge_allows_inflight_fetch_to_land() {
    let storage = Storage::new(1000, Duration::from_millis(100));
    let cache = LruCache::with_fetcher(
        CacheConfig::new(100, 10).fetch_pool(1, 64),
        SharedStorage(Arc::clone(&storage)),
    )
    .unwrap();

    cache.set(1, 1);

    let waiter = {
        let cache = cache.clone();
        tokio::spawn(async move { cache.get(&5).await })
    };

    sleep(Duration::from_millis(20)).await;
    cache.purge();
    assert_eq!(cache.len(), 0);

    // The purge does not cancel the fetch: it completes and lands
    assert_eq!(waiter.await.unwrap(), Some(5));
    assert!(cache.contains(&5));
    assert!(!cache.contains(&1));

    cache.close().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_remove_does_not_cancel_inflight_fetch() {
    let storage = Storage::new(1000, Duration::from_millis(100));
    let cache = LruCache::with_fetcher(
        CacheConfig::new(100, 10).fetch_pool(1, 64),
        SharedStorage(Arc::clone(&storage)),
    )
    .unwrap();

    let waiter = {
        let cache = cache.clone();
        tokio::spawn(async move { cache.get(&7).await })
    };

    sleep(Duration::from_millis(20)).await;
    cache.remove(&7);

    // The fetch still completes and re-inserts the key
    assert_eq!(waiter.await.unwrap(), Some(7));
    assert!(cache.contains(&7));

    cache.close().await;
}
