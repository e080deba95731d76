//! Fetch Worker Pool
//!
//! Background tasks that drain the key queue, run the caller-supplied
//! fetcher, and publish results into the cache.

use std::hash::Hash;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::cache::{CacheState, Fetcher};

/// Spawns `count` worker tasks over one shared key queue.
///
/// Workers exit when the queue is closed and fully drained; the
/// returned handles are awaited on shutdown.
pub(crate) fn spawn_fetch_workers<K, V>(
    state: Arc<Mutex<CacheState<K, V>>>,
    fetcher: Arc<dyn Fetcher<K, V>>,
    queue: mpsc::Receiver<K>,
    count: usize,
) -> Vec<JoinHandle<()>>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    debug!(workers = count, "starting fetch worker pool");

    let queue = Arc::new(tokio::sync::Mutex::new(queue));
    (0..count)
        .map(|worker| {
            let state = Arc::clone(&state);
            let fetcher = Arc::clone(&fetcher);
            let queue = Arc::clone(&queue);
            tokio::spawn(fetch_worker(worker, state, fetcher, queue))
        })
        .collect()
}

/// One worker: receive a key, fetch it, publish the outcome.
///
/// The pending registry is consulted twice: before the fetch, so a key
/// already preempted by a write is skipped without invoking the
/// fetcher, and after, so a write that landed mid-fetch wins and the
/// fetched value is dropped. Exactly one of this worker and a racing
/// write completes any given request.
async fn fetch_worker<K, V>(
    worker: usize,
    state: Arc<Mutex<CacheState<K, V>>>,
    fetcher: Arc<dyn Fetcher<K, V>>,
    queue: Arc<tokio::sync::Mutex<mpsc::Receiver<K>>>,
) where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    loop {
        // Holding the queue lock only serializes dequeues; fetches run
        // concurrently across workers.
        let key = queue.lock().await.recv().await;
        let Some(key) = key else {
            break;
        };

        if !state.lock().is_pending(&key) {
            continue;
        }

        // The fetcher runs without any lock held, in its own task so a
        // panicking fetcher becomes a failed lookup instead of leaving
        // waiters stuck on an orphaned request.
        let fetch = {
            let fetcher = Arc::clone(&fetcher);
            let key = key.clone();
            tokio::spawn(async move { fetcher.fetch(&key).await })
        };
        let fetched = match fetch.await {
            Ok(outcome) => outcome,
            Err(_) => {
                warn!(worker, "fetcher panicked, treating as failed lookup");
                None
            }
        };

        let mut state = state.lock();
        let Some(request) = state.take_pending(&key) else {
            continue;
        };
        request.complete(fetched.clone());
        if let Some(value) = fetched {
            state.admit(key, value);
        }
    }

    trace!(worker, "fetch worker exiting");
}
