//! Fetch Request Module
//!
//! Rendezvous object shared by every caller waiting on the same
//! in-flight fetch: completed exactly once, observed by any number of
//! waiters.

use parking_lot::Mutex;
use tokio::sync::watch;

// == Fetch Request ==
/// One-shot broadcast completion for a single key being fetched.
///
/// The outcome is written before the completion flag flips, and watch
/// receivers always observe the current flag value on subscribe, so a
/// waiter arriving after completion returns immediately and a waiter
/// arriving before never misses the wakeup.
#[derive(Debug)]
pub(crate) struct FetchRequest<V> {
    done: watch::Sender<bool>,
    outcome: Mutex<Option<V>>,
}

impl<V: Clone> FetchRequest<V> {
    pub(crate) fn new() -> Self {
        let (done, _) = watch::channel(false);
        Self {
            done,
            outcome: Mutex::new(None),
        }
    }

    /// Publishes the outcome and wakes every waiter.
    ///
    /// Must be called at most once per request; the caller guarantees
    /// this by removing the request from the pending registry under the
    /// cache mutex before completing it.
    pub(crate) fn complete(&self, outcome: Option<V>) {
        debug_assert!(!*self.done.borrow(), "fetch request completed twice");
        *self.outcome.lock() = outcome;
        self.done.send_replace(true);
    }

    /// Waits for completion and returns the outcome.
    pub(crate) async fn wait(&self) -> Option<V> {
        let mut done = self.done.subscribe();
        // The sender is owned by this request, so the channel cannot
        // close before completion.
        let _ = done.wait_for(|ready| *ready).await;
        self.outcome.lock().clone()
    }
}
