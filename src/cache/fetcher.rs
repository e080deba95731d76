//! Fetcher Trait Module
//!
//! Interface for the caller-supplied lookup used to back-fill cache
//! misses.

use async_trait::async_trait;

/// Source of values for keys missing from the cache.
///
/// Implementations must be safe to call concurrently when the worker
/// pool has more than one worker, and must encode failure as `None`
/// rather than panicking: a `None` outcome is reported to every waiting
/// caller as a miss and is never cached, so later lookups retry.
#[async_trait]
pub trait Fetcher<K, V>: Send + Sync {
    /// Looks up a missing key, returning `None` when it cannot be found.
    async fn fetch(&self, key: &K) -> Option<V>;
}
