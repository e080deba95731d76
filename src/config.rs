//! Configuration Module
//!
//! Sizing parameters for the cache and its optional fetch worker pool.

use crate::error::ConfigError;

/// Cache sizing parameters.
///
/// The fetch pool fields are only consulted when a fetcher is supplied;
/// a plain lookup cache ignores them.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Maximum number of entries the cache can hold
    pub capacity: usize,
    /// Number of oldest entries removed in one batch when the cache is full
    pub prune_size: usize,
    /// Number of worker tasks draining the fetch queue
    pub fetch_workers: usize,
    /// Capacity of the bounded fetch key queue
    pub fetch_queue_size: usize,
}

impl CacheConfig {
    /// Creates a config with the given capacity and prune size, keeping
    /// the default fetch pool sizing.
    pub fn new(capacity: usize, prune_size: usize) -> Self {
        Self {
            capacity,
            prune_size,
            ..Self::default()
        }
    }

    /// Overrides the fetch pool sizing.
    ///
    /// Queue size should be chosen based on the worker count and the
    /// expected number of concurrent misses; senders block while it is
    /// full.
    pub fn fetch_pool(mut self, workers: usize, queue_size: usize) -> Self {
        self.fetch_workers = workers;
        self.fetch_queue_size = queue_size;
        self
    }

    /// Validates the parameters.
    ///
    /// The fetch pool fields are only checked when `fetching` is true.
    pub fn validate(&self, fetching: bool) -> Result<(), ConfigError> {
        if self.capacity == 0 {
            return Err(ConfigError::ZeroCapacity);
        }
        // The node pool is sized capacity + 1
        if self.capacity == usize::MAX {
            return Err(ConfigError::CapacityOverflow);
        }
        if self.prune_size == 0 {
            return Err(ConfigError::ZeroPruneSize);
        }
        if fetching {
            if self.fetch_workers == 0 {
                return Err(ConfigError::ZeroFetchWorkers);
            }
            if self.fetch_queue_size == 0 {
                return Err(ConfigError::ZeroFetchQueue);
            }
        }
        Ok(())
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: 1000,
            prune_size: 1,
            fetch_workers: 4,
            fetch_queue_size: 256,
        }
    }
}
