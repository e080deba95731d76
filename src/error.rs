//! Error types for the cache
//!
//! Provides unified error handling using thiserror.
//!
//! Runtime operations never fail recoverably: lookups encode absence as
//! `Option`, writes report eviction as `bool`. The only fallible surface
//! is construction and resizing, where invalid sizing parameters are a
//! programmer error.

use thiserror::Error;

// == Config Error Enum ==
/// Validation failure for cache construction or resize parameters.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigError {
    /// Cache capacity below the minimum of one entry
    #[error("cache capacity must be at least 1")]
    ZeroCapacity,

    /// Cache capacity so large that the node pool size would overflow
    #[error("cache capacity must be less than usize::MAX")]
    CapacityOverflow,

    /// Prune batch size below the minimum of one entry
    #[error("prune size must be at least 1")]
    ZeroPruneSize,

    /// A fetcher was supplied without any workers to drive it
    #[error("fetching requires at least 1 worker")]
    ZeroFetchWorkers,

    /// A fetcher was supplied with an unbuffered key queue
    #[error("fetching requires a queue capacity of at least 1")]
    ZeroFetchQueue,
}
