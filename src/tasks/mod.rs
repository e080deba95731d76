//! Background Tasks Module
//!
//! Contains the fetch worker pool that back-fills cache misses.

mod fetch;

pub(crate) use fetch::spawn_fetch_workers;
