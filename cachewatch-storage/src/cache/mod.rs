//! Memoizing cache with strategy-driven invalidation.
//!
//! There is no TTL: a cached result is served until the associated strategy
//! says the data may be stale, or until the connection feeding that strategy
//! goes unhealthy, in which case calls fail open and run uncached.
//!
//! Concurrent identical calls share one in-flight computation through a
//! published result cell, so a burst of misses for the same arguments runs
//! the wrapped function once.

pub mod fingerprint;
pub mod memoize;
pub mod traits;

pub use fingerprint::{CallArgs, CallKey};
pub use memoize::MemoizingCache;
pub use traits::{CacheOutcome, CacheStats, StatisticsCallback};
