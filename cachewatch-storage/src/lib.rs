//! Cachewatch Storage - Invalidation-driven memoization
//!
//! Wraps an expensive async function in a [`MemoizingCache`] whose entries
//! live until a [`Strategy`](cachewatch_events::Strategy) observes a relevant
//! change notification.
//!
//! # Example
//!
//! ```ignore
//! let queue = EventQueue::new();
//! queue.connect(&source, Channel::default()).await?;
//!
//! let users = MemoizingCache::new(Greedy::new(queue.clone()), |id: i64| async move {
//!     fetch_user(id).await
//! });
//!
//! let user = users.call(42).await?; // miss
//! let user = users.call(42).await?; // hit, until the next change event
//! ```

pub mod cache;

pub use cache::{CacheOutcome, CacheStats, CallArgs, CallKey, MemoizingCache, StatisticsCallback};
