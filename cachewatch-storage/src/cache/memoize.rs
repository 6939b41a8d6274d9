//! Stampede-safe memoization driven by an invalidation strategy.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::panic;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use cachewatch_events::Strategy;
use futures_util::future::{BoxFuture, FutureExt, Shared};
use serde::Serialize;
use tokio::runtime::Handle;
use tracing::{debug, error, trace, warn};

use super::fingerprint::CallKey;
use super::traits::{CacheOutcome, CacheStats, StatisticsCallback};

/// Single-assignment result cell shared by every caller of one key.
type Cell<T, E> = Shared<BoxFuture<'static, Result<T, E>>>;

type Compute<A, T, E> = Arc<dyn Fn(A) -> BoxFuture<'static, Result<T, E>> + Send + Sync>;

struct Entry<T, E> {
    /// Distinguishes this cell from later cells published under the same key.
    generation: u64,
    cell: Cell<T, E>,
}

struct State<S, T, E> {
    strategy: S,
    entries: HashMap<CallKey, Entry<T, E>>,
    next_generation: u64,
    stats: CacheStats,
}

impl<S, T, E> State<S, T, E> {
    fn discard_all(&mut self) {
        self.entries.clear();
        self.stats.clears += 1;
    }
}

enum Admission<A, T, E> {
    Bypass(A),
    Join { cell: Cell<T, E>, outcome: CacheOutcome },
}

/// Memoizes an async function, discarding every result whenever its
/// [`Strategy`] reports a relevant change.
///
/// # Semantics
///
/// On each [`call`](Self::call), under one lock:
///
/// 1. If the strategy's connection is unhealthy, the call bypasses the cache
///    and runs the function directly.
/// 2. If `strategy.clear()` is true, the whole mapping is discarded.
/// 3. The arguments are fingerprinted into a [`CallKey`].
/// 4. An existing cell for the key is joined (a hit); otherwise the function
///    is spawned on the current Tokio runtime and its cell published before
///    anything awaits (a miss).
///
/// The function runs at most once per key between clears, no matter how many
/// callers arrive while it is in flight. A failed or panicking computation
/// removes its own cell, so the next call retries; every caller already
/// joined sees the same outcome. Abandoning a call, or clearing the cache,
/// never cancels a computation: it runs to completion in its own task.
///
/// Calls made outside a Tokio runtime bypass the cache. The lock is never
/// held while the function runs.
pub struct MemoizingCache<S, A, T, E> {
    state: Arc<Mutex<State<S, T, E>>>,
    compute: Compute<A, T, E>,
    on_statistics: Option<StatisticsCallback>,
}

impl<S, A, T, E> MemoizingCache<S, A, T, E>
where
    S: Strategy + 'static,
    A: Serialize + Send + 'static,
    T: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    pub fn new<F, Fut>(strategy: S, compute: F) -> Self
    where
        F: Fn(A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        Self {
            state: Arc::new(Mutex::new(State {
                strategy,
                entries: HashMap::new(),
                next_generation: 0,
                stats: CacheStats::default(),
            })),
            compute: Arc::new(move |args: A| -> BoxFuture<'static, Result<T, E>> {
                compute(args).boxed()
            }),
            on_statistics: None,
        }
    }

    /// Report every hit and miss to `callback`.
    pub fn with_statistics<F>(mut self, callback: F) -> Self
    where
        F: Fn(CacheOutcome) + Send + Sync + 'static,
    {
        self.on_statistics = Some(Arc::new(callback));
        self
    }

    /// Call the memoized function.
    ///
    /// Errors are the wrapped function's own; a bypassed call fails exactly
    /// as an uncached call would.
    pub async fn call(&self, args: A) -> Result<T, E> {
        match self.admit(args) {
            Admission::Bypass(args) => (self.compute)(args).await,
            Admission::Join { cell, outcome } => {
                if let Some(callback) = &self.on_statistics {
                    callback(outcome);
                }
                cell.await
            }
        }
    }

    /// Discard every memoized result, as a strategy-driven clear would.
    pub fn invalidate_all(&self) {
        let mut state = self.lock();
        debug!(entries = state.entries.len(), "Cache invalidated manually");
        state.discard_all();
    }

    /// Snapshot of the counters and current entry count.
    pub fn stats(&self) -> CacheStats {
        let state = self.lock();
        CacheStats {
            entry_count: state.entries.len() as u64,
            ..state.stats.clone()
        }
    }

    /// Number of published cells, including ones still computing.
    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Health of the strategy's event queue; `false` means calls bypass.
    pub fn connection_healthy(&self) -> bool {
        self.lock().strategy.connection_healthy()
    }

    fn admit(&self, args: A) -> Admission<A, T, E> {
        let mut state = self.lock();

        if !state.strategy.connection_healthy() {
            state.stats.bypasses += 1;
            drop(state);
            warn!("Notification connection unhealthy, bypassing cache");
            return Admission::Bypass(args);
        }

        if state.strategy.clear() {
            debug!(entries = state.entries.len(), "Strategy cleared cache");
            state.discard_all();
        }

        let key = match CallKey::of(&args) {
            Ok(key) => key,
            Err(e) => {
                state.stats.bypasses += 1;
                drop(state);
                warn!(error = %e, "Call arguments cannot be fingerprinted, bypassing cache");
                return Admission::Bypass(args);
            }
        };

        if let Some(entry) = state.entries.get(&key) {
            let cell = entry.cell.clone();
            state.stats.hits += 1;
            trace!(key = %key, "Cache hit");
            return Admission::Join {
                cell,
                outcome: CacheOutcome::Hit,
            };
        }

        let runtime = match Handle::try_current() {
            Ok(runtime) => runtime,
            Err(e) => {
                state.stats.bypasses += 1;
                drop(state);
                warn!(error = %e, "No Tokio runtime, bypassing cache");
                return Admission::Bypass(args);
            }
        };

        let generation = state.next_generation;
        state.next_generation += 1;
        let cell = self.spawn_cell(&runtime, key, generation, args);
        state.entries.insert(
            key,
            Entry {
                generation,
                cell: cell.clone(),
            },
        );
        state.stats.misses += 1;
        trace!(key = %key, "Cache miss");

        Admission::Join {
            cell,
            outcome: CacheOutcome::Miss,
        }
    }

    /// Start the computation for a miss and return the cell its callers join.
    fn spawn_cell(&self, runtime: &Handle, key: CallKey, generation: u64, args: A) -> Cell<T, E> {
        let compute = Arc::clone(&self.compute);
        let mut guard = EvictGuard {
            state: Arc::downgrade(&self.state),
            key,
            generation,
            armed: true,
        };

        let task = runtime.spawn(async move {
            let result = compute(args).await;
            guard.armed = result.is_err();
            drop(guard);
            result
        });

        async move {
            match task.await {
                Ok(result) => result,
                Err(e) => match e.try_into_panic() {
                    Ok(payload) => panic::resume_unwind(payload),
                    Err(e) => {
                        error!(key = %key, error = %e, "Memoized computation cancelled");
                        panic!("memoized computation for {} was cancelled", key)
                    }
                },
            }
        }
        .boxed()
        .shared()
    }

    fn lock(&self) -> MutexGuard<'_, State<S, T, E>> {
        // Every critical section leaves the mapping consistent before it can
        // panic (the only foreign code it runs is the strategy).
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Removes the cell of a computation that failed, panicked or was cancelled,
/// unless the key was republished since.
struct EvictGuard<S, T, E> {
    state: Weak<Mutex<State<S, T, E>>>,
    key: CallKey,
    generation: u64,
    armed: bool,
}

impl<S, T, E> Drop for EvictGuard<S, T, E> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let Some(state) = self.state.upgrade() else {
            return;
        };
        let mut state = state.lock().unwrap_or_else(PoisonError::into_inner);
        if state
            .entries
            .get(&self.key)
            .is_some_and(|entry| entry.generation == self.generation)
        {
            state.entries.remove(&self.key);
            debug!(key = %self.key, "Evicted failed computation");
        }
    }
}

impl<S, A, T, E> Clone for MemoizingCache<S, A, T, E> {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
            compute: Arc::clone(&self.compute),
            on_statistics: self.on_statistics.clone(),
        }
    }
}

impl<S, A, T, E> fmt::Debug for MemoizingCache<S, A, T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        f.debug_struct("MemoizingCache")
            .field("entries", &state.entries.len())
            .field("stats", &state.stats)
            .finish()
    }
}
