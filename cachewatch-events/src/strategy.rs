//! Invalidation strategies.
//!
//! A [`Strategy`] drains its event queue for one bounded pass and decides
//! whether cached data may be stale. Every `clear` call is cooperative: it
//! never blocks, and with an empty queue it returns `false` immediately.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use cachewatch_core::{
    CacheWatchError, CacheWatchResult, ConfigError, DeadlineSetting, Event, Operation,
};
use chrono::{DateTime, TimeDelta, Utc};
use tracing::debug;

use crate::drain::drain;
use crate::queue::EventQueueProtocol;

/// Decides when a memoized result set must be discarded.
pub trait Strategy: Send {
    /// Drain one bounded pass; `true` means invalidate now.
    fn clear(&mut self) -> bool;

    /// Health of the underlying event queue.
    fn connection_healthy(&self) -> bool;
}

impl<S: Strategy + ?Sized> Strategy for Box<S> {
    fn clear(&mut self) -> bool {
        (**self).clear()
    }

    fn connection_healthy(&self) -> bool {
        (**self).connection_healthy()
    }
}

/// Predicate over events used by [`Greedy`].
pub type EventPredicate = Box<dyn Fn(&Event) -> bool + Send + Sync>;

// ============================================================================
// GREEDY
// ============================================================================

/// Invalidate on the first matching event.
///
/// Events after the match stay queued for the next call.
pub struct Greedy {
    queue: Arc<dyn EventQueueProtocol>,
    settings: DeadlineSetting,
    predicate: EventPredicate,
}

impl Greedy {
    /// Invalidate on any event.
    pub fn new(queue: Arc<dyn EventQueueProtocol>) -> Self {
        Self::with_predicate(queue, |_| true)
    }

    /// Invalidate on events matching `predicate`.
    pub fn with_predicate<F>(queue: Arc<dyn EventQueueProtocol>, predicate: F) -> Self
    where
        F: Fn(&Event) -> bool + Send + Sync + 'static,
    {
        Self {
            queue,
            settings: DeadlineSetting::default(),
            predicate: Box::new(predicate),
        }
    }

    pub fn with_settings(mut self, settings: DeadlineSetting) -> Self {
        self.settings = settings;
        self
    }
}

impl Strategy for Greedy {
    fn clear(&mut self) -> bool {
        for event in drain(self.queue.as_ref(), self.settings) {
            if (self.predicate)(&event) {
                debug!(
                    table = event.table(),
                    operation = %event.operation(),
                    "Greedy strategy matched event"
                );
                return true;
            }
        }
        false
    }

    fn connection_healthy(&self) -> bool {
        self.queue.connection_healthy()
    }
}

// ============================================================================
// WINDOWED
// ============================================================================

/// Invalidate once the trailing operations equal a configured sequence.
///
/// The trailing buffer slides across calls and is never reset, so matches
/// may overlap: with window `[insert, insert]`, three inserts match on the
/// second and again on the third.
pub struct Windowed {
    queue: Arc<dyn EventQueueProtocol>,
    settings: DeadlineSetting,
    window: Vec<Operation>,
    trailing: VecDeque<Operation>,
}

impl Windowed {
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidValue`] if `window` is empty.
    pub fn new(queue: Arc<dyn EventQueueProtocol>, window: Vec<Operation>) -> CacheWatchResult<Self> {
        if window.is_empty() {
            return Err(CacheWatchError::Config(ConfigError::InvalidValue {
                field: "window".to_string(),
                value: "[]".to_string(),
                reason: "window must contain at least one operation".to_string(),
            }));
        }

        Ok(Self {
            queue,
            settings: DeadlineSetting::default(),
            trailing: VecDeque::with_capacity(window.len()),
            window,
        })
    }

    pub fn with_settings(mut self, settings: DeadlineSetting) -> Self {
        self.settings = settings;
        self
    }

    pub fn window(&self) -> &[Operation] {
        &self.window
    }

    fn observe(&mut self, operation: Operation) -> bool {
        if self.trailing.len() == self.window.len() {
            self.trailing.pop_front();
        }
        self.trailing.push_back(operation);
        self.trailing.len() == self.window.len() && self.trailing.iter().eq(self.window.iter())
    }
}

impl Strategy for Windowed {
    fn clear(&mut self) -> bool {
        let queue = Arc::clone(&self.queue);
        for event in drain(queue.as_ref(), self.settings) {
            if self.observe(event.operation()) {
                debug!(window = ?self.window, "Windowed strategy matched sequence");
                return true;
            }
        }
        false
    }

    fn connection_healthy(&self) -> bool {
        self.queue.connection_healthy()
    }
}

// ============================================================================
// TIMED
// ============================================================================

/// Invalidate at most once per interval, measured on producer timestamps.
///
/// An event triggers when its `sent_at` is more than `interval` after the
/// previous trigger's `sent_at`. Before the first trigger the anchor is the
/// moment the strategy was built.
pub struct Timed {
    queue: Arc<dyn EventQueueProtocol>,
    settings: DeadlineSetting,
    interval: TimeDelta,
    previous: DateTime<Utc>,
}

impl Timed {
    pub fn new(queue: Arc<dyn EventQueueProtocol>, interval: Duration) -> Self {
        Self::anchored_at(queue, interval, Utc::now())
    }

    /// Build with an explicit initial anchor.
    pub fn anchored_at(
        queue: Arc<dyn EventQueueProtocol>,
        interval: Duration,
        anchor: DateTime<Utc>,
    ) -> Self {
        Self {
            queue,
            settings: DeadlineSetting::default(),
            interval: TimeDelta::from_std(interval).unwrap_or(TimeDelta::MAX),
            previous: anchor,
        }
    }

    pub fn with_settings(mut self, settings: DeadlineSetting) -> Self {
        self.settings = settings;
        self
    }

    /// `sent_at` of the last triggering event (or the initial anchor).
    pub fn previous(&self) -> DateTime<Utc> {
        self.previous
    }
}

impl Strategy for Timed {
    fn clear(&mut self) -> bool {
        for event in drain(self.queue.as_ref(), self.settings) {
            let sent_at = event.sent_at().with_timezone(&Utc);
            if sent_at.signed_duration_since(self.previous) > self.interval {
                debug!(
                    sent_at = %sent_at,
                    previous = %self.previous,
                    "Timed strategy interval elapsed"
                );
                self.previous = sent_at;
                return true;
            }
        }
        false
    }

    fn connection_healthy(&self) -> bool {
        self.queue.connection_healthy()
    }
}
