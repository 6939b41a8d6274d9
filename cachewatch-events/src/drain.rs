//! Deadline-bounded draining of an event queue.

use std::iter::FusedIterator;
use std::time::{Duration, Instant};

use cachewatch_core::{DeadlineSetting, Event};

use crate::queue::EventQueueProtocol;

/// Lazy, finite, non-restartable sequence of events taken from a queue.
///
/// The deadline is captured on the first call to `next`. Each step checks the
/// iteration and time bounds *before* dequeuing, and the sequence ends at the
/// first empty dequeue. The drain never blocks.
pub struct DeadlineDrain<'a> {
    queue: &'a dyn EventQueueProtocol,
    max_iterations: usize,
    max_time: Duration,
    /// `None` until started; `Some(None)` when `now + max_time` overflows.
    deadline: Option<Option<Instant>>,
    count: usize,
    done: bool,
}

impl<'a> DeadlineDrain<'a> {
    pub fn new(queue: &'a dyn EventQueueProtocol, settings: DeadlineSetting) -> Self {
        Self {
            queue,
            max_iterations: settings.max_iterations(),
            max_time: settings.max_time(),
            deadline: None,
            count: 0,
            done: false,
        }
    }

    /// Number of events yielded so far.
    pub fn drained(&self) -> usize {
        self.count
    }

    fn within_bounds(&mut self) -> bool {
        let max_time = self.max_time;
        let deadline = *self
            .deadline
            .get_or_insert_with(|| Instant::now().checked_add(max_time));

        self.count < self.max_iterations && deadline.map_or(true, |d| Instant::now() < d)
    }
}

impl Iterator for DeadlineDrain<'_> {
    type Item = Event;

    fn next(&mut self) -> Option<Event> {
        if self.done {
            return None;
        }
        if !self.within_bounds() {
            self.done = true;
            return None;
        }
        match self.queue.dequeue_nowait() {
            Ok(event) => {
                self.count += 1;
                Some(event)
            }
            Err(_) => {
                self.done = true;
                None
            }
        }
    }
}

impl FusedIterator for DeadlineDrain<'_> {}

/// Start a drain pass over `queue`.
pub fn drain(queue: &dyn EventQueueProtocol, settings: DeadlineSetting) -> DeadlineDrain<'_> {
    DeadlineDrain::new(queue, settings)
}
