//! Cachewatch Test Utilities
//!
//! Shared test infrastructure for the cachewatch workspace:
//! - Tracing setup for tests
//! - Proptest generators for operations and events
//! - Fixtures for building events and payloads
//! - Scripted event queues for driving strategies
//! - Custom assertions for cachewatch errors

pub use cachewatch_core::{
    CacheWatchError, CacheWatchResult, Channel, ConfigError, DeadlineSetting, Event, Operation,
    QueueError, DEFAULT_CHANNEL,
};
pub use cachewatch_events::EventQueueProtocol;

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use chrono::{DateTime, FixedOffset, Offset, Utc};

// ============================================================================
// TRACING
// ============================================================================

/// Install a test-friendly subscriber once per process.
///
/// Honors `RUST_LOG`, falling back to `cachewatch=debug`. Output goes through
/// the test writer so it is captured per test.
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("cachewatch=debug"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
}

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

pub mod generators {
    //! Proptest strategies for generating cachewatch values.

    use super::*;
    use proptest::prelude::*;

    /// Generate an Operation variant.
    pub fn arb_operation() -> impl Strategy<Value = Operation> {
        prop_oneof![
            Just(Operation::Insert),
            Just(Operation::Update),
            Just(Operation::Delete),
            Just(Operation::Truncate),
        ]
    }

    /// Generate a plausible table name.
    pub fn arb_table() -> impl Strategy<Value = String> {
        "[a-z][a-z0-9_]{0,15}"
    }

    /// Generate a sequence of operations.
    pub fn arb_operations(max_len: usize) -> impl Strategy<Value = Vec<Operation>> {
        prop::collection::vec(arb_operation(), 0..=max_len)
    }

    /// Generate a producer timestamp within a few years of 2024, in an
    /// arbitrary whole-hour offset.
    pub fn arb_sent_at() -> impl Strategy<Value = DateTime<FixedOffset>> {
        (1_700_000_000i64..1_800_000_000, 0u32..1_000_000, -12i32..=12).prop_map(
            |(secs, micros, hours)| {
                let utc = DateTime::<Utc>::from_timestamp(secs, micros * 1_000)
                    .unwrap_or_default();
                let offset = FixedOffset::east_opt(hours * 3600).unwrap_or(Utc.fix());
                utc.with_timezone(&offset)
            },
        )
    }

    /// Generate an Event on the default channel.
    pub fn arb_event() -> impl Strategy<Value = Event> {
        (arb_operation(), arb_table(), arb_sent_at()).prop_map(|(operation, table, sent_at)| {
            Event::new(Channel::default(), operation, table, sent_at)
        })
    }
}

// ============================================================================
// TEST FIXTURES
// ============================================================================

pub mod fixtures {
    //! Builders for events and notification payloads.

    use super::*;

    /// Builder for test events. Defaults to an `insert` on `placeholder`,
    /// sent now, on the default channel.
    #[derive(Debug, Clone)]
    pub struct EventBuilder {
        channel: Channel,
        operation: Operation,
        table: String,
        sent_at: DateTime<FixedOffset>,
    }

    impl Default for EventBuilder {
        fn default() -> Self {
            Self {
                channel: Channel::default(),
                operation: Operation::Insert,
                table: "placeholder".to_string(),
                sent_at: Utc::now().fixed_offset(),
            }
        }
    }

    impl EventBuilder {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn channel(mut self, channel: impl Into<Channel>) -> Self {
            self.channel = channel.into();
            self
        }

        pub fn operation(mut self, operation: Operation) -> Self {
            self.operation = operation;
            self
        }

        pub fn table(mut self, table: impl Into<String>) -> Self {
            self.table = table.into();
            self
        }

        pub fn sent_at(mut self, sent_at: DateTime<Utc>) -> Self {
            self.sent_at = sent_at.fixed_offset();
            self
        }

        pub fn build(self) -> Event {
            Event::new(self.channel, self.operation, self.table, self.sent_at)
        }

        /// The notification payload a producer would send for this event.
        pub fn payload(self) -> String {
            self.build().to_payload()
        }
    }

    /// An event for `operation` on `placeholder`, sent now.
    pub fn event(operation: Operation) -> Event {
        EventBuilder::new().operation(operation).build()
    }

    /// One event per operation, in order.
    pub fn events(operations: &[Operation]) -> Vec<Event> {
        operations.iter().copied().map(event).collect()
    }
}

// ============================================================================
// SCRIPTED QUEUES
// ============================================================================

/// Event queue with a fixed script of events and a settable health flag.
#[derive(Debug)]
pub struct ScriptedQueue {
    events: Mutex<VecDeque<Event>>,
    healthy: AtomicBool,
    dequeues: AtomicUsize,
}

impl ScriptedQueue {
    /// A healthy queue with no events.
    pub fn new() -> Self {
        Self::with_events(Vec::new())
    }

    /// A healthy queue that yields `events` in order.
    pub fn with_events(events: Vec<Event>) -> Self {
        Self {
            events: Mutex::new(events.into()),
            healthy: AtomicBool::new(true),
            dequeues: AtomicUsize::new(0),
        }
    }

    pub fn push(&self, event: Event) {
        self.lock().push_back(event);
    }

    pub fn push_all(&self, events: impl IntoIterator<Item = Event>) {
        self.lock().extend(events);
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }

    /// Events not yet dequeued.
    pub fn remaining(&self) -> usize {
        self.lock().len()
    }

    /// Successful dequeues so far.
    pub fn dequeued(&self) -> usize {
        self.dequeues.load(Ordering::SeqCst)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<Event>> {
        self.events
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl Default for ScriptedQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl EventQueueProtocol for ScriptedQueue {
    fn connection_healthy(&self) -> bool {
        self.healthy.load(Ordering::SeqCst)
    }

    fn dequeue_nowait(&self) -> Result<Event, QueueError> {
        let event = self.lock().pop_front().ok_or(QueueError::Empty)?;
        self.dequeues.fetch_add(1, Ordering::SeqCst);
        Ok(event)
    }
}

/// Healthy queue that never runs dry: every dequeue returns a copy of the
/// template event.
#[derive(Debug)]
pub struct EndlessQueue {
    template: Event,
    dequeues: AtomicUsize,
}

impl EndlessQueue {
    pub fn new(template: Event) -> Self {
        Self {
            template,
            dequeues: AtomicUsize::new(0),
        }
    }

    pub fn dequeued(&self) -> usize {
        self.dequeues.load(Ordering::SeqCst)
    }
}

impl Default for EndlessQueue {
    fn default() -> Self {
        Self::new(fixtures::event(Operation::Insert))
    }
}

impl EventQueueProtocol for EndlessQueue {
    fn connection_healthy(&self) -> bool {
        true
    }

    fn dequeue_nowait(&self) -> Result<Event, QueueError> {
        self.dequeues.fetch_add(1, Ordering::SeqCst);
        Ok(self.template.clone())
    }
}

// ============================================================================
// CUSTOM ASSERTIONS
// ============================================================================

pub mod assertions {
    //! Assertions for cachewatch results.

    use super::*;

    /// Assert that a CacheWatchResult is Ok.
    #[track_caller]
    pub fn assert_ok<T: std::fmt::Debug>(result: &CacheWatchResult<T>) {
        assert!(result.is_ok(), "Expected Ok, got Err: {:?}", result);
    }

    /// Assert that a CacheWatchResult is a Config error.
    #[track_caller]
    pub fn assert_config_error<T: std::fmt::Debug>(result: &CacheWatchResult<T>) {
        match result {
            Err(CacheWatchError::Config(_)) => {}
            other => panic!("Expected Config error, got: {:?}", other),
        }
    }

    /// Assert that a CacheWatchResult is a specific Queue error.
    #[track_caller]
    pub fn assert_queue_error<T: std::fmt::Debug>(result: &CacheWatchResult<T>, expected: QueueError) {
        match result {
            Err(CacheWatchError::Queue(err)) => assert_eq!(*err, expected),
            other => panic!("Expected Queue error {:?}, got: {:?}", expected, other),
        }
    }

    /// Assert that a CacheWatchResult is a Source error.
    #[track_caller]
    pub fn assert_source_error<T: std::fmt::Debug>(result: &CacheWatchResult<T>) {
        match result {
            Err(CacheWatchError::Source(_)) => {}
            other => panic!("Expected Source error, got: {:?}", other),
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
