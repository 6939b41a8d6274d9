//! Event queue fed by an upstream notification source.
//!
//! The queue buffers parsed [`Event`]s in arrival order and exposes the two
//! capabilities the invalidation strategies need: a non-blocking health signal
//! and a non-blocking dequeue ([`EventQueueProtocol`]).
//!
//! # Binding
//!
//! A queue is bound once, to one source and one channel, by
//! [`EventQueue::connect`]. The source receives a [`NotificationSink`] that
//! pushes raw payloads into the queue and reports upstream termination.
//! Termination of a bound queue is permanent: once reported, [`EventQueue::connection_healthy`]
//! never returns true again.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError, RwLock, Weak};
use std::time::Duration;

use cachewatch_core::{
    CacheWatchResult, Channel, EngineConfig, Event, HealthCheck, QueueError, DEFAULT_MAX_LATENCY,
};
use chrono::Utc;
use tracing::{debug, error, warn};

use crate::source::{NotificationSource, SourceLink};

/// Capabilities a strategy consumes from an event queue.
pub trait EventQueueProtocol: Send + Sync {
    /// Whether the upstream connection is currently usable.
    fn connection_healthy(&self) -> bool;

    /// Remove and return the oldest buffered event, or [`QueueError::Empty`].
    fn dequeue_nowait(&self) -> Result<Event, QueueError>;
}

impl<Q: EventQueueProtocol + ?Sized> EventQueueProtocol for Arc<Q> {
    fn connection_healthy(&self) -> bool {
        (**self).connection_healthy()
    }

    fn dequeue_nowait(&self) -> Result<Event, QueueError> {
        (**self).dequeue_nowait()
    }
}

/// Callback invoked once when the upstream of one queue terminates.
pub type TerminationHook = Arc<dyn Fn(&Channel) + Send + Sync>;

fn log_termination(channel: &Channel) {
    error!(channel = %channel, "Notification connection is closed / terminated");
}

/// Buffer of change events for one notification channel.
pub struct EventQueue {
    /// Maximum number of buffered events (0 = unbounded).
    max_size: usize,
    /// Latency above which an ingested event is logged.
    max_latency: Duration,
    buffer: Mutex<VecDeque<Event>>,
    /// Set when `connect` claims the queue, cleared if the subscription fails.
    channel: RwLock<Option<Channel>>,
    /// Set once, after the source accepted the subscription.
    link: OnceLock<Box<dyn SourceLink>>,
    /// Guards against concurrent `connect` calls.
    claimed: AtomicBool,
    /// Numbers `connect` attempts; only the current attempt's sink is live.
    attempt: AtomicU64,
    terminated: AtomicBool,
}

impl EventQueue {
    /// Create an unbounded queue with the default latency threshold.
    pub fn new() -> Arc<Self> {
        Self::with_limits(0, DEFAULT_MAX_LATENCY)
    }

    /// Create a queue with explicit size limit (0 = unbounded) and latency threshold.
    pub fn with_limits(max_size: usize, max_latency: Duration) -> Arc<Self> {
        Arc::new(Self {
            max_size,
            max_latency,
            buffer: Mutex::new(VecDeque::new()),
            channel: RwLock::new(None),
            link: OnceLock::new(),
            claimed: AtomicBool::new(false),
            attempt: AtomicU64::new(0),
            terminated: AtomicBool::new(false),
        })
    }

    /// Create a queue sized by an engine configuration.
    pub fn from_config(config: &EngineConfig) -> Arc<Self> {
        Self::with_limits(config.max_queue_size, config.max_latency)
    }

    /// Bind the queue to `source` on `channel`, logging upstream termination.
    ///
    /// # Errors
    ///
    /// - [`QueueError::AlreadyBound`] if the queue was connected before
    /// - any error the source raises while subscribing; the queue stays
    ///   unbound in that case and `connect` may be retried
    pub async fn connect<S>(self: &Arc<Self>, source: &S, channel: Channel) -> CacheWatchResult<()>
    where
        S: NotificationSource + ?Sized,
    {
        self.connect_with_hook(source, channel, Arc::new(log_termination))
            .await
    }

    /// Bind the queue to `source` on `channel` with a termination callback
    /// that fires once, for this queue only.
    pub async fn connect_with_hook<S>(
        self: &Arc<Self>,
        source: &S,
        channel: Channel,
        on_terminate: TerminationHook,
    ) -> CacheWatchResult<()>
    where
        S: NotificationSource + ?Sized,
    {
        if self
            .claimed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            let bound = self.channel().map(|c| c.to_string()).unwrap_or_default();
            return Err(QueueError::AlreadyBound { channel: bound }.into());
        }

        // The channel must be known before the source can deliver anything.
        *self.channel_slot() = Some(channel.clone());
        let attempt = self.attempt.fetch_add(1, Ordering::AcqRel) + 1;
        let sink = NotificationSink {
            queue: Arc::downgrade(self),
            channel: channel.clone(),
            attempt,
            on_terminate,
        };

        match source.subscribe(&channel, sink).await {
            Ok(link) => {
                // `claimed` makes this the only writer.
                let _ = self.link.set(link);
                debug!(channel = %channel, "Event queue connected");
                Ok(())
            }
            Err(e) => {
                // Retire the failed attempt's sink before releasing the claim,
                // so a termination it reported cannot outlive it.
                self.attempt.fetch_add(1, Ordering::AcqRel);
                self.terminated.store(false, Ordering::Release);
                *self.channel_slot() = None;
                self.claimed.store(false, Ordering::Release);
                error!(channel = %channel, error = %e, "Event queue failed to connect");
                Err(e)
            }
        }
    }

    /// Channel this queue is bound to, if any.
    pub fn channel(&self) -> Option<Channel> {
        self.channel
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Whether the upstream connection is currently usable.
    pub fn connection_healthy(&self) -> bool {
        if self.terminated.load(Ordering::Acquire) {
            return false;
        }
        self.link.get().is_some_and(|link| link.is_open())
    }

    /// Parse a raw payload from the bound channel and enqueue it.
    ///
    /// Parse failures are logged and the payload is dropped; they never reach
    /// the caller.
    ///
    /// # Errors
    ///
    /// - [`QueueError::NotBound`] if the queue has no channel yet
    /// - [`QueueError::Full`] if the queue is bounded and full
    pub fn ingest(&self, payload: &[u8]) -> CacheWatchResult<()> {
        let channel = self.channel().ok_or(QueueError::NotBound)?;

        let event = match Event::from_payload(&channel, payload, Utc::now()) {
            Ok(event) => event,
            Err(e) => {
                error!(
                    channel = %channel,
                    error = %e,
                    payload = %String::from_utf8_lossy(payload),
                    "Failed to parse payload"
                );
                return Ok(());
            }
        };

        if event.latency_exceeds(self.max_latency) {
            warn!(
                channel = %channel,
                table = event.table(),
                operation = %event.operation(),
                latency_ms = event.latency().num_milliseconds(),
                max_latency_ms = self.max_latency.as_millis() as u64,
                "Event latency exceeds maximum"
            );
        } else {
            debug!(
                channel = %channel,
                table = event.table(),
                operation = %event.operation(),
                "Inserting event into queue"
            );
        }

        self.enqueue(event)
    }

    /// Append an already-built event.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Full`] if the queue is bounded and full.
    pub fn enqueue(&self, event: Event) -> CacheWatchResult<()> {
        let mut buffer = self.buffer();
        if self.max_size > 0 && buffer.len() >= self.max_size {
            return Err(QueueError::Full {
                capacity: self.max_size,
            }
            .into());
        }
        buffer.push_back(event);
        Ok(())
    }

    /// Remove and return the oldest buffered event.
    pub fn dequeue_nowait(&self) -> Result<Event, QueueError> {
        self.buffer().pop_front().ok_or(QueueError::Empty)
    }

    /// Number of buffered events.
    pub fn size(&self) -> usize {
        self.buffer().len()
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    /// Health report for this queue's upstream connection.
    pub fn health_check(&self) -> HealthCheck {
        let component = match self.channel() {
            Some(channel) => format!("event_queue:{}", channel),
            None => "event_queue".to_string(),
        };

        let check = if self.connection_healthy() {
            HealthCheck::healthy(component)
        } else if self.terminated.load(Ordering::Acquire) {
            HealthCheck::unhealthy(component, "upstream connection terminated")
        } else if self.link.get().is_none() {
            HealthCheck::unhealthy(component, "not connected")
        } else {
            HealthCheck::unhealthy(component, "upstream connection closed")
        };

        check.with_metadata("buffered", self.size().into())
    }

    fn is_current(&self, attempt: u64) -> bool {
        self.attempt.load(Ordering::Acquire) == attempt
    }

    /// Mark the upstream as terminated. Returns true on the first call only.
    fn mark_terminated(&self) -> bool {
        !self.terminated.swap(true, Ordering::AcqRel)
    }

    fn channel_slot(&self) -> std::sync::RwLockWriteGuard<'_, Option<Channel>> {
        self.channel.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn buffer(&self) -> MutexGuard<'_, VecDeque<Event>> {
        // A VecDeque push/pop cannot leave the buffer half-updated.
        self.buffer.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl EventQueueProtocol for EventQueue {
    fn connection_healthy(&self) -> bool {
        EventQueue::connection_healthy(self)
    }

    fn dequeue_nowait(&self) -> Result<Event, QueueError> {
        EventQueue::dequeue_nowait(self)
    }
}

impl std::fmt::Debug for EventQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventQueue")
            .field("channel", &self.channel())
            .field("max_size", &self.max_size)
            .field("max_latency", &self.max_latency)
            .field("size", &self.size())
            .field("healthy", &self.connection_healthy())
            .finish()
    }
}

/// Delivery handle a [`NotificationSource`] uses to feed one queue.
///
/// Holds the queue weakly, so a running source never keeps a dropped queue
/// alive. Both methods are infallible: the upstream delivery path never fails.
#[derive(Clone)]
pub struct NotificationSink {
    queue: Weak<EventQueue>,
    channel: Channel,
    attempt: u64,
    on_terminate: TerminationHook,
}

impl NotificationSink {
    /// Channel the sink delivers for.
    pub fn channel(&self) -> &Channel {
        &self.channel
    }

    /// Deliver one raw payload.
    pub fn deliver(&self, payload: &[u8]) {
        let Some(queue) = self.live_queue() else {
            return;
        };
        if let Err(e) = queue.ingest(payload) {
            error!(
                channel = %self.channel,
                error = %e,
                "Unexpected error inserting event into queue"
            );
        }
    }

    /// Report that the upstream connection is gone for good.
    pub fn terminate(&self) {
        let Some(queue) = self.live_queue() else {
            return;
        };
        if queue.mark_terminated() {
            (self.on_terminate)(&self.channel);
        }
    }

    /// Whether the queue behind this sink still exists and this sink belongs
    /// to its current connection. A detached sink ignores every call.
    pub fn is_attached(&self) -> bool {
        self.live_queue().is_some()
    }

    fn live_queue(&self) -> Option<Arc<EventQueue>> {
        self.queue
            .upgrade()
            .filter(|queue| queue.is_current(self.attempt))
    }
}

impl std::fmt::Debug for NotificationSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotificationSink")
            .field("channel", &self.channel)
            .field("attached", &self.is_attached())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use cachewatch_core::{CacheWatchError, SourceError};
    use std::sync::atomic::AtomicUsize;

    /// Source that hands the sink back to the test.
    #[derive(Default)]
    struct CapturingSource {
        sink: Mutex<Option<NotificationSink>>,
        open: Arc<AtomicBool>,
        fail: bool,
    }

    struct FlagLink(Arc<AtomicBool>);

    impl SourceLink for FlagLink {
        fn is_open(&self) -> bool {
            self.0.load(Ordering::Acquire)
        }
    }

    #[async_trait]
    impl NotificationSource for CapturingSource {
        async fn subscribe(
            &self,
            channel: &Channel,
            sink: NotificationSink,
        ) -> CacheWatchResult<Box<dyn SourceLink>> {
            if self.fail {
                return Err(SourceError::ListenFailed {
                    channel: channel.to_string(),
                    reason: "refused".to_string(),
                }
                .into());
            }
            self.open.store(true, Ordering::Release);
            *self.sink.lock().unwrap() = Some(sink);
            Ok(Box::new(FlagLink(self.open.clone())))
        }
    }

    impl CapturingSource {
        fn sink(&self) -> NotificationSink {
            self.sink.lock().unwrap().clone().unwrap()
        }
    }

    /// Source that reports termination and then rejects the subscription,
    /// keeping the sink it was given.
    #[derive(Default)]
    struct TerminateThenFailSource {
        sink: Mutex<Option<NotificationSink>>,
    }

    #[async_trait]
    impl NotificationSource for TerminateThenFailSource {
        async fn subscribe(
            &self,
            channel: &Channel,
            sink: NotificationSink,
        ) -> CacheWatchResult<Box<dyn SourceLink>> {
            sink.terminate();
            *self.sink.lock().unwrap() = Some(sink);
            Err(SourceError::ListenFailed {
                channel: channel.to_string(),
                reason: "connection closed".to_string(),
            }
            .into())
        }
    }

    const PAYLOAD: &[u8] =
        br#"{"operation":"insert","table":"orders","sent_at":"2024-05-01T10:11:12Z"}"#;

    #[tokio::test]
    async fn test_unbound_queue_is_unhealthy() {
        let queue = EventQueue::new();
        assert!(!queue.connection_healthy());
        assert!(queue.channel().is_none());
        assert_eq!(
            queue.ingest(PAYLOAD),
            Err(CacheWatchError::Queue(QueueError::NotBound))
        );
        assert!(!queue.health_check().is_healthy());
    }

    #[tokio::test]
    async fn test_connect_and_ingest() {
        let queue = EventQueue::new();
        let source = CapturingSource::default();
        queue.connect(&source, Channel::new("ch_a")).await.unwrap();

        assert!(queue.connection_healthy());
        assert_eq!(queue.channel(), Some(Channel::new("ch_a")));

        source.sink().deliver(PAYLOAD);
        assert_eq!(queue.size(), 1);

        let event = queue.dequeue_nowait().unwrap();
        assert_eq!(event.channel().as_str(), "ch_a");
        assert_eq!(event.table(), "orders");
        assert_eq!(queue.dequeue_nowait(), Err(QueueError::Empty));
    }

    #[tokio::test]
    async fn test_connect_twice_fails() {
        let queue = EventQueue::new();
        let source = CapturingSource::default();
        queue.connect(&source, Channel::new("ch_a")).await.unwrap();

        let other = CapturingSource::default();
        let err = queue.connect(&other, Channel::new("ch_b")).await.unwrap_err();
        assert_eq!(
            err,
            CacheWatchError::Queue(QueueError::AlreadyBound {
                channel: "ch_a".to_string()
            })
        );
        assert_eq!(queue.channel(), Some(Channel::new("ch_a")));
    }

    #[tokio::test]
    async fn test_failed_connect_can_be_retried() {
        let queue = EventQueue::new();
        let failing = CapturingSource {
            fail: true,
            ..Default::default()
        };
        assert!(queue.connect(&failing, Channel::new("ch_a")).await.is_err());
        assert!(!queue.connection_healthy());

        let source = CapturingSource::default();
        queue.connect(&source, Channel::new("ch_a")).await.unwrap();
        assert!(queue.connection_healthy());
    }

    #[tokio::test]
    async fn test_malformed_payload_is_dropped() {
        let queue = EventQueue::new();
        let source = CapturingSource::default();
        queue.connect(&source, Channel::new("ch_a")).await.unwrap();

        source.sink().deliver(b"{not json");
        source.sink().deliver(br#"{"operation":"merge","table":"t","sent_at":"2024-05-01T10:11:12Z"}"#);
        assert!(queue.ingest(b"[]").is_ok());
        assert_eq!(queue.size(), 0);
    }

    #[tokio::test]
    async fn test_bounded_queue_rejects_when_full() {
        let queue = EventQueue::with_limits(2, Duration::from_millis(500));
        let source = CapturingSource::default();
        queue.connect(&source, Channel::new("ch_a")).await.unwrap();

        assert!(queue.ingest(PAYLOAD).is_ok());
        assert!(queue.ingest(PAYLOAD).is_ok());
        assert_eq!(
            queue.ingest(PAYLOAD),
            Err(CacheWatchError::Queue(QueueError::Full { capacity: 2 }))
        );

        // The sink swallows the error so delivery never fails upstream.
        source.sink().deliver(PAYLOAD);
        assert_eq!(queue.size(), 2);
    }

    #[tokio::test]
    async fn test_late_event_is_kept() {
        let queue = EventQueue::with_limits(0, Duration::from_millis(1));
        let source = CapturingSource::default();
        queue.connect(&source, Channel::new("ch_a")).await.unwrap();

        // sent_at is far in the past, so latency is huge.
        source.sink().deliver(PAYLOAD);
        assert_eq!(queue.size(), 1);
    }

    #[tokio::test]
    async fn test_termination_is_permanent_and_hook_fires_once() {
        let queue = EventQueue::new();
        let source = CapturingSource::default();
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        queue
            .connect_with_hook(
                &source,
                Channel::new("ch_a"),
                Arc::new(move |channel: &Channel| {
                    assert_eq!(channel.as_str(), "ch_a");
                    counter.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .await
            .unwrap();
        assert!(queue.connection_healthy());

        let sink = source.sink();
        sink.terminate();
        sink.terminate();

        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(!queue.connection_healthy());
        // Link reporting open again does not revive a terminated queue.
        source.open.store(true, Ordering::Release);
        assert!(!queue.connection_healthy());
        assert_eq!(
            queue.health_check().message.as_deref(),
            Some("upstream connection terminated")
        );
    }

    #[tokio::test]
    async fn test_termination_during_failed_connect_does_not_outlive_it() {
        let queue = EventQueue::new();
        let failing = TerminateThenFailSource::default();
        assert!(queue.connect(&failing, Channel::new("ch_a")).await.is_err());

        let stale = failing.sink.lock().unwrap().clone().unwrap();
        assert!(!stale.is_attached());

        let source = CapturingSource::default();
        queue.connect(&source, Channel::new("ch_a")).await.unwrap();
        assert!(queue.connection_healthy());

        // The failed attempt's sink can no longer reach the queue.
        stale.terminate();
        stale.deliver(PAYLOAD);
        assert!(queue.connection_healthy());
        assert!(queue.is_empty());

        source.sink().deliver(PAYLOAD);
        assert_eq!(queue.size(), 1);
    }

    #[tokio::test]
    async fn test_closed_link_is_unhealthy() {
        let queue = EventQueue::new();
        let source = CapturingSource::default();
        queue.connect(&source, Channel::new("ch_a")).await.unwrap();

        source.open.store(false, Ordering::Release);
        assert!(!queue.connection_healthy());
    }

    #[tokio::test]
    async fn test_sink_detaches_when_queue_dropped() {
        let queue = EventQueue::new();
        let source = CapturingSource::default();
        queue.connect(&source, Channel::new("ch_a")).await.unwrap();
        let sink = source.sink();
        assert!(sink.is_attached());

        drop(queue);
        assert!(!sink.is_attached());
        sink.deliver(PAYLOAD);
        sink.terminate();
    }

    #[test]
    fn test_enqueue_preserves_order() {
        let queue = EventQueue::new();
        let sent_at = chrono::DateTime::parse_from_rfc3339("2024-05-01T10:11:12Z").unwrap();
        for table in ["a", "b", "c"] {
            queue
                .enqueue(Event::new(
                    Channel::new("ch"),
                    cachewatch_core::Operation::Insert,
                    table,
                    sent_at,
                ))
                .unwrap();
        }
        let tables: Vec<String> = std::iter::from_fn(|| queue.dequeue_nowait().ok())
            .map(|e| e.table().to_string())
            .collect();
        assert_eq!(tables, vec!["a", "b", "c"]);
    }
}
