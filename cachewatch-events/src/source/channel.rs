//! In-process notification source backed by a tokio channel.
//!
//! Useful for tests, and for applications that already observe their own
//! writes and want the same invalidation pipeline without a database round
//! trip. Dropping every [`ChannelPublisher`] terminates the connection.

use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use cachewatch_core::{CacheWatchResult, Channel, Event, SourceError};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use super::{NotificationSource, SourceLink};
use crate::queue::NotificationSink;

/// Publishing side of a [`ChannelSource`].
#[derive(Debug, Clone)]
pub struct ChannelPublisher {
    tx: mpsc::UnboundedSender<Vec<u8>>,
}

impl ChannelPublisher {
    /// Publish one raw payload. Never blocks.
    ///
    /// # Errors
    ///
    /// Returns [`SourceError::PublishFailed`] if the subscription has ended.
    pub fn publish(&self, payload: impl Into<Vec<u8>>) -> CacheWatchResult<()> {
        self.tx.send(payload.into()).map_err(|_| {
            SourceError::PublishFailed {
                reason: "subscription closed".to_string(),
            }
            .into()
        })
    }

    /// Publish an event as its notification payload.
    pub fn publish_event(&self, event: &Event) -> CacheWatchResult<()> {
        self.publish(event.to_payload())
    }

    /// Whether the receiving side is gone.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Source that forwards payloads published on an in-process channel.
///
/// A `ChannelSource` supports one subscription.
#[derive(Debug)]
pub struct ChannelSource {
    rx: Mutex<Option<mpsc::UnboundedReceiver<Vec<u8>>>>,
}

impl ChannelSource {
    /// Create a source and its publisher.
    pub fn new() -> (Self, ChannelPublisher) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                rx: Mutex::new(Some(rx)),
            },
            ChannelPublisher { tx },
        )
    }
}

#[async_trait]
impl NotificationSource for ChannelSource {
    async fn subscribe(
        &self,
        channel: &Channel,
        sink: NotificationSink,
    ) -> CacheWatchResult<Box<dyn SourceLink>> {
        let rx = self
            .rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(mut rx) = rx else {
            return Err(SourceError::ListenFailed {
                channel: channel.to_string(),
                reason: "channel source already has a subscriber".to_string(),
            }
            .into());
        };

        let pump = tokio::spawn(async move {
            while let Some(payload) = rx.recv().await {
                if !sink.is_attached() {
                    debug!(channel = %sink.channel(), "Queue detached, stopping pump");
                    return;
                }
                sink.deliver(&payload);
            }
            debug!(channel = %sink.channel(), "All publishers dropped");
            sink.terminate();
        });

        Ok(Box::new(TaskLink { pump }))
    }
}

/// Link that is open while the forwarding task runs.
struct TaskLink {
    pump: JoinHandle<()>,
}

impl SourceLink for TaskLink {
    fn is_open(&self) -> bool {
        !self.pump.is_finished()
    }
}

impl Drop for TaskLink {
    fn drop(&mut self) {
        self.pump.abort();
    }
}
