//! Upstream notification sources.
//!
//! A source is anything that can push raw change payloads for a channel: a
//! database session, a socket, an in-process channel. It only has to do two
//! things with the [`NotificationSink`] it is given: call `deliver` for each
//! payload and `terminate` once when the upstream is gone.

use async_trait::async_trait;
use cachewatch_core::{CacheWatchResult, Channel};

use crate::queue::NotificationSink;

mod channel;
#[cfg(feature = "websocket")]
mod websocket;

pub use channel::{ChannelPublisher, ChannelSource};
#[cfg(feature = "websocket")]
pub use websocket::WsNotificationSource;

/// A source of raw change-notification payloads.
#[async_trait]
pub trait NotificationSource: Send + Sync {
    /// Start delivering payloads for `channel` into `sink`.
    ///
    /// Returns once the subscription is active; delivery continues in the
    /// background until the returned link is dropped or the upstream ends.
    async fn subscribe(
        &self,
        channel: &Channel,
        sink: NotificationSink,
    ) -> CacheWatchResult<Box<dyn SourceLink>>;
}

/// Live handle on an active subscription.
pub trait SourceLink: Send + Sync {
    /// Whether the upstream connection is still usable.
    fn is_open(&self) -> bool;
}
