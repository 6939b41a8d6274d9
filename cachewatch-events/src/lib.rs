//! CacheWatch Events - Change-event queue, draining and invalidation strategies
//!
//! This crate turns a stream of raw change notifications into a decision:
//! "discard the memoized results now" or "keep them".
//!
//! # Architecture
//!
//! ```text
//! NotificationSource ──payload──▶ NotificationSink ──Event──▶ EventQueue
//!                                                                  │
//!                                      Strategy::clear ◀── drain ──┘
//! ```
//!
//! - [`NotificationSource`]: pushes raw payloads for one channel
//! - [`EventQueue`]: parses and buffers events, tracks connection health
//! - [`drain`]: bounded, non-blocking pass over a queue
//! - [`Strategy`]: `Greedy`, `Windowed` and `Timed` decisions over a pass

mod drain;
mod queue;
mod source;
mod strategy;

pub use drain::{drain, DeadlineDrain};
pub use queue::{EventQueue, EventQueueProtocol, NotificationSink, TerminationHook};
pub use source::{ChannelPublisher, ChannelSource, NotificationSource, SourceLink};
#[cfg(feature = "websocket")]
pub use source::WsNotificationSource;
pub use strategy::{EventPredicate, Greedy, Strategy, Timed, Windowed};

// Re-export core types for convenience
pub use cachewatch_core::{
    CacheWatchError, CacheWatchResult, Channel, DeadlineSetting, Event, Operation, QueueError,
};
