//! Cachewatch Core - Shared Data Types
//!
//! Pure data structures shared by every cachewatch crate: the change
//! [`Event`] delivered over a notification channel, the [`DeadlineSetting`]
//! that bounds a drain pass, the engine configuration and the error taxonomy.
//! This crate contains no I/O and no concurrency.

mod config;
mod error;
mod event;
mod health;

pub use config::{
    DeadlineSetting, EngineConfig, DEFAULT_MAX_ITERATIONS, DEFAULT_MAX_LATENCY, DEFAULT_MAX_TIME,
};
pub use error::{
    CacheWatchError, CacheWatchResult, ConfigError, PayloadError, QueueError, SourceError,
};
pub use event::{Channel, Event, Operation, DEFAULT_CHANNEL};
pub use health::{HealthCheck, HealthStatus};
