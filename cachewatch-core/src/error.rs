//! Error types for cachewatch operations

use thiserror::Error;

/// Event queue errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum QueueError {
    #[error("Event queue is already bound to channel {channel}; one queue serves one channel")]
    AlreadyBound { channel: String },

    #[error("Event queue is not bound to any channel")]
    NotBound,

    #[error("Event queue is empty")]
    Empty,

    #[error("Event queue is full (capacity {capacity})")]
    Full { capacity: usize },
}

/// Change-notification payload errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PayloadError {
    #[error("Payload is not valid UTF-8")]
    InvalidEncoding,

    #[error("Payload is not a valid JSON object: {reason}")]
    InvalidJson { reason: String },

    #[error("Payload is missing required field: {field}")]
    MissingField { field: String },

    #[error("Unknown operation: {value}")]
    UnknownOperation { value: String },

    #[error("Invalid timestamp {value}: {reason}")]
    InvalidTimestamp { value: String, reason: String },
}

/// Configuration errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Missing required configuration field: {field}")]
    MissingRequired { field: String },

    #[error("Invalid value for {field}: {value} - {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },
}

/// Notification source errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SourceError {
    #[error("Failed to connect to notification source: {reason}")]
    ConnectFailed { reason: String },

    #[error("Failed to listen on channel {channel}: {reason}")]
    ListenFailed { channel: String, reason: String },

    #[error("Failed to publish notification: {reason}")]
    PublishFailed { reason: String },
}

/// Master error type for all cachewatch errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CacheWatchError {
    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Payload error: {0}")]
    Payload(#[from] PayloadError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("Source error: {0}")]
    Source(#[from] SourceError),
}

/// Result type alias for cachewatch operations.
pub type CacheWatchResult<T> = Result<T, CacheWatchError>;

// =============================================================================
// TESTS
// =============================================================================
