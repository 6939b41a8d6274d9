//! Configuration types

use crate::{CacheWatchError, CacheWatchResult, Channel, ConfigError};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default upper bound on events drained in one pass.
pub const DEFAULT_MAX_ITERATIONS: usize = 1_000;

/// Default upper bound on wall-clock time spent draining in one pass.
pub const DEFAULT_MAX_TIME: Duration = Duration::from_millis(1);

/// Default latency above which an ingested event is logged as late.
pub const DEFAULT_MAX_LATENCY: Duration = Duration::from_millis(500);

// ============================================================================
// DEADLINE SETTING
// ============================================================================

/// Bounds for one drain pass over an event queue.
///
/// Both bounds are strictly positive; construction and deserialization fail
/// otherwise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawDeadlineSetting")]
pub struct DeadlineSetting {
    max_iterations: usize,
    max_time: Duration,
}

#[derive(Deserialize)]
struct RawDeadlineSetting {
    max_iterations: usize,
    max_time: Duration,
}

impl TryFrom<RawDeadlineSetting> for DeadlineSetting {
    type Error = CacheWatchError;

    fn try_from(raw: RawDeadlineSetting) -> Result<Self, Self::Error> {
        Self::new(raw.max_iterations, raw.max_time)
    }
}

impl DeadlineSetting {
    pub fn new(max_iterations: usize, max_time: Duration) -> CacheWatchResult<Self> {
        if max_iterations == 0 {
            return Err(CacheWatchError::Config(ConfigError::InvalidValue {
                field: "max_iterations".to_string(),
                value: max_iterations.to_string(),
                reason: "max_iterations must be greater than 0".to_string(),
            }));
        }

        if max_time.is_zero() {
            return Err(CacheWatchError::Config(ConfigError::InvalidValue {
                field: "max_time".to_string(),
                value: format!("{:?}", max_time),
                reason: "max_time must be greater than 0".to_string(),
            }));
        }

        Ok(Self {
            max_iterations,
            max_time,
        })
    }

    pub fn max_iterations(&self) -> usize {
        self.max_iterations
    }

    pub fn max_time(&self) -> Duration {
        self.max_time
    }
}

impl Default for DeadlineSetting {
    fn default() -> Self {
        Self {
            max_iterations: DEFAULT_MAX_ITERATIONS,
            max_time: DEFAULT_MAX_TIME,
        }
    }
}

// ============================================================================
// ENGINE CONFIG
// ============================================================================

/// Settings recognized by the invalidation engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Notification channel. Must be unique per logical cache.
    pub channel: Channel,
    /// Maximum number of buffered events (0 = unbounded).
    pub max_queue_size: usize,
    /// Latency above which an ingested event is logged. Never dropped.
    pub max_latency: Duration,
    /// Bounds for each drain pass.
    pub deadline: DeadlineSetting,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            channel: Channel::default(),
            max_queue_size: 0,
            max_latency: DEFAULT_MAX_LATENCY,
            deadline: DeadlineSetting::default(),
        }
    }
}

impl EngineConfig {
    /// Create a new config with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the notification channel.
    pub fn with_channel(mut self, channel: impl Into<Channel>) -> Self {
        self.channel = channel.into();
        self
    }

    /// Set the maximum queue size (0 = unbounded).
    pub fn with_max_queue_size(mut self, max_queue_size: usize) -> Self {
        self.max_queue_size = max_queue_size;
        self
    }

    /// Set the latency warning threshold.
    pub fn with_max_latency(mut self, max_latency: Duration) -> Self {
        self.max_latency = max_latency;
        self
    }

    /// Set the drain deadline.
    pub fn with_deadline(mut self, deadline: DeadlineSetting) -> Self {
        self.deadline = deadline;
        self
    }

    /// Create from environment variables with fallback to defaults.
    ///
    /// Environment variables:
    /// - `CACHEWATCH_CHANNEL`: Notification channel (default: `ch_pgcachewatch_table_change`)
    /// - `CACHEWATCH_MAX_QUEUE_SIZE`: Maximum buffered events, 0 = unbounded (default: 0)
    /// - `CACHEWATCH_MAX_LATENCY_MS`: Latency warning threshold in ms (default: 500)
    /// - `CACHEWATCH_DEADLINE_MAX_ITERATIONS`: Events per drain pass (default: 1000)
    /// - `CACHEWATCH_DEADLINE_MAX_TIME_US`: Drain pass time budget in µs (default: 1000)
    ///
    /// Values that fail to parse fall back to the default; values that parse
    /// but violate an invariant are rejected.
    pub fn from_env() -> CacheWatchResult<Self> {
        let defaults = Self::default();

        let channel = std::env::var("CACHEWATCH_CHANNEL")
            .ok()
            .filter(|s| !s.is_empty())
            .map(Channel::new)
            .unwrap_or(defaults.channel);
        let max_queue_size = std::env::var("CACHEWATCH_MAX_QUEUE_SIZE")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.max_queue_size);
        let max_latency = std::env::var("CACHEWATCH_MAX_LATENCY_MS")
            .ok()
            .and_then(|s| s.parse().ok())
            .map(Duration::from_millis)
            .unwrap_or(defaults.max_latency);
        let max_iterations = std::env::var("CACHEWATCH_DEADLINE_MAX_ITERATIONS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.deadline.max_iterations());
        let max_time = std::env::var("CACHEWATCH_DEADLINE_MAX_TIME_US")
            .ok()
            .and_then(|s| s.parse().ok())
            .map(Duration::from_micros)
            .unwrap_or(defaults.deadline.max_time());

        let config = Self {
            channel,
            max_queue_size,
            max_latency,
            deadline: DeadlineSetting::new(max_iterations, max_time)?,
        };
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    ///
    /// Validates:
    /// - channel is not empty
    /// - deadline bounds are positive
    pub fn validate(&self) -> CacheWatchResult<()> {
        if self.channel.as_str().is_empty() {
            return Err(CacheWatchError::Config(ConfigError::MissingRequired {
                field: "channel".to_string(),
            }));
        }

        DeadlineSetting::new(self.deadline.max_iterations, self.deadline.max_time)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deadline_defaults() {
        let deadline = DeadlineSetting::default();
        assert_eq!(deadline.max_iterations(), 1_000);
        assert_eq!(deadline.max_time(), Duration::from_millis(1));
    }

    #[test]
    fn test_deadline_rejects_zero_iterations() {
        let err = DeadlineSetting::new(0, Duration::from_millis(1)).unwrap_err();
        assert!(matches!(
            err,
            CacheWatchError::Config(ConfigError::InvalidValue { ref field, .. }) if field == "max_iterations"
        ));
    }

    #[test]
    fn test_deadline_rejects_zero_time() {
        let err = DeadlineSetting::new(10, Duration::ZERO).unwrap_err();
        assert!(matches!(
            err,
            CacheWatchError::Config(ConfigError::InvalidValue { ref field, .. }) if field == "max_time"
        ));
    }

    #[test]
    fn test_deadline_deserialize_validates() {
        let ok: DeadlineSetting = serde_json::from_str(
            r#"{"max_iterations": 5, "max_time": {"secs": 0, "nanos": 1000}}"#,
        )
        .unwrap();
        assert_eq!(ok.max_iterations(), 5);
        assert_eq!(ok.max_time(), Duration::from_micros(1));

        let bad = serde_json::from_str::<DeadlineSetting>(
            r#"{"max_iterations": 0, "max_time": {"secs": 1, "nanos": 0}}"#,
        );
        assert!(bad.is_err());
    }

    #[test]
    fn test_engine_config_builder() {
        let deadline = DeadlineSetting::new(50, Duration::from_millis(5)).unwrap();
        let config = EngineConfig::new()
            .with_channel("ch_orders")
            .with_max_queue_size(128)
            .with_max_latency(Duration::from_millis(250))
            .with_deadline(deadline);

        assert_eq!(config.channel.as_str(), "ch_orders");
        assert_eq!(config.max_queue_size, 128);
        assert_eq!(config.max_latency, Duration::from_millis(250));
        assert_eq!(config.deadline, deadline);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_engine_config_rejects_empty_channel() {
        let config = EngineConfig::new().with_channel("");
        assert!(matches!(
            config.validate(),
            Err(CacheWatchError::Config(ConfigError::MissingRequired { .. }))
        ));
    }

    #[test]
    fn test_engine_config_serde_round_trip() {
        let config = EngineConfig::new().with_channel("ch_orders");
        let json = serde_json::to_string(&config).unwrap();
        let back: EngineConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back, config);
    }
}
