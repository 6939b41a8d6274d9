//! Change events observed on a notification channel.
//!
//! An [`Event`] is the parsed form of one change-notification payload. The
//! producer (a database trigger) supplies `operation`, `table` and `sent_at`;
//! the subscribing queue attaches the channel and stamps `received_at`.
//!
//! # Payload Format
//!
//! ```text
//! {"operation": "insert", "table": "orders", "sent_at": "2024-05-01T10:11:12.345678+00:00"}
//! ```

use chrono::{DateTime, FixedOffset, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::PayloadError;

/// Default channel used by producers and listeners when none is configured.
pub const DEFAULT_CHANNEL: &str = "ch_pgcachewatch_table_change";

// ============================================================================
// CHANNEL
// ============================================================================

/// Opaque notification-channel identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Channel(String);

impl Channel {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for Channel {
    fn default() -> Self {
        Self::new(DEFAULT_CHANNEL)
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Channel {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for Channel {
    fn from(value: String) -> Self {
        Self(value)
    }
}

// ============================================================================
// OPERATION
// ============================================================================

/// Kind of row change that produced an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Insert,
    Update,
    Delete,
    Truncate,
}

impl Operation {
    /// All operations, in declaration order.
    pub const ALL: [Operation; 4] = [
        Operation::Insert,
        Operation::Update,
        Operation::Delete,
        Operation::Truncate,
    ];

    /// Lower-case wire representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Insert => "insert",
            Operation::Update => "update",
            Operation::Delete => "delete",
            Operation::Truncate => "truncate",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Operation {
    type Err = PayloadError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "insert" => Ok(Operation::Insert),
            "update" => Ok(Operation::Update),
            "delete" => Ok(Operation::Delete),
            "truncate" => Ok(Operation::Truncate),
            other => Err(PayloadError::UnknownOperation {
                value: other.to_string(),
            }),
        }
    }
}

// ============================================================================
// EVENT
// ============================================================================

/// One observed change on a notification channel. Immutable once built.
///
/// `received_at >= sent_at` is expected but not enforced; clock skew between
/// producer and consumer shows up as a negative [`Event::latency`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Event {
    channel: Channel,
    operation: Operation,
    table: String,
    sent_at: DateTime<FixedOffset>,
    received_at: DateTime<Utc>,
}

impl Event {
    /// Build an event received now.
    pub fn new(
        channel: Channel,
        operation: Operation,
        table: impl Into<String>,
        sent_at: DateTime<FixedOffset>,
    ) -> Self {
        Self::received(channel, operation, table, sent_at, Utc::now())
    }

    /// Build an event with an explicit reception timestamp.
    pub fn received(
        channel: Channel,
        operation: Operation,
        table: impl Into<String>,
        sent_at: DateTime<FixedOffset>,
        received_at: DateTime<Utc>,
    ) -> Self {
        Self {
            channel,
            operation,
            table: table.into(),
            sent_at,
            received_at,
        }
    }

    /// Parse a raw change-notification payload.
    ///
    /// The channel is always the subscribing channel; a `channel` key in the
    /// payload is ignored, as is any `received_at` key.
    pub fn from_payload(
        channel: &Channel,
        payload: &[u8],
        received_at: DateTime<Utc>,
    ) -> Result<Self, PayloadError> {
        let text = std::str::from_utf8(payload).map_err(|_| PayloadError::InvalidEncoding)?;
        let value: Value =
            serde_json::from_str(text).map_err(|e| PayloadError::InvalidJson {
                reason: e.to_string(),
            })?;
        let Value::Object(object) = value else {
            return Err(PayloadError::InvalidJson {
                reason: "expected a JSON object".to_string(),
            });
        };

        let operation: Operation = required_str(&object, "operation")?.parse()?;
        let table = required_str(&object, "table")?.to_string();
        let sent_at = parse_timestamp(required_str(&object, "sent_at")?)?;

        Ok(Self {
            channel: channel.clone(),
            operation,
            table,
            sent_at,
            received_at,
        })
    }

    /// Serialize as a change-notification payload (the inverse of
    /// [`Event::from_payload`], modulo the channel and reception time).
    pub fn to_payload(&self) -> String {
        serde_json::json!({
            "operation": self.operation,
            "table": self.table,
            "sent_at": self.sent_at.to_rfc3339(),
        })
        .to_string()
    }

    pub fn channel(&self) -> &Channel {
        &self.channel
    }

    pub fn operation(&self) -> Operation {
        self.operation
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn sent_at(&self) -> DateTime<FixedOffset> {
        self.sent_at
    }

    pub fn received_at(&self) -> DateTime<Utc> {
        self.received_at
    }

    /// Time between producer send and consumer reception.
    pub fn latency(&self) -> TimeDelta {
        self.received_at.signed_duration_since(self.sent_at)
    }

    /// Whether the latency exceeds `max`. Negative latency never exceeds.
    pub fn latency_exceeds(&self, max: Duration) -> bool {
        match TimeDelta::from_std(max) {
            Ok(max) => self.latency() > max,
            Err(_) => false,
        }
    }
}

fn required_str<'a>(object: &'a Map<String, Value>, field: &str) -> Result<&'a str, PayloadError> {
    match object.get(field) {
        Some(Value::String(s)) => Ok(s),
        Some(other) => Err(PayloadError::InvalidJson {
            reason: format!("field {} must be a string, got {}", field, other),
        }),
        None => Err(PayloadError::MissingField {
            field: field.to_string(),
        }),
    }
}

/// Parse an ISO-8601 timestamp that carries an offset.
///
/// Accepts RFC 3339 as well as PostgreSQL's text rendering of `timestamptz`
/// (space separator, hour-only offset such as `+00`).
fn parse_timestamp(value: &str) -> Result<DateTime<FixedOffset>, PayloadError> {
    DateTime::parse_from_rfc3339(value)
        .or_else(|_| DateTime::parse_from_str(value, "%Y-%m-%d %H:%M:%S%.f%#z"))
        .or_else(|_| DateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S%.f%#z"))
        .map_err(|e| PayloadError::InvalidTimestamp {
            value: value.to_string(),
            reason: e.to_string(),
        })
}
