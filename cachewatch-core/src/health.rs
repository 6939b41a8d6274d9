//! Health reporting for notification connections.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Health of an upstream notification connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// Connection is bound and delivering notifications
    Healthy,
    /// Connection was never bound, or the upstream terminated
    Unhealthy,
}

/// Health report for one component (typically an event queue).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthCheck {
    pub status: HealthStatus,
    pub component: String,
    pub message: Option<String>,
    pub metadata: HashMap<String, serde_json::Value>,
}

impl HealthCheck {
    pub fn healthy(component: impl Into<String>) -> Self {
        Self {
            status: HealthStatus::Healthy,
            component: component.into(),
            message: None,
            metadata: HashMap::new(),
        }
    }

    pub fn unhealthy(component: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            status: HealthStatus::Unhealthy,
            component: component.into(),
            message: Some(message.into()),
            metadata: HashMap::new(),
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.status == HealthStatus::Healthy
    }

    /// Add metadata.
    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}
