//! Alerts published by the reconciliation engine.
//!
//! The engine only knows that alerts can be handed to an [`AlertSink`];
//! delivery (SMTP, webhooks, ...) belongs to the sink implementation.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

/// Category of an alert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AlertTopic {
    Resize,
    ServiceState,
    MembershipStatus,
    PoolFetch,
}

impl std::fmt::Display for AlertTopic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            AlertTopic::Resize => "RESIZE",
            AlertTopic::ServiceState => "SERVICE_STATE",
            AlertTopic::MembershipStatus => "MEMBERSHIP_STATUS",
            AlertTopic::PoolFetch => "POOL_FETCH",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AlertSeverity {
    Debug,
    Info,
    Notice,
    Warn,
    Error,
}

/// A single alert message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Alert {
    pub topic: AlertTopic,
    pub severity: AlertSeverity,
    pub timestamp: DateTime<Utc>,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
    #[serde(default)]
    pub tags: BTreeMap<String, serde_json::Value>,
}

impl Alert {
    pub fn new(
        topic: AlertTopic,
        severity: AlertSeverity,
        timestamp: DateTime<Utc>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            topic,
            severity,
            timestamp,
            message: message.into(),
            details: None,
            tags: BTreeMap::new(),
        }
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    pub fn with_tag(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.tags.insert(key.into(), value);
        self
    }
}

/// Destination for alerts.
pub trait AlertSink: Send + Sync {
    fn publish(&self, alert: Alert);
}

/// Alert sink that records every alert in memory.
pub struct MemoryAlertSink {
    alerts: RwLock<Vec<Alert>>,
}

impl MemoryAlertSink {
    pub fn new() -> Self {
        Self {
            alerts: RwLock::new(Vec::new()),
        }
    }

    /// All alerts published so far, oldest first.
    pub fn alerts(&self) -> Vec<Alert> {
        self.alerts.read().clone()
    }

    pub fn alerts_for(&self, topic: AlertTopic) -> Vec<Alert> {
        self.alerts
            .read()
            .iter()
            .filter(|a| a.topic == topic)
            .cloned()
            .collect()
    }

    pub fn clear(&self) {
        self.alerts.write().clear();
    }
}

impl Default for MemoryAlertSink {
    fn default() -> Self {
        Self::new()
    }
}

impl AlertSink for MemoryAlertSink {
    fn publish(&self, alert: Alert) {
        self.alerts.write().push(alert);
    }
}

/// Alert sink that writes alerts to the tracing subscriber.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogAlertSink;

impl AlertSink for LogAlertSink {
    fn publish(&self, alert: Alert) {
        let tags = serde_json::to_string(&alert.tags).unwrap_or_default();
        let details = alert.details.as_deref().unwrap_or("");
        match alert.severity {
            AlertSeverity::Debug => {
                debug!(topic = %alert.topic, %tags, details, "{}", alert.message)
            }
            AlertSeverity::Info | AlertSeverity::Notice => {
                info!(topic = %alert.topic, %tags, details, "{}", alert.message)
            }
            AlertSeverity::Warn => {
                warn!(topic = %alert.topic, %tags, details, "{}", alert.message)
            }
            AlertSeverity::Error => {
                error!(topic = %alert.topic, %tags, details, "{}", alert.message)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_sink_filters_by_topic() {
        let sink = MemoryAlertSink::new();
        let now = Utc::now();
        sink.publish(Alert::new(AlertTopic::Resize, AlertSeverity::Info, now, "a"));
        sink.publish(Alert::new(AlertTopic::PoolFetch, AlertSeverity::Warn, now, "b"));
        sink.publish(Alert::new(AlertTopic::Resize, AlertSeverity::Info, now, "c"));

        assert_eq!(sink.alerts().len(), 3);
        let resize = sink.alerts_for(AlertTopic::Resize);
        assert_eq!(resize.len(), 2);
        assert_eq!(resize[1].message, "c");

        sink.clear();
        assert!(sink.alerts().is_empty());
    }

    #[test]
    fn alert_serializes_topic_and_tags() {
        let alert = Alert::new(
            AlertTopic::MembershipStatus,
            AlertSeverity::Notice,
            Utc::now(),
            "membership changed",
        )
        .with_tag("machineId", serde_json::json!("i-1"));

        let json = serde_json::to_value(&alert).unwrap();
        assert_eq!(json["topic"], "MEMBERSHIP_STATUS");
        assert_eq!(json["severity"], "NOTICE");
        assert_eq!(json["tags"]["machineId"], "i-1");
        assert!(json.get("details").is_none());
    }

    #[test]
    fn severity_ordering() {
        assert!(AlertSeverity::Error > AlertSeverity::Warn);
        assert!(AlertSeverity::Info < AlertSeverity::Notice);
    }
}
