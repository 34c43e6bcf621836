//! Outbound notification seams.
//!
//! The detector reports UP/DOWN transitions through a [`Notifier`] and
//! service removals through a [`TopologySink`]. Transports (mail, chat,
//! topology service) live outside this crate.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::info;

use crate::error::NotifyError;
use crate::icmp::detector::ServiceRecord;

/// Subject of the notification sent when a service comes up.
pub const UP_SUBJECT: &str = "ICMP UP notification";

/// Subject of the notification sent when a service goes down.
pub const DOWN_SUBJECT: &str = "ICMP DOWN notification";

/// Receives human-readable transition notices.
#[async_trait::async_trait]
pub trait Notifier: Send + Sync + 'static {
    /// Deliver one notice. Best effort.
    async fn send_notification(&self, subject: &str, body: &str) -> Result<(), NotifyError>;
}

/// Kind of topology change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TopologyEventType {
    ServiceDelete,
}

/// Component that produced a topology event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum EventSource {
    Icmp,
}

/// A change to the set of monitored services.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TopologyEvent {
    pub event_type: TopologyEventType,
    pub source: EventSource,
    pub service_name: String,
    pub timestamp: DateTime<Utc>,
}

/// Receives topology events.
#[async_trait::async_trait]
pub trait TopologySink: Send + Sync + 'static {
    /// Deliver one event. Best effort.
    async fn send_event(&self, event: TopologyEvent) -> Result<(), NotifyError>;
}

/// Writes notifications and topology events to the tracing log.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotifier;

#[async_trait::async_trait]
impl Notifier for LogNotifier {
    async fn send_notification(&self, subject: &str, body: &str) -> Result<(), NotifyError> {
        info!(subject, body, "service notification");
        Ok(())
    }
}

#[async_trait::async_trait]
impl TopologySink for LogNotifier {
    async fn send_event(&self, event: TopologyEvent) -> Result<(), NotifyError> {
        info!(
            event_type = ?event.event_type,
            source = ?event.source,
            service = %event.service_name,
            timestamp = %event.timestamp,
            "topology event"
        );
        Ok(())
    }
}

/// Subject and body announcing that `record` came up at `at`.
pub(crate) fn up_message(record: &ServiceRecord, at: DateTime<Utc>) -> (&'static str, String) {
    (UP_SUBJECT, transition_body("UP", record, at))
}

/// Subject and body announcing that `record` went down at `at`.
pub(crate) fn down_message(record: &ServiceRecord, at: DateTime<Utc>) -> (&'static str, String) {
    (DOWN_SUBJECT, transition_body("DOWN", record, at))
}

fn transition_body(state: &str, record: &ServiceRecord, at: DateTime<Utc>) -> String {
    let detail = serde_json::to_string(record).unwrap_or_else(|e| format!("<{e}>"));
    format!(
        "Service: {} - {}\r\n{state} Time: {}\r\nDetail: {detail}\r\n",
        record.service_name,
        record.address,
        at.to_rfc3339(),
    )
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn record() -> ServiceRecord {
        ServiceRecord::new("10.0.0.7".parse().unwrap(), "db-primary".to_owned())
    }

    #[test]
    fn up_body_names_service_and_time() {
        let at = DateTime::from_timestamp(1_700_000_000, 0).unwrap();
        let (subject, body) = up_message(&record(), at);
        assert_eq!(subject, "ICMP UP notification");
        assert!(body.starts_with("Service: db-primary - 10.0.0.7\r\nUP Time: 2023-11-14T22:13:20+00:00\r\n"));
        assert!(body.contains("\"detectCount\":0"));
    }

    #[test]
    fn down_body_uses_down_label() {
        let at = DateTime::from_timestamp(0, 0).unwrap();
        let (subject, body) = down_message(&record(), at);
        assert_eq!(subject, "ICMP DOWN notification");
        assert!(body.contains("\r\nDOWN Time: "));
    }

    #[tokio::test]
    async fn log_notifier_accepts_everything() {
        let sink = LogNotifier;
        sink.send_notification("s", "b").await.unwrap();
        sink.send_event(TopologyEvent {
            event_type: TopologyEventType::ServiceDelete,
            source: EventSource::Icmp,
            service_name: "db".to_owned(),
            timestamp: Utc::now(),
        })
        .await
        .unwrap();
    }

    #[test]
    fn topology_event_serializes_camel_case() {
        let event = TopologyEvent {
            event_type: TopologyEventType::ServiceDelete,
            source: EventSource::Icmp,
            service_name: "db".to_owned(),
            timestamp: DateTime::from_timestamp(0, 0).unwrap(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["eventType"], "ServiceDelete");
        assert_eq!(json["serviceName"], "db");
    }
}
