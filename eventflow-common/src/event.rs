//! Event model shared by the ingestion service and the worker pool.
//!
//! An [`EventSubmission`] is what producers POST: everything except `kind`
//! and `properties` may be omitted. [`EventSubmission::normalize`] fills the
//! gaps and yields an [`Event`], the canonical form that is written to the
//! raw audit table and published on the queue. The fingerprint assigned
//! during normalization never changes downstream; it doubles as the
//! correlation id for tracing.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Enumeration of the event kinds this pipeline accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Purchase,
    UserSignup,
    PageView,
    Custom,
}

impl EventKind {
    /// Stable label used for metrics and the `kind` column.
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Purchase => "purchase",
            EventKind::UserSignup => "user_signup",
            EventKind::PageView => "page_view",
            EventKind::Custom => "custom",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An event as submitted by a producer.
///
/// Deserialization rejects unrecognized kinds and mistyped fields, which is
/// the structural validation the ingestion contract requires before any
/// durable write.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventSubmission {
    pub kind: EventKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub occurred_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub properties: HashMap<String, Value>,
}

impl EventSubmission {
    /// Fill in the fingerprint and occurred-at defaults, consuming the
    /// submission. The fingerprint is the unit of idempotency: once assigned
    /// here it is carried unchanged through the queue and both event tables.
    pub fn normalize(self, now: DateTime<Utc>) -> Event {
        Event {
            fingerprint: self.fingerprint.unwrap_or_else(Uuid::new_v4),
            kind: self.kind,
            subject_id: self.subject_id,
            occurred_at: self.occurred_at.unwrap_or(now),
            properties: self.properties,
        }
    }
}

/// The canonical event: every field resolved, suitable for queue transport
/// and reconstruction from the raw audit payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub fingerprint: Uuid,
    pub kind: EventKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject_id: Option<String>,
    pub occurred_at: DateTime<Utc>,
    #[serde(default)]
    pub properties: HashMap<String, Value>,
}

impl Event {
    /// The correlation id attached to every log record emitted for this
    /// event is the fingerprint itself.
    pub fn correlation_id(&self) -> Uuid {
        self.fingerprint
    }
}

/// Derived fields computed by a worker before the processed insert.
/// Enrichment is pure over event + config; it never performs I/O.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Enrichment {
    pub worker_id: String,
    pub processed_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_start: Option<DateTime<Utc>>,
}

/// Terminal status stored on successful processed rows.
pub const STATUS_COMPLETED: &str = "completed";

/// Row to be inserted into `processed_events` by a worker on success.
#[derive(Debug, Clone, PartialEq)]
pub struct NewProcessedRecord {
    pub fingerprint: Uuid,
    pub kind: EventKind,
    pub subject_id: Option<String>,
    pub occurred_at: DateTime<Utc>,
    pub properties: HashMap<String, Value>,
    pub processed_at: DateTime<Utc>,
    pub status: String,
    pub enrichment: Enrichment,
    pub retry_count: i32,
}

/// Row to be appended to `failed_events` when an event is permanently
/// rejected. Not unique on fingerprint: a repeat attempt may fail again.
#[derive(Debug, Clone, PartialEq)]
pub struct NewFailedRecord {
    pub fingerprint: Uuid,
    pub payload: Value,
    pub error_message: String,
    pub failed_at: DateTime<Utc>,
    pub retry_count: i32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn submission_rejects_unknown_kind() {
        let result = serde_json::from_value::<EventSubmission>(json!({
            "kind": "telemetry",
            "properties": {}
        }));
        assert!(result.is_err());
    }

    #[test]
    fn submission_rejects_malformed_fingerprint() {
        let result = serde_json::from_value::<EventSubmission>(json!({
            "kind": "purchase",
            "fingerprint": "not-a-uuid",
            "properties": {"amount": 10.0}
        }));
        assert!(result.is_err());
    }

    #[test]
    fn normalize_assigns_missing_fingerprint_and_timestamp() {
        let submission = serde_json::from_value::<EventSubmission>(json!({
            "kind": "page_view",
            "properties": {"page": "/"}
        }))
        .unwrap();

        let now = Utc::now();
        let event = submission.normalize(now);

        assert!(!event.fingerprint.is_nil());
        assert_eq!(event.occurred_at, now);
        assert_eq!(event.kind, EventKind::PageView);
    }

    #[test]
    fn normalize_preserves_supplied_identity() {
        let fingerprint = Uuid::new_v4();
        let occurred_at = "2024-01-10T12:00:00Z".parse::<DateTime<Utc>>().unwrap();
        let submission = serde_json::from_value::<EventSubmission>(json!({
            "kind": "purchase",
            "fingerprint": fingerprint,
            "subject_id": "u1",
            "occurred_at": occurred_at,
            "properties": {"amount": 99.99}
        }))
        .unwrap();

        let event = submission.normalize(Utc::now());
        assert_eq!(event.fingerprint, fingerprint);
        assert_eq!(event.occurred_at, occurred_at);
        assert_eq!(event.subject_id.as_deref(), Some("u1"));
    }

    #[test]
    fn event_round_trips_through_queue_payload() {
        let event = Event {
            fingerprint: Uuid::new_v4(),
            kind: EventKind::Custom,
            subject_id: None,
            occurred_at: Utc::now(),
            properties: HashMap::from([(String::from("nested"), json!({"deep": [1, 2]}))]),
        };

        let payload = serde_json::to_string(&event).unwrap();
        let decoded: Event = serde_json::from_str(&payload).unwrap();
        assert_eq!(decoded, event);
    }

    #[test]
    fn enrichment_omits_absent_tag() {
        let enrichment = Enrichment {
            worker_id: "worker-1".to_string(),
            processed_at: Utc::now(),
            tag: None,
            session_start: None,
        };

        let value = serde_json::to_value(&enrichment).unwrap();
        assert!(value.get("tag").is_none());
        assert!(value.get("session_start").is_none());
        assert_eq!(value["worker_id"], json!("worker-1"));
    }
}
