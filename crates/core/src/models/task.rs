use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// An identifiable unit of work.
///
/// Created by a producer (application code or the scheduler loop),
/// owned by the transport while in flight and by a worker during
/// execution. Handlers must be idempotent or deduplicate by `id`
/// because delivery is at-least-once.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Task {
    pub id: String,
    /// Name of the registered handler that executes this task.
    pub handler: String,
    /// Schema-less argument payload, round-tripped through the wire as is.
    pub payload: serde_json::Value,
    /// Earliest point in time this task may execute.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub not_before: Option<DateTime<Utc>>,
    /// Recurrence label when the task was produced by a schedule entry.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule_label: Option<String>,
    /// Failed handler attempts so far. Rides in the record so broker
    /// redeliveries and delay requeues do not distort it.
    pub retry_count: u32,
    pub created_at: DateTime<Utc>,
}

impl Task {
    pub fn new(handler: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            handler: handler.into(),
            payload,
            not_before: None,
            schedule_label: None,
            retry_count: 0,
            created_at: Utc::now(),
        }
    }

    pub fn delayed(
        handler: impl Into<String>,
        payload: serde_json::Value,
        not_before: DateTime<Utc>,
    ) -> Self {
        let mut task = Self::new(handler, payload);
        task.not_before = Some(not_before);
        task
    }

    pub fn with_schedule_label(mut self, label: impl Into<String>) -> Self {
        self.schedule_label = Some(label.into());
        self
    }

    /// Whether the task may run at `now`, honoring `not_before`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        match self.not_before {
            Some(not_before) => now >= not_before,
            None => true,
        }
    }

    pub fn increment_retry(&mut self) {
        self.retry_count += 1;
    }

    pub fn serialize_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn deserialize_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use serde_json::json;

    #[test]
    fn test_task_creation() {
        let task = Task::new("send_digest", json!({"user_id": 42}));

        assert!(!task.id.is_empty());
        assert_eq!(task.handler, "send_digest");
        assert_eq!(task.retry_count, 0);
        assert!(task.not_before.is_none());
        assert!(task.is_due(Utc::now()));
    }

    #[test]
    fn test_delayed_task_not_due_until_not_before() {
        let now = Utc::now();
        let task = Task::delayed("send_digest", json!({}), now + Duration::seconds(30));

        assert!(!task.is_due(now));
        assert!(!task.is_due(now + Duration::seconds(29)));
        assert!(task.is_due(now + Duration::seconds(30)));
        assert!(task.is_due(now + Duration::seconds(31)));
    }

    #[test]
    fn test_payload_round_trips_without_loss() {
        let task = Task::delayed(
            "send_digest",
            json!({"user_id": 42, "locale": "en", "nested": {"a": [1, 2, 3]}}),
            Utc::now() + Duration::minutes(5),
        )
        .with_schedule_label("digest-hourly");

        let bytes = task.serialize_bytes().expect("serialize");
        let restored = Task::deserialize_bytes(&bytes).expect("deserialize");

        assert_eq!(task, restored);
    }

    #[test]
    fn test_retry_counter() {
        let mut task = Task::new("noop", json!({}));
        task.increment_retry();
        task.increment_retry();
        assert_eq!(task.retry_count, 2);
    }
}
