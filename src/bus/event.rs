//! Events carried by the bus.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// A job finished successfully.
pub const TASK_COMPLETED: &str = "task.completed";
/// A job failed terminally.
pub const TASK_FAILED: &str = "task.failed";
pub const FILE_PROCESSED: &str = "file.processed";
pub const REQUEST_COMPLETED: &str = "request.completed";
pub const ERROR: &str = "error";

/// Subscribing to this type receives every event.
pub const ANY: &str = "*";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: Uuid,
    pub event_type: String,
    pub timestamp: DateTime<Utc>,
    pub source: String,
    pub data: Value,
}

impl Event {
    pub fn new(event_type: impl Into<String>, source: impl Into<String>, data: Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            event_type: event_type.into(),
            timestamp: Utc::now(),
            source: source.into(),
            data,
        }
    }

    #[must_use]
    pub fn matches(&self, subscribed_type: &str) -> bool {
        subscribed_type == ANY || subscribed_type == self.event_type
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_new_event_has_unique_id() {
        let a = Event::new(TASK_COMPLETED, "queue", json!({}));
        let b = Event::new(TASK_COMPLETED, "queue", json!({}));
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn test_wildcard_matches_everything() {
        let event = Event::new(FILE_PROCESSED, "aio", json!({ "path": "a.txt" }));
        assert!(event.matches(ANY));
        assert!(event.matches(FILE_PROCESSED));
        assert!(!event.matches(TASK_FAILED));
    }

    #[test]
    fn test_serializes_to_json() {
        let event = Event::new(ERROR, "test", json!({ "message": "boom" }));
        let encoded = serde_json::to_string(&event).unwrap();
        let decoded: Event = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, event);
    }
}
