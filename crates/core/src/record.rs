//! Flattened, immutable snapshot of an event as shipped to the analytics warehouse.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::event::Event;
use crate::id::EventId;
use crate::value_object::ValueObject;

/// One row of the analytics load.
///
/// Payload and metadata are carried as JSON text so the row schema stays flat.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BufferedRecord {
    id: EventId,
    event_type: String,
    payload: String,
    metadata: Option<String>,
    status: String,
    retry_count: u32,
    created_at: DateTime<Utc>,
    processed_at: Option<DateTime<Utc>>,
    failed_at: Option<DateTime<Utc>>,
    failure_reason: Option<String>,
}

impl BufferedRecord {
    /// Capture the event as it is right now. Later status changes do not flow in.
    pub fn snapshot(event: &Event) -> Self {
        Self {
            id: event.id,
            event_type: event.event_type.to_string(),
            payload: event.payload.to_string(),
            metadata: event
                .metadata
                .as_ref()
                .and_then(|m| serde_json::to_string(m).ok()),
            status: event.status.to_string(),
            retry_count: event.retry_count,
            created_at: event.created_at,
            processed_at: event.processed_at,
            failed_at: event.failed_at,
            failure_reason: event.failure_reason.clone(),
        }
    }

    pub fn id(&self) -> EventId {
        self.id
    }

    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    pub fn status(&self) -> &str {
        &self.status
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }
}

impl ValueObject for BufferedRecord {}

impl From<&Event> for BufferedRecord {
    fn from(event: &Event) -> Self {
        Self::snapshot(event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{EventMetadata, NewEvent};
    use serde_json::json;

    #[test]
    fn snapshot_flattens_payload_and_metadata() {
        let mut event = Event::create(NewEvent {
            event_type: "page.viewed".to_string(),
            payload: json!({"path": "/"}),
            metadata: Some(EventMetadata {
                source: Some("web".to_string()),
                ..Default::default()
            }),
        })
        .unwrap();

        let record = BufferedRecord::snapshot(&event);
        event.begin_processing().unwrap();

        assert_eq!(record.id(), event.id);
        assert_eq!(record.status(), "PENDING");
        assert_eq!(record.event_type(), "page.viewed");

        let row = serde_json::to_value(&record).unwrap();
        assert_eq!(row["payload"], json!("{\"path\":\"/\"}"));
        assert_eq!(row["metadata"], json!("{\"source\":\"web\"}"));
        assert_eq!(row["retry_count"], json!(0));
    }
}
