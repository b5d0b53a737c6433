use serde::Deserialize;
use serde_json::Value as JsonValue;

use axum::http::StatusCode;

use courier_core::{EventId, EventMetadata, EventStatus, NewEvent};
use courier_infra::event_store::{EventFilter, Pagination};

use crate::app::errors;

// -------------------------
// Request DTOs
// -------------------------

#[derive(Debug, Deserialize)]
pub struct CreateEventRequest {
    pub event_type: String,
    pub payload: JsonValue,
    #[serde(default)]
    pub metadata: Option<EventMetadata>,
}

impl From<CreateEventRequest> for NewEvent {
    fn from(req: CreateEventRequest) -> Self {
        NewEvent {
            event_type: req.event_type,
            payload: req.payload,
            metadata: req.metadata,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct EventListQuery {
    pub status: Option<String>,
    pub event_type: Option<String>,
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}

impl EventListQuery {
    pub fn into_parts(self) -> Result<(EventFilter, Pagination), axum::response::Response> {
        let status = self
            .status
            .as_deref()
            .filter(|s| !s.is_empty())
            .map(parse_status)
            .transpose()?;

        let filter = EventFilter {
            status,
            event_type: self.event_type.filter(|t| !t.is_empty()),
        };
        Ok((filter, Pagination::new(self.limit, self.offset)))
    }
}

// -------------------------
// Parsing helpers
// -------------------------

pub fn parse_event_id(s: &str) -> Result<EventId, axum::response::Response> {
    s.parse::<EventId>()
        .map_err(|_| errors::json_error(StatusCode::BAD_REQUEST, "invalid_id", "id must be a UUID"))
}

pub fn parse_status(s: &str) -> Result<EventStatus, axum::response::Response> {
    s.parse::<EventStatus>().map_err(|_| {
        errors::json_error(
            StatusCode::BAD_REQUEST,
            "invalid_status",
            "status must be one of: PENDING, PROCESSING, PROCESSED, FAILED, DEAD_LETTER",
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_query_means_no_filter() {
        let Ok((filter, pagination)) = EventListQuery::default().into_parts() else {
            panic!("empty query should parse");
        };
        assert_eq!(filter, EventFilter::default());
        assert_eq!(pagination, Pagination::default());
    }

    #[test]
    fn status_filter_is_case_insensitive() {
        let query = EventListQuery {
            status: Some("dead_letter".to_string()),
            ..Default::default()
        };
        let Ok((filter, _)) = query.into_parts() else {
            panic!("lowercase status should parse");
        };
        assert_eq!(filter.status, Some(EventStatus::DeadLetter));
    }

    #[test]
    fn bad_inputs_are_rejected() {
        let query = EventListQuery {
            status: Some("DONE".to_string()),
            ..Default::default()
        };
        assert_eq!(
            query.into_parts().unwrap_err().status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            parse_event_id("not-a-uuid").unwrap_err().status(),
            StatusCode::BAD_REQUEST
        );
    }
}
