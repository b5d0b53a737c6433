use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde_json::json;

use courier_infra::delivery::ReplayError;
use courier_infra::event_store::EventStoreError;
use courier_infra::ingest::IngestError;

pub fn ingest_error_to_response(err: IngestError) -> axum::response::Response {
    match err {
        IngestError::Validation(e) => {
            json_error(StatusCode::BAD_REQUEST, "validation_error", e.to_string())
        }
        IngestError::Store(e) => store_error_to_response(e),
        e @ IngestError::Publish { .. } => {
            json_error(StatusCode::BAD_GATEWAY, "publish_error", e.to_string())
        }
    }
}

pub fn replay_error_to_response(err: ReplayError) -> axum::response::Response {
    match err {
        e @ ReplayError::NotFound(_) => json_error(StatusCode::NOT_FOUND, "not_found", e.to_string()),
        e @ ReplayError::AlreadyProcessed(_) => {
            json_error(StatusCode::CONFLICT, "already_processed", e.to_string())
        }
        e @ ReplayError::NotReplayable { .. } => {
            json_error(StatusCode::CONFLICT, "not_replayable", e.to_string())
        }
        e @ ReplayError::NotPending { .. } => {
            json_error(StatusCode::CONFLICT, "not_pending", e.to_string())
        }
        e @ ReplayError::Conflict { .. } => json_error(StatusCode::CONFLICT, "conflict", e.to_string()),
        ReplayError::Store(e) => store_error_to_response(e),
        e @ ReplayError::Publish { .. } => {
            json_error(StatusCode::BAD_GATEWAY, "publish_error", e.to_string())
        }
    }
}

pub fn store_error_to_response(err: EventStoreError) -> axum::response::Response {
    match err {
        EventStoreError::NotFound(id) => {
            json_error(StatusCode::NOT_FOUND, "not_found", format!("event not found: {id}"))
        }
        e @ (EventStoreError::Duplicate(_) | EventStoreError::Conflict { .. }) => {
            json_error(StatusCode::CONFLICT, "conflict", e.to_string())
        }
        e @ EventStoreError::Storage(_) => {
            tracing::error!(error = %e, "event store failure");
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "store_error", e.to_string())
        }
    }
}

pub fn json_error(
    status: StatusCode,
    code: &'static str,
    message: impl Into<String>,
) -> axum::response::Response {
    (
        status,
        axum::Json(json!({
            "error": code,
            "message": message.into(),
        })),
    )
        .into_response()
}
