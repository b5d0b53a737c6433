//! Event ingestion, inspection, replay and requeue endpoints.

use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, Extension, Path, Query},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};

use crate::app::dto::{self, CreateEventRequest, EventListQuery};
use crate::app::{errors, services::AppServices};

pub fn router() -> Router {
    Router::new()
        .route("/", post(create_event).get(list_events))
        .route("/:id", get(get_event))
        .route("/:id/replay", post(replay_event))
        .route("/:id/requeue", post(requeue_event))
}

/// POST /events
///
/// Body: `{"event_type": "...", "payload": {...}, "metadata": {...}?}`
pub async fn create_event(
    Extension(services): Extension<Arc<AppServices>>,
    body: Result<Json<CreateEventRequest>, JsonRejection>,
) -> axum::response::Response {
    let Json(req) = match body {
        Ok(body) => body,
        Err(rejection) => {
            return errors::json_error(StatusCode::BAD_REQUEST, "invalid_body", rejection.body_text());
        }
    };

    match services.ingest(req.into()).await {
        Ok(event) => (StatusCode::CREATED, Json(event)).into_response(),
        Err(e) => errors::ingest_error_to_response(e),
    }
}

/// GET /events?status=FAILED&event_type=X&limit=50&offset=0
///
/// Newest first. `limit` defaults to 50 and is capped at 500.
pub async fn list_events(
    Extension(services): Extension<Arc<AppServices>>,
    Query(query): Query<EventListQuery>,
) -> axum::response::Response {
    let (filter, pagination) = match query.into_parts() {
        Ok(parts) => parts,
        Err(resp) => return resp,
    };

    match services.list_events(filter, pagination).await {
        Ok(page) => (StatusCode::OK, Json(page)).into_response(),
        Err(e) => errors::store_error_to_response(e),
    }
}

/// GET /events/:id
pub async fn get_event(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let id = match dto::parse_event_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };

    match services.get_event(id).await {
        Ok(Some(event)) => (StatusCode::OK, Json(event)).into_response(),
        Ok(None) => errors::json_error(
            StatusCode::NOT_FOUND,
            "not_found",
            format!("event not found: {id}"),
        ),
        Err(e) => errors::store_error_to_response(e),
    }
}

/// POST /events/:id/replay
///
/// Resets a FAILED or DEAD_LETTER event to PENDING and enqueues it again.
pub async fn replay_event(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let id = match dto::parse_event_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };

    match services.replay(id).await {
        Ok(event) => (StatusCode::OK, Json(event)).into_response(),
        Err(e) => errors::replay_error_to_response(e),
    }
}

/// POST /events/:id/requeue
///
/// Re-publishes a PENDING event whose original publish failed. 409 unless PENDING.
pub async fn requeue_event(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let id = match dto::parse_event_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };

    match services.requeue(id).await {
        Ok(event) => (StatusCode::OK, Json(event)).into_response(),
        Err(e) => errors::replay_error_to_response(e),
    }
}
