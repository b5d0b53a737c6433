use std::sync::Arc;

use axum::{extract::Extension, http::StatusCode, response::IntoResponse, Json};

use crate::app::{errors, services::AppServices};

pub async fn health() -> StatusCode {
    StatusCode::OK
}

/// GET /metrics
///
/// Event counts per status plus analytics buffer counters.
pub async fn metrics(Extension(services): Extension<Arc<AppServices>>) -> axum::response::Response {
    match services.metrics().await {
        Ok(metrics) => (StatusCode::OK, Json(metrics)).into_response(),
        Err(e) => errors::store_error_to_response(e),
    }
}
