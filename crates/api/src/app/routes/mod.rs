use axum::{routing::get, Router};

pub mod events;
pub mod system;

/// Router for all API endpoints.
pub fn router() -> Router {
    Router::new()
        .route("/health", get(system::health))
        .route("/metrics", get(system::metrics))
        .nest("/events", events::router())
}
