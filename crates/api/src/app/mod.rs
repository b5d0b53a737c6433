//! HTTP API application wiring (Axum router + service wiring).
//!
//! - `services.rs`: infrastructure wiring (event store, channel, buffer, coordinator)
//! - `routes/`: HTTP routes + handlers
//! - `dto.rs`: request DTOs and parsing helpers
//! - `errors.rs`: consistent error responses

use std::sync::Arc;

use axum::{Extension, Router};
use tower::ServiceBuilder;

pub mod dto;
pub mod errors;
pub mod routes;
pub mod services;

/// Build the full HTTP router over already-wired services.
pub fn build_app(services: Arc<services::AppServices>) -> Router {
    routes::router().layer(ServiceBuilder::new().layer(Extension(services)))
}
