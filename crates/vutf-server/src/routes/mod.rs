//! API route modules.

pub mod executions;
pub mod health;
pub mod orchestrators;

use axum::{http::StatusCode, middleware, routing::get, Router};
use std::sync::Arc;

use crate::middleware::identity_middleware;
use crate::state::AppState;

/// Create the main router with all routes
pub fn create_router(state: Arc<AppState>) -> Router {
    // Public routes (no identity)
    let public_routes = Router::new().route("/health", get(health::health_check));

    let protected_routes = Router::new()
        .merge(orchestrators::router())
        .merge(executions::router())
        .layer(middleware::from_fn(identity_middleware));

    Router::new()
        .merge(public_routes)
        .nest("/api", protected_routes)
        .with_state(state)
}

/// Map a core error onto an HTTP status
pub fn status_for(err: &vutf_core::Error) -> StatusCode {
    use vutf_core::Error;

    match err {
        e if e.is_not_found() => StatusCode::NOT_FOUND,
        e if e.is_configuration() => StatusCode::BAD_REQUEST,
        e if e.is_store_busy() => StatusCode::SERVICE_UNAVAILABLE,
        Error::InvalidTransition { .. } => StatusCode::CONFLICT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

pub fn api_error(err: vutf_core::Error) -> (StatusCode, String) {
    (status_for(&err), err.to_string())
}

/// Resources owned by someone else look exactly like missing ones
pub fn not_found(entity: &str) -> (StatusCode, String) {
    (StatusCode::NOT_FOUND, format!("{entity} not found"))
}
