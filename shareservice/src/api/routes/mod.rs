//! API route modules.

pub mod health;
pub mod share;

use axum::Router;

use crate::api::server::AppState;

/// Create the main router with all routes.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .merge(share::router())
        .nest("/health", health::router())
        .with_state(state)
}
