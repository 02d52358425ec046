//! HTTP routing.

mod health;

pub use health::{ComponentHealth, ComponentStatus, HealthResponse};

use axum::Router;

use crate::state::AppState;

/// Create the router with all routes.
pub fn create_router(state: AppState) -> Router {
    Router::new().merge(health::routes()).with_state(state)
}
