pub mod health;
pub mod realtime;

use axum::Router;

use crate::state::AppState;

/// Build the gateway router.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .merge(health::router())
        .merge(realtime::router())
        .with_state(state)
}
