//! API layer -- axum routes for the probe server.

pub mod receiver;
mod routes;
pub mod state;

use self::state::AppState;
use axum::Router;
use tower_http::trace::TraceLayer;

/// Build the probe server router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .merge(routes::probe_routes())
        .fallback(fallback)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn fallback() -> (axum::http::StatusCode, &'static str) {
    (axum::http::StatusCode::NOT_FOUND, "not found")
}
