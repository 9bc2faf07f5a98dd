//! Route definitions for the probe server.

use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};
use tracing::warn;

use super::receiver;
use super::state::AppState;
use crate::dispatch;

pub fn probe_routes() -> Router<AppState> {
    Router::new()
        .route(
            "/perf",
            post(receiver::receive).layer(DefaultBodyLimit::disable()),
        )
        .route("/dispatch", post(run_dispatch))
        .route("/health", get(health))
}

async fn health(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "data": {
            "status": "ok",
            "version": env!("CARGO_PKG_VERSION"),
            "peer_port": state.config.network.peer_port,
        },
        "meta": {
            "timestamp": chrono::Utc::now().to_rfc3339(),
        }
    }))
}

async fn run_dispatch(State(state): State<AppState>, body: Bytes) -> Response {
    match dispatch::handle_batch(state.selector.as_ref(), &state.shutdown, &body).await {
        Ok(json) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "application/json")],
            json,
        )
            .into_response(),
        Err(e) => {
            warn!(error = %e, "dispatch batch failed");
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
    }
}
