//! Health check and Prometheus scrape endpoints.

use axum::extract::State;
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde_json::json;

use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/health", get(health_check))
        .route("/metrics", get(prometheus_scrape))
}

async fn health_check(State(state): State<AppState>) -> Json<serde_json::Value> {
    let gateway = &state.gateway;
    Json(json!({
        "status": "ok",
        "service": "herald-gateway",
        "version": env!("CARGO_PKG_VERSION"),
        "instanceId": gateway.instance_id(),
        "fanout": gateway.mode().as_str(),
        "connections": gateway.rooms().connection_count()
    }))
}

async fn prometheus_scrape(State(state): State<AppState>) -> Response {
    match &state.metrics {
        Some(handle) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            handle.render(),
        )
            .into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}
