//! Health, readiness and startup probes.

use axum::Router;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use serde_json::json;
use std::sync::atomic::Ordering;

use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/ready", get(ready))
        .route("/startup", get(startup))
}

async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({ "status": "ok", "instance_id": state.instance_id }))
}

async fn ready(State(state): State<AppState>) -> Json<serde_json::Value> {
    let queue_depth = state.stores.queue.pending_depth().await.unwrap_or(0);
    let (total, online, offline, capacity) = state.registry.counts();
    Json(json!({
        "ok": true,
        "queue_depth": queue_depth,
        "agents": {
            "total": total,
            "online": online,
            "offline": offline,
            "capacity": capacity,
        },
    }))
}

async fn startup(State(state): State<AppState>) -> Response {
    if state.started.load(Ordering::Acquire) {
        StatusCode::OK.into_response()
    } else {
        StatusCode::SERVICE_UNAVAILABLE.into_response()
    }
}
