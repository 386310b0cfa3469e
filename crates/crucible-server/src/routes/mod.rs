//! HTTP routing.
//!
//! The agent protocol paths authenticate with the shared bearer token; the
//! operator surface is expected to sit behind the host's own auth layer.

pub mod agents;
pub mod approvals;
pub mod builds;
pub mod health;
pub mod jobs;

use axum::Router;
use axum::extract::{Request, State};
use axum::http::header::AUTHORIZATION;
use axum::middleware::{Next, from_fn_with_state};
use axum::response::Response;
use axum::routing::{get, post};

use crate::error::ApiError;
use crate::state::AppState;
use crucible_core::Error;

pub fn router(state: AppState) -> Router {
    // Agent-authenticated write paths; everything else is operator surface.
    let agent_routes = Router::new()
        .route("/api/agents/register", post(agents::register))
        .route("/api/agents/{id}/heartbeat", post(agents::heartbeat))
        .route("/api/builds/{id}/agent-events", post(builds::agent_events))
        .route("/api/builds/{id}/result", post(builds::agent_result))
        .route("/api/builds/{id}/artifacts", post(builds::agent_artifacts))
        .layer(from_fn_with_state(state.clone(), agent_auth));

    let operator_routes = Router::new()
        .route("/api/jobs", post(jobs::create))
        .route("/api/jobs/{id}/trigger", post(jobs::trigger))
        .route("/api/builds/{id}", get(builds::get))
        .route("/api/builds/{id}/cancel", post(builds::cancel))
        .route("/api/builds/{id}/retry", post(builds::retry))
        .route("/api/builds/{id}/events", get(builds::events))
        .route("/api/approvals/{id}/approve", post(approvals::approve))
        .route("/api/approvals/{id}/reject", post(approvals::reject));

    Router::new()
        .merge(health::router())
        .merge(agent_routes)
        .merge(operator_routes)
        .with_state(state)
}

/// Shared bearer token check for agent→master calls.
async fn agent_auth(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let presented = request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "));
    match presented {
        Some(token) if !state.config.agent_token.is_empty() && token == state.config.agent_token => {
            Ok(next.run(request).await)
        }
        _ => Err(ApiError(Error::AgentAuthFailed("invalid bearer token".into()))),
    }
}
