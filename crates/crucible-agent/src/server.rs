//! The agent's inbound HTTP surface.
//!
//! `POST /builds` accepts a dispatch, answers 202, and runs the executor in
//! the background; `GET /health` reports liveness and the active build
//! count.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use axum::Json;
use axum::Router;
use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::http::header::AUTHORIZATION;
use axum::middleware::{Next, from_fn_with_state};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::{Semaphore, watch};
use tracing::{error, info};

use crucible_core::build::{Build, BuildStatus, TriggerType};
use crucible_core::job::Job;
use crucible_core::pipeline::Pipeline;
use crucible_core::store::Stores;
use crucible_core::ResourceId;
use crucible_executor::Executor;

use crate::client::MasterClient;

#[derive(Clone)]
pub struct AgentState {
    pub executor: Arc<Executor>,
    pub stores: Stores,
    pub client: Arc<MasterClient>,
    pub pool: Arc<Semaphore>,
    pub active: Arc<AtomicU32>,
    pub token: String,
}

pub fn router(state: AgentState) -> Router {
    Router::new()
        .route("/builds", post(accept_build))
        .layer(from_fn_with_state(state.clone(), bearer_auth))
        .route("/health", get(health))
        .with_state(state)
}

async fn bearer_auth(
    State(state): State<AgentState>,
    request: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    let presented = request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "));
    match presented {
        Some(token) if !state.token.is_empty() && token == state.token => {
            Ok(next.run(request).await)
        }
        _ => Err(StatusCode::UNAUTHORIZED),
    }
}

async fn health(State(state): State<AgentState>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "active_builds": state.active.load(Ordering::Relaxed),
    }))
}

#[derive(Debug, Deserialize)]
pub struct DispatchBody {
    pub build_id: ResourceId,
    pub job_id: ResourceId,
    pub org_id: ResourceId,
    pub pipeline_value: Option<Pipeline>,
    #[serde(default)]
    pub parameters: HashMap<String, String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
}

async fn accept_build(
    State(state): State<AgentState>,
    Json(body): Json<DispatchBody>,
) -> Response {
    info!(build_id = %body.build_id, "dispatch accepted");
    tokio::spawn(run_dispatched(state.clone(), body));
    (StatusCode::ACCEPTED, Json(json!({ "ok": true }))).into_response()
}

async fn run_dispatched(state: AgentState, body: DispatchBody) {
    let permit = match state.pool.clone().acquire_owned().await {
        Ok(permit) => permit,
        Err(_) => return,
    };
    state.active.fetch_add(1, Ordering::Relaxed);

    // Materialize the dispatched job and build in the agent-local stores so
    // the executor has records to drive.
    let mut job = Job::new(body.org_id, format!("dispatched-{}", body.job_id));
    job.id = body.job_id;
    job.pipeline_value = body.pipeline_value;
    if let Err(e) = state.stores.jobs.create(&job).await {
        // Re-dispatch of a known job is fine.
        tracing::debug!(job_id = %job.id, error = %e, "job already materialized");
    }
    let mut build = Build::new(body.job_id, body.org_id, TriggerType::Api, body.parameters);
    build.id = body.build_id;
    build.root_build_id = body.build_id;
    let build = match state.stores.builds.create(&build).await {
        Ok(build) => build,
        Err(e) => {
            error!(build_id = %body.build_id, error = %e, "could not materialize build");
            state.active.fetch_sub(1, Ordering::Relaxed);
            return;
        }
    };

    let (_cancel_tx, cancel_rx) = watch::channel(false);
    let result = state.executor.execute(build.clone(), cancel_rx).await;
    let (status, error) = match &result {
        Ok(status) => (*status, None),
        Err(e) => (BuildStatus::Failure, Some(format!("{}: {e}", e.kind()))),
    };

    // Stage/step outcomes live in the agent-local stores; ship them home so
    // the master's audit trail covers remote builds too.
    let stages = state
        .stores
        .stages
        .list_for_build(build.id)
        .await
        .unwrap_or_else(|e| {
            error!(build_id = %build.id, error = %e, "stage record listing failed");
            Vec::new()
        });
    let steps = state
        .stores
        .steps
        .list_for_build(build.id)
        .await
        .unwrap_or_else(|e| {
            error!(build_id = %build.id, error = %e, "step record listing failed");
            Vec::new()
        });

    if let Err(e) = state
        .client
        .post_result(build.id, status, error.as_deref(), &stages, &steps)
        .await
    {
        error!(build_id = %build.id, error = %e, "result upload failed");
    }

    // Ship collected artifacts home.
    match state.stores.artifacts.list_for_build(build.id).await {
        Ok(artifacts) => {
            let files: Vec<(String, std::path::PathBuf)> = artifacts
                .into_iter()
                .map(|a| (a.filename, std::path::PathBuf::from(a.path)))
                .collect();
            if let Err(e) = state.client.upload_artifacts(build.id, &files).await {
                error!(build_id = %build.id, error = %e, "artifact upload failed");
            }
        }
        Err(e) => error!(build_id = %build.id, error = %e, "artifact listing failed"),
    }

    state.active.fetch_sub(1, Ordering::Relaxed);
    drop(permit);
    info!(build_id = %build.id, status = status.as_str(), "dispatched build finished");
}
