//! Agent registration and heartbeats.

use axum::Json;
use axum::extract::{Path, State};
use serde::Deserialize;
use serde_json::json;
use std::collections::BTreeSet;

use crucible_core::ResourceId;
use crucible_core::agent::SystemInfo;
use crucible_scheduler::registry::RegisterRequest;

use crate::error::ApiResult;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct RegisterBody {
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub labels: BTreeSet<String>,
    pub max_builds: u32,
    #[serde(default)]
    pub org_id: Option<ResourceId>,
    #[serde(default)]
    pub region: Option<String>,
    #[serde(default)]
    pub system_info: SystemInfo,
}

pub async fn register(
    State(state): State<AppState>,
    Json(body): Json<RegisterBody>,
) -> ApiResult<Json<serde_json::Value>> {
    let agent_id = state
        .registry
        .register(RegisterRequest {
            org_id: body.org_id,
            name: body.name,
            url: body.url,
            labels: body.labels,
            max_builds: body.max_builds,
            region: body.region,
            system_info: body.system_info,
        })
        .await?;
    Ok(Json(json!({ "agent_id": agent_id })))
}

#[derive(Debug, Deserialize)]
pub struct HeartbeatBody {
    pub current_builds: u32,
    #[serde(default)]
    pub system_info: SystemInfo,
}

pub async fn heartbeat(
    State(state): State<AppState>,
    Path(id): Path<ResourceId>,
    Json(body): Json<HeartbeatBody>,
) -> ApiResult<Json<serde_json::Value>> {
    state
        .registry
        .heartbeat(id, body.current_builds, body.system_info)
        .await?;
    Ok(Json(json!({ "ok": true })))
}
