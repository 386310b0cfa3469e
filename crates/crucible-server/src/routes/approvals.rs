//! Approve/reject operations on pending gates.
//!
//! The store transition is atomic; the waiting executor observes it on its
//! next poll. The resolution event itself is published by the executor so
//! the per-build ordering stays with its generator.

use axum::Json;
use axum::extract::{Path, State};
use serde::Deserialize;
use serde_json::json;

use crucible_core::ResourceId;

use crate::error::ApiResult;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct VoteBody {
    pub approver: String,
}

pub async fn approve(
    State(state): State<AppState>,
    Path(id): Path<ResourceId>,
    Json(body): Json<VoteBody>,
) -> ApiResult<Json<serde_json::Value>> {
    let gate = state.stores.approvals.approve(id, &body.approver).await?;
    Ok(Json(json!({
        "status": gate.status.as_str(),
        "approval_count": gate.approval_count,
        "required_approvals": gate.required_approvals,
    })))
}

pub async fn reject(
    State(state): State<AppState>,
    Path(id): Path<ResourceId>,
    Json(body): Json<VoteBody>,
) -> ApiResult<Json<serde_json::Value>> {
    let gate = state.stores.approvals.reject(id, &body.approver).await?;
    Ok(Json(json!({ "status": gate.status.as_str() })))
}
