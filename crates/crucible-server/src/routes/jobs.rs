//! Job creation and build triggering.

use std::collections::HashMap;

use axum::Json;
use axum::extract::{Path, State};
use serde::Deserialize;
use serde_json::json;

use crucible_core::build::{Build, TriggerType};
use crucible_core::job::{Job, SourceConfig, TriggerConfig};
use crucible_core::pipeline::{ParamDef, Pipeline};
use crucible_core::queue::Priority;
use crucible_core::ResourceId;

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct CreateJobBody {
    pub org_id: ResourceId,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub pipeline: Option<Pipeline>,
    #[serde(default)]
    pub parameters: Vec<ParamDef>,
    #[serde(default)]
    pub source: Option<SourceConfig>,
    #[serde(default)]
    pub agent_labels: Vec<String>,
    #[serde(default)]
    pub priority: Option<Priority>,
}

pub async fn create(
    State(state): State<AppState>,
    Json(body): Json<CreateJobBody>,
) -> ApiResult<Json<serde_json::Value>> {
    if let Some(pipeline) = &body.pipeline {
        pipeline.validate()?;
    }
    let mut job = Job::new(body.org_id, body.name);
    job.description = body.description;
    job.pipeline_value = body.pipeline;
    job.parameter_defs = body.parameters;
    job.source_config = body.source;
    job.agent_labels = body.agent_labels;
    job.priority = body.priority;
    job.trigger_config = TriggerConfig::default();
    state.stores.jobs.create(&job).await?;
    Ok(Json(json!({ "job_id": job.id })))
}

#[derive(Debug, Deserialize)]
pub struct TriggerBody {
    pub org_id: ResourceId,
    #[serde(default)]
    pub parameters: HashMap<String, String>,
    #[serde(default)]
    pub trigger_type: Option<TriggerType>,
}

pub async fn trigger(
    State(state): State<AppState>,
    Path(id): Path<ResourceId>,
    Json(body): Json<TriggerBody>,
) -> ApiResult<Json<serde_json::Value>> {
    let job = state.stores.jobs.get(body.org_id, id).await?;
    let parameters = job.resolve_parameters(&body.parameters)?;
    let build = Build::new(
        job.id,
        job.org_id,
        body.trigger_type.unwrap_or(TriggerType::Api),
        parameters,
    );
    let build = state.stores.builds.create(&build).await?;

    if let Err(e) = state.dispatcher.dispatch(&build, &job).await {
        // Dispatch decisions that fail outright (no agent, no fallback)
        // terminate the build before any stage record exists.
        state
            .stores
            .builds
            .finalize(
                build.id,
                crucible_core::build::BuildStatus::Failure,
                Some(&format!("{}: {e}", e.kind())),
            )
            .await?;
        return Err(ApiError(e));
    }

    Ok(Json(json!({
        "build_id": build.id,
        "build_number": build.build_number,
    })))
}
