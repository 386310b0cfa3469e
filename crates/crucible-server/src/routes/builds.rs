//! Build endpoints: operator queries plus the agent event/result/artifact
//! ingestion paths.

use std::convert::Infallible;

use axum::Json;
use axum::extract::{Multipart, Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use chrono::Utc;
use futures::Stream;
use serde::Deserialize;
use serde_json::json;

use crucible_core::artifact::ArtifactRecord;
use crucible_core::build::BuildStatus;
use crucible_core::event::{BuildEvent, EventId, EventKind};
use crucible_core::{Error, ResourceId};
use crucible_executor::Subscription;
use crucible_executor::cache::hash_file;

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

pub async fn get(
    State(state): State<AppState>,
    Path(id): Path<ResourceId>,
) -> ApiResult<Json<serde_json::Value>> {
    let build = state
        .stores
        .builds
        .find(id)
        .await?
        .ok_or_else(|| Error::NotFound(format!("build {id}")))?;
    let stages = state.stores.stages.list_for_build(id).await?;
    let steps = state.stores.steps.list_for_build(id).await?;
    Ok(Json(json!({ "build": build, "stages": stages, "steps": steps })))
}

pub async fn cancel(
    State(state): State<AppState>,
    Path(id): Path<ResourceId>,
) -> ApiResult<Json<serde_json::Value>> {
    state.runner.cancel(id)?;
    Ok(Json(json!({ "ok": true })))
}

pub async fn retry(
    State(state): State<AppState>,
    Path(id): Path<ResourceId>,
) -> ApiResult<Json<serde_json::Value>> {
    let original = state
        .stores
        .builds
        .find(id)
        .await?
        .ok_or_else(|| Error::NotFound(format!("build {id}")))?;
    if !original.status.is_terminal() {
        return Err(ApiError(Error::InvalidInput(format!(
            "build {id} is still {}",
            original.status
        ))));
    }
    let job = state.stores.jobs.get(original.org_id, original.job_id).await?;
    let retry = state.stores.builds.create(&original.retry()).await?;
    state.dispatcher.dispatch(&retry, &job).await?;
    Ok(Json(json!({
        "build_id": retry.id,
        "root_build_id": retry.root_build_id,
        "attempt_number": retry.attempt_number,
    })))
}

#[derive(Debug, Deserialize)]
pub struct EventsQuery {
    /// Replay cursor: only events strictly after this id.
    #[serde(default)]
    pub after: Option<String>,
}

/// Live event stream with store-backed replay, as server-sent events.
pub async fn events(
    State(state): State<AppState>,
    Path(id): Path<ResourceId>,
    Query(query): Query<EventsQuery>,
) -> ApiResult<Sse<impl Stream<Item = Result<SseEvent, Infallible>>>> {
    let after = query.after.map(EventId::from_string).transpose()?;
    let (backlog, subscription) = state.bus.subscribe(id, after).await?;

    struct StreamState {
        backlog: std::vec::IntoIter<BuildEvent>,
        live: Option<Subscription>,
    }

    let stream = futures::stream::unfold(
        StreamState {
            backlog: backlog.into_iter(),
            live: Some(subscription),
        },
        |mut s| async move {
            let event = match s.backlog.next() {
                Some(event) => event,
                None => match s.live.as_mut() {
                    Some(live) => live.recv().await?,
                    None => return None,
                },
            };
            // The stream ends after the terminal lifecycle event.
            if event.kind == EventKind::BuildCompleted {
                s.live = None;
            }
            Some((Ok(sse_event(&event)), s))
        },
    );

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

fn sse_event(event: &BuildEvent) -> SseEvent {
    SseEvent::default()
        .id(event.event_id.to_string())
        .event(event.kind.as_str())
        .data(serde_json::to_string(event).unwrap_or_default())
}

/// Agent-side event ingestion. Events arrive with the agent's total-order
/// ids and flow through the master bus unchanged.
pub async fn agent_events(
    State(state): State<AppState>,
    Path(id): Path<ResourceId>,
    Json(event): Json<BuildEvent>,
) -> ApiResult<Json<serde_json::Value>> {
    if event.build_id != id {
        return Err(ApiError(Error::InvalidInput(format!(
            "event build id {} does not match path {id}",
            event.build_id
        ))));
    }
    state.bus.publish(event).await;
    Ok(Json(json!({ "ok": true })))
}

#[derive(Debug, Deserialize)]
pub struct AgentResultBody {
    pub status: String,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub stage_results: StageResults,
}

/// Stage/step records produced on the agent, persisted here for audit and
/// retry.
#[derive(Debug, Default, Deserialize)]
pub struct StageResults {
    #[serde(default)]
    pub stages: Vec<crucible_core::build::StageRecord>,
    #[serde(default)]
    pub steps: Vec<crucible_core::build::StepRecord>,
}

pub async fn agent_result(
    State(state): State<AppState>,
    Path(id): Path<ResourceId>,
    Json(body): Json<AgentResultBody>,
) -> ApiResult<Json<serde_json::Value>> {
    let status: BuildStatus = body.status.parse()?;
    if !status.is_terminal() {
        return Err(ApiError(Error::InvalidInput(format!(
            "agent result status must be terminal, got {status}"
        ))));
    }
    let build = state
        .stores
        .builds
        .find(id)
        .await?
        .ok_or_else(|| Error::NotFound(format!("build {id}")))?;

    // Records for other builds are rejected; the org partition comes from
    // the master's own build record, not the wire.
    for mut stage in body.stage_results.stages {
        if stage.build_id != id {
            return Err(ApiError(Error::InvalidInput(format!(
                "stage record {} belongs to build {}",
                stage.name, stage.build_id
            ))));
        }
        stage.org_id = build.org_id;
        if let Err(e) = state.stores.stages.insert(&stage).await {
            tracing::warn!(build_id = %id, stage = %stage.name, error = %e, "stage record ingest failed");
        }
    }
    for mut step in body.stage_results.steps {
        if step.build_id != id {
            return Err(ApiError(Error::InvalidInput(format!(
                "step record {} belongs to build {}",
                step.name, step.build_id
            ))));
        }
        step.org_id = build.org_id;
        if let Err(e) = state.stores.steps.insert(&step).await {
            tracing::warn!(build_id = %id, step = %step.name, error = %e, "step record ingest failed");
        }
    }

    let transitioned = state
        .stores
        .builds
        .finalize(id, status, body.error.as_deref())
        .await?;
    Ok(Json(json!({ "ok": true, "transitioned": transitioned })))
}

/// Multipart artifact upload from an agent.
pub async fn agent_artifacts(
    State(state): State<AppState>,
    Path(id): Path<ResourceId>,
    mut multipart: Multipart,
) -> ApiResult<impl IntoResponse> {
    let build = state
        .stores
        .builds
        .find(id)
        .await?
        .ok_or_else(|| Error::NotFound(format!("build {id}")))?;

    let build_dir = state.config.artifact_root.join(id.to_string());
    std::fs::create_dir_all(&build_dir)
        .map_err(|e| Error::ArtifactIo(format!("create {}: {e}", build_dir.display())))?;

    let mut stored = 0;
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError(Error::ArtifactIo(format!("multipart: {e}"))))?
    {
        let filename = field.file_name().unwrap_or("artifact").to_string();
        let bytes = field
            .bytes()
            .await
            .map_err(|e| ApiError(Error::ArtifactIo(format!("multipart read: {e}"))))?;

        let artifact_id = ResourceId::new();
        let target = build_dir.join(artifact_id.to_string());
        std::fs::write(&target, &bytes)
            .map_err(|e| Error::ArtifactIo(format!("write {}: {e}", target.display())))?;
        let sha256 = hash_file(&target)?;

        state
            .stores
            .artifacts
            .insert(&ArtifactRecord {
                id: artifact_id,
                build_id: id,
                org_id: build.org_id,
                filename,
                path: target.display().to_string(),
                size_bytes: bytes.len() as i64,
                content_type: "application/octet-stream".to_string(),
                sha256,
                delta_base_id: None,
                is_delta: false,
                original_size_bytes: None,
                created_at: Utc::now(),
            })
            .await?;
        stored += 1;
    }

    Ok((StatusCode::OK, Json(json!({ "stored": stored }))))
}
