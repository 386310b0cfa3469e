//! Build, stage and step records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::ResourceId;

/// Overall build status. Terminal statuses are irrevocable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildStatus {
    Queued,
    Running,
    Success,
    Failure,
    Aborted,
}

impl BuildStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, BuildStatus::Success | BuildStatus::Failure | BuildStatus::Aborted)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BuildStatus::Queued => "queued",
            BuildStatus::Running => "running",
            BuildStatus::Success => "success",
            BuildStatus::Failure => "failure",
            BuildStatus::Aborted => "aborted",
        }
    }
}

impl std::str::FromStr for BuildStatus {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        match s {
            "queued" => Ok(BuildStatus::Queued),
            "running" => Ok(BuildStatus::Running),
            "success" => Ok(BuildStatus::Success),
            "failure" => Ok(BuildStatus::Failure),
            "aborted" => Ok(BuildStatus::Aborted),
            other => Err(crate::Error::InvalidInput(format!("unknown build status: {other}"))),
        }
    }
}

impl std::fmt::Display for BuildStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What triggered a build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerType {
    Manual,
    Push,
    Schedule,
    Api,
    Retry,
}

impl TriggerType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerType::Manual => "manual",
            TriggerType::Push => "push",
            TriggerType::Schedule => "schedule",
            TriggerType::Api => "api",
            TriggerType::Retry => "retry",
        }
    }
}

impl std::str::FromStr for TriggerType {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        match s {
            "manual" => Ok(TriggerType::Manual),
            "push" => Ok(TriggerType::Push),
            "schedule" => Ok(TriggerType::Schedule),
            "api" => Ok(TriggerType::Api),
            "retry" => Ok(TriggerType::Retry),
            other => Err(crate::Error::InvalidInput(format!("unknown trigger type: {other}"))),
        }
    }
}

/// Where the executed pipeline definition came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PipelineSource {
    Server,
    RepoEdn,
    RepoYaml,
}

impl PipelineSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineSource::Server => "server",
            PipelineSource::RepoEdn => "repo-edn",
            PipelineSource::RepoYaml => "repo-yaml",
        }
    }
}

impl std::str::FromStr for PipelineSource {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        match s {
            "server" => Ok(PipelineSource::Server),
            "repo-edn" => Ok(PipelineSource::RepoEdn),
            "repo-yaml" => Ok(PipelineSource::RepoYaml),
            other => Err(crate::Error::InvalidInput(format!("unknown pipeline source: {other}"))),
        }
    }
}

/// Commit metadata extracted after checkout.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GitInfo {
    pub commit: String,
    pub branch: String,
    pub author: String,
    pub email: String,
    pub message: String,
}

impl GitInfo {
    /// First 7 characters of the commit sha.
    pub fn short_commit(&self) -> String {
        self.commit.chars().take(7).collect()
    }
}

/// One execution attempt of a job's pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Build {
    pub id: ResourceId,
    pub job_id: ResourceId,
    pub org_id: ResourceId,
    /// Monotonically increasing per job.
    pub build_number: i64,
    pub status: BuildStatus,
    pub trigger_type: TriggerType,
    pub parameters: HashMap<String, String>,
    pub workspace_path: Option<String>,
    /// Set when the build was dispatched to a remote agent.
    pub agent_id: Option<ResourceId>,
    pub dispatched_at: Option<DateTime<Utc>>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub git: Option<GitInfo>,
    /// 1 for the first attempt; retries increment.
    pub attempt_number: i32,
    /// Self for the first attempt; retries point at the original.
    pub root_build_id: ResourceId,
    pub pipeline_source: Option<PipelineSource>,
    pub error_message: Option<String>,
}

impl Build {
    /// A fresh first-attempt build in `queued`.
    pub fn new(
        job_id: ResourceId,
        org_id: ResourceId,
        trigger_type: TriggerType,
        parameters: HashMap<String, String>,
    ) -> Self {
        let id = ResourceId::new();
        Self {
            id,
            job_id,
            org_id,
            build_number: 0,
            status: BuildStatus::Queued,
            trigger_type,
            parameters,
            workspace_path: None,
            agent_id: None,
            dispatched_at: None,
            started_at: Utc::now(),
            finished_at: None,
            git: None,
            attempt_number: 1,
            root_build_id: id,
            pipeline_source: None,
            error_message: None,
        }
    }

    /// A retry of this build: new id, same root, next attempt number.
    pub fn retry(&self) -> Self {
        let mut next = Self::new(self.job_id, self.org_id, TriggerType::Retry, self.parameters.clone());
        next.root_build_id = self.root_build_id;
        next.attempt_number = self.attempt_number + 1;
        next
    }
}

/// Status of a stage or step record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Running,
    Success,
    Failure,
    Skipped,
    Aborted,
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepStatus::Running => "running",
            StepStatus::Success => "success",
            StepStatus::Failure => "failure",
            StepStatus::Skipped => "skipped",
            StepStatus::Aborted => "aborted",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, StepStatus::Running)
    }
}

impl std::str::FromStr for StepStatus {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        match s {
            "running" => Ok(StepStatus::Running),
            "success" => Ok(StepStatus::Success),
            "failure" => Ok(StepStatus::Failure),
            "skipped" => Ok(StepStatus::Skipped),
            "aborted" => Ok(StepStatus::Aborted),
            other => Err(crate::Error::InvalidInput(format!("unknown step status: {other}"))),
        }
    }
}

/// Per-build stage detail.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageRecord {
    pub id: ResourceId,
    pub build_id: ResourceId,
    pub org_id: ResourceId,
    pub name: String,
    pub status: StepStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub exit_code: Option<i32>,
    pub error_message: Option<String>,
    pub container_image: Option<String>,
}

impl StageRecord {
    pub fn started(build_id: ResourceId, org_id: ResourceId, name: impl Into<String>) -> Self {
        Self {
            id: ResourceId::new(),
            build_id,
            org_id,
            name: name.into(),
            status: StepStatus::Running,
            started_at: Utc::now(),
            finished_at: None,
            exit_code: None,
            error_message: None,
            container_image: None,
        }
    }
}

/// Per-build step detail.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepRecord {
    pub id: ResourceId,
    pub build_id: ResourceId,
    pub org_id: ResourceId,
    pub stage_name: String,
    pub name: String,
    pub status: StepStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub exit_code: Option<i32>,
    pub error_message: Option<String>,
    pub container_image: Option<String>,
}

impl StepRecord {
    pub fn started(
        build_id: ResourceId,
        org_id: ResourceId,
        stage_name: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            id: ResourceId::new(),
            build_id,
            org_id,
            stage_name: stage_name.into(),
            name: name.into(),
            status: StepStatus::Running,
            started_at: Utc::now(),
            finished_at: None,
            exit_code: None,
            error_message: None,
            container_image: None,
        }
    }
}
