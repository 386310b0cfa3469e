//! Cache entry records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ResourceId;
use crate::build::StepStatus;

/// Content-addressed artifact/dependency cache entry. Immutable after write;
/// duplicate keys silently retain the existing value.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    pub id: ResourceId,
    pub org_id: ResourceId,
    pub job_id: ResourceId,
    pub cache_key: String,
    pub paths: Vec<String>,
    pub size_bytes: i64,
    pub hit_count: i64,
    pub created_at: DateTime<Utc>,
}

/// Recorded outcome of a prior stage execution, reused verbatim on a
/// fingerprint hit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageCacheEntry {
    pub org_id: ResourceId,
    pub job_id: ResourceId,
    /// Unique per job.
    pub fingerprint: String,
    pub stage_name: String,
    pub stage_result: StageResultSnapshot,
    pub git_commit: String,
    pub created_at: DateTime<Utc>,
}

/// The reusable portion of a stage outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageResultSnapshot {
    pub status: StepStatus,
    pub exit_code: Option<i32>,
    /// Step name → exit code, preserved for display on cache hits.
    #[serde(default)]
    pub step_exits: Vec<(String, i32)>,
}
