//! Artifact records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ResourceId;

/// A file collected from the workspace after a build.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactRecord {
    pub id: ResourceId,
    pub build_id: ResourceId,
    pub org_id: ResourceId,
    pub filename: String,
    /// Location inside the artifact store.
    pub path: String,
    pub size_bytes: i64,
    pub content_type: String,
    pub sha256: String,
    /// Present when the stored bytes are a block delta against a prior
    /// build's artifact of the same filename.
    pub delta_base_id: Option<ResourceId>,
    pub is_delta: bool,
    pub original_size_bytes: Option<i64>,
    pub created_at: DateTime<Utc>,
}
