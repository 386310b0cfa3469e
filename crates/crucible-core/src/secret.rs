//! Sealed secret records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ResourceId;

/// Secret visibility scope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SecretScope {
    Global,
    Job(ResourceId),
}

/// A stored secret. The ciphertext is AES-256-GCM under a process-wide
/// master key; the key never touches the store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecretRecord {
    pub id: ResourceId,
    pub org_id: ResourceId,
    pub scope: SecretScope,
    pub name: String,
    pub ciphertext_b64: String,
    pub iv_b64: String,
    pub created_at: DateTime<Utc>,
}

/// Audit record written on each secret retrieval.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecretAccess {
    pub secret_id: ResourceId,
    pub org_id: ResourceId,
    pub build_id: Option<ResourceId>,
    pub accessed_at: DateTime<Utc>,
}
