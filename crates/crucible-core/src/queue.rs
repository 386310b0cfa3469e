//! Durable build queue entries.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ResourceId;

/// Dispatch priority. Higher sorts earlier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    Normal,
    High,
}

impl Priority {
    /// Numeric rank used for `ORDER BY priority DESC`.
    pub fn rank(&self) -> i32 {
        match self {
            Priority::Low => 0,
            Priority::Normal => 1,
            Priority::High => 2,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Low => "low",
            Priority::Normal => "normal",
            Priority::High => "high",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueEntryStatus {
    Pending,
    Claimed,
    Done,
}

impl QueueEntryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueEntryStatus::Pending => "pending",
            QueueEntryStatus::Claimed => "claimed",
            QueueEntryStatus::Done => "done",
        }
    }
}

/// One queued dispatch request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueEntry {
    pub id: ResourceId,
    pub org_id: ResourceId,
    pub job_id: ResourceId,
    pub priority: Priority,
    /// Opaque dispatch payload, typically the build id plus trigger context.
    pub payload: serde_json::Value,
    pub status: QueueEntryStatus,
    pub enqueued_at: DateTime<Utc>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub claimed_by: Option<String>,
}

impl QueueEntry {
    pub fn new(
        org_id: ResourceId,
        job_id: ResourceId,
        priority: Priority,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            id: ResourceId::new(),
            org_id,
            job_id,
            priority,
            payload,
            status: QueueEntryStatus::Pending,
            enqueued_at: Utc::now(),
            claimed_at: None,
            claimed_by: None,
        }
    }
}
