//! Approval gate records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ResourceId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum GateStatus {
    Pending,
    Approved,
    Rejected,
    TimedOut,
}

impl GateStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, GateStatus::Pending)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            GateStatus::Pending => "pending",
            GateStatus::Approved => "approved",
            GateStatus::Rejected => "rejected",
            GateStatus::TimedOut => "timed-out",
        }
    }
}

/// A suspended stage awaiting human approval.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalGate {
    pub id: ResourceId,
    pub build_id: ResourceId,
    pub org_id: ResourceId,
    pub stage_name: String,
    pub required_approvals: u32,
    pub approval_count: u32,
    pub approver_ids: Vec<String>,
    pub status: GateStatus,
    pub created_at: DateTime<Utc>,
    pub timeout_at: DateTime<Utc>,
}

impl ApprovalGate {
    pub fn pending(
        build_id: ResourceId,
        org_id: ResourceId,
        stage_name: impl Into<String>,
        required_approvals: u32,
        timeout_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: ResourceId::new(),
            build_id,
            org_id,
            stage_name: stage_name.into(),
            required_approvals,
            approval_count: 0,
            approver_ids: Vec::new(),
            status: GateStatus::Pending,
            created_at: Utc::now(),
            timeout_at,
        }
    }
}
