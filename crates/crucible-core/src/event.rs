//! Build events and the total-order event id.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use uuid::Uuid;

use crate::ResourceId;

/// Total-order key for build events: `<epoch_ms>-<seq>-<uuid>`.
///
/// The epoch component is zero-padded to 13 digits and the sequence to 10, so
/// lexical order equals insertion order even when wall-clock timestamps
/// collide or step backwards (the generator clamps to the last seen instant).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EventId(String);

impl EventId {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Parse an id received over the wire. Accepts any non-empty string so
    /// replay cursors from older deployments keep working.
    pub fn from_string(s: String) -> crate::Result<Self> {
        if s.is_empty() {
            return Err(crate::Error::InvalidInput("empty event id".into()));
        }
        Ok(Self(s))
    }
}

impl std::fmt::Display for EventId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Process-wide generator producing strictly increasing [`EventId`]s.
#[derive(Debug)]
pub struct EventIdGenerator {
    state: Mutex<(i64, u64)>,
}

impl EventIdGenerator {
    pub fn new() -> Self {
        Self {
            state: Mutex::new((0, 0)),
        }
    }

    pub fn next(&self) -> EventId {
        let now = Utc::now().timestamp_millis();
        let mut state = self.state.lock().expect("event id generator poisoned");
        state.0 = state.0.max(now);
        state.1 += 1;
        EventId(format!("{:013}-{:010}-{}", state.0, state.1, Uuid::new_v4()))
    }
}

impl Default for EventIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

/// Kinds of orchestration progress events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EventKind {
    BuildStarted,
    StageStarted,
    StageCached,
    StepStarted,
    StepLog,
    StepCompleted,
    StageCompleted,
    ApprovalRequired,
    ApprovalResolved,
    BuildCompleted,
}

impl EventKind {
    /// Lifecycle events must be delivered to live subscribers or flagged;
    /// everything else may be dropped under back-pressure.
    pub fn is_critical(&self) -> bool {
        matches!(
            self,
            EventKind::BuildStarted
                | EventKind::StepCompleted
                | EventKind::StageCompleted
                | EventKind::ApprovalRequired
                | EventKind::ApprovalResolved
                | EventKind::BuildCompleted
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::BuildStarted => "build-started",
            EventKind::StageStarted => "stage-started",
            EventKind::StageCached => "stage-cached",
            EventKind::StepStarted => "step-started",
            EventKind::StepLog => "step-log",
            EventKind::StepCompleted => "step-completed",
            EventKind::StageCompleted => "stage-completed",
            EventKind::ApprovalRequired => "approval-required",
            EventKind::ApprovalResolved => "approval-resolved",
            EventKind::BuildCompleted => "build-completed",
        }
    }
}

/// Append-only record of orchestration progress.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildEvent {
    pub event_id: EventId,
    pub build_id: ResourceId,
    pub org_id: ResourceId,
    pub kind: EventKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_name: Option<String>,
    #[serde(default)]
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_strictly_increasing() {
        let generator = EventIdGenerator::new();
        let mut previous = generator.next();
        for _ in 0..1000 {
            let next = generator.next();
            assert!(next > previous, "{next} should sort after {previous}");
            previous = next;
        }
    }

    #[test]
    fn lexical_order_matches_numeric_order() {
        // A later millisecond with a smaller sequence must still sort after.
        let early = EventId("0000000001000-0000000099-00000000-0000-0000-0000-000000000000".to_string());
        let late = EventId("0000000002000-0000000001-00000000-0000-0000-0000-000000000000".to_string());
        assert!(late > early);
    }

    #[test]
    fn critical_kinds() {
        assert!(EventKind::BuildStarted.is_critical());
        assert!(EventKind::BuildCompleted.is_critical());
        assert!(EventKind::ApprovalRequired.is_critical());
        assert!(!EventKind::StepLog.is_critical());
        assert!(!EventKind::StageStarted.is_critical());
    }
}
