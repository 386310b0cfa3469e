//! Remote agent model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::ResourceId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Online,
    Offline,
}

impl AgentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentStatus::Online => "online",
            AgentStatus::Offline => "offline",
        }
    }
}

/// System telemetry reported with registrations and heartbeats.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SystemInfo {
    pub cpu_cores: u32,
    pub memory_gb: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub os: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arch: Option<String>,
}

/// A remote worker that accepts dispatched builds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    pub id: ResourceId,
    /// None means the agent is shareable across organizations.
    pub org_id: Option<ResourceId>,
    pub name: String,
    pub url: String,
    pub labels: BTreeSet<String>,
    pub max_builds: u32,
    pub current_builds: u32,
    pub cpu_cores: u32,
    pub memory_gb: u32,
    pub region: Option<String>,
    pub last_heartbeat_at: DateTime<Utc>,
    pub status: AgentStatus,
}

impl Agent {
    /// Status as observed at read time: an agent whose heartbeat is older
    /// than `stale_after_secs` is logically offline.
    pub fn effective_status(&self, now: DateTime<Utc>, stale_after_secs: i64) -> AgentStatus {
        if self.status == AgentStatus::Offline {
            return AgentStatus::Offline;
        }
        let age = now.signed_duration_since(self.last_heartbeat_at).num_seconds();
        if age > stale_after_secs {
            AgentStatus::Offline
        } else {
            AgentStatus::Online
        }
    }

    pub fn has_capacity(&self) -> bool {
        self.current_builds < self.max_builds
    }

    pub fn matches_labels<'a>(&self, required: impl IntoIterator<Item = &'a str>) -> bool {
        required.into_iter().all(|label| self.labels.contains(label))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn agent() -> Agent {
        Agent {
            id: ResourceId::new(),
            org_id: None,
            name: "runner-1".into(),
            url: "http://runner-1:9000".into(),
            labels: ["linux", "docker"].into_iter().map(String::from).collect(),
            max_builds: 2,
            current_builds: 0,
            cpu_cores: 8,
            memory_gb: 16,
            region: None,
            last_heartbeat_at: Utc::now(),
            status: AgentStatus::Online,
        }
    }

    #[test]
    fn stale_heartbeat_reads_offline() {
        let mut a = agent();
        a.last_heartbeat_at = Utc::now() - Duration::seconds(120);
        assert_eq!(a.effective_status(Utc::now(), 90), AgentStatus::Offline);
        a.last_heartbeat_at = Utc::now() - Duration::seconds(30);
        assert_eq!(a.effective_status(Utc::now(), 90), AgentStatus::Online);
    }

    #[test]
    fn label_matching_is_superset() {
        let a = agent();
        assert!(a.matches_labels(["linux"]));
        assert!(a.matches_labels(["linux", "docker"]));
        assert!(!a.matches_labels(["linux", "gpu"]));
    }
}
