//! The agent registry.
//!
//! In-memory map backed by the agent store with write-through on every
//! mutation; `hydrate_from_store` refills memory on master start. With no
//! store configured the registry is memory-only. Staleness is decided at
//! read time from the last heartbeat.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::Utc;
use tracing::info;

use crucible_core::agent::{Agent, AgentStatus, SystemInfo};
use crucible_core::store::AgentStore;
use crucible_core::{Error, ResourceId, Result};

/// Registration request from an agent.
#[derive(Debug, Clone)]
pub struct RegisterRequest {
    pub org_id: Option<ResourceId>,
    pub name: String,
    pub url: String,
    pub labels: BTreeSet<String>,
    pub max_builds: u32,
    pub region: Option<String>,
    pub system_info: SystemInfo,
}

pub struct AgentRegistry {
    store: Option<Arc<dyn AgentStore>>,
    agents: RwLock<HashMap<ResourceId, Agent>>,
    stale_after: Duration,
}

impl AgentRegistry {
    pub fn new(store: Option<Arc<dyn AgentStore>>, stale_after: Duration) -> Self {
        Self {
            store,
            agents: RwLock::new(HashMap::new()),
            stale_after,
        }
    }

    /// Refill the in-memory map from the store, called once on master start.
    pub async fn hydrate_from_store(&self) -> Result<usize> {
        let Some(store) = &self.store else {
            return Ok(0);
        };
        let stored = store.list().await?;
        let count = stored.len();
        let mut agents = self.agents.write().unwrap();
        agents.clear();
        for agent in stored {
            agents.insert(agent.id, agent);
        }
        info!(count, "agent registry hydrated");
        Ok(count)
    }

    /// Register (or re-register by name+url) an agent. Store first, memory
    /// second.
    pub async fn register(&self, request: RegisterRequest) -> Result<ResourceId> {
        let existing_id = self
            .agents
            .read()
            .unwrap()
            .values()
            .find(|a| a.name == request.name && a.url == request.url)
            .map(|a| a.id);
        let agent = Agent {
            id: existing_id.unwrap_or_default(),
            org_id: request.org_id,
            name: request.name,
            url: request.url,
            labels: request.labels,
            max_builds: request.max_builds,
            current_builds: 0,
            cpu_cores: request.system_info.cpu_cores,
            memory_gb: request.system_info.memory_gb,
            region: request.region,
            last_heartbeat_at: Utc::now(),
            status: AgentStatus::Online,
        };
        if let Some(store) = &self.store {
            store.upsert(&agent).await?;
        }
        let id = agent.id;
        self.agents.write().unwrap().insert(id, agent);
        info!(agent_id = %id, "agent registered");
        Ok(id)
    }

    pub async fn heartbeat(
        &self,
        id: ResourceId,
        current_builds: u32,
        system_info: SystemInfo,
    ) -> Result<()> {
        let updated = {
            let mut agents = self.agents.write().unwrap();
            let agent = agents
                .get_mut(&id)
                .ok_or_else(|| Error::NotFound(format!("agent {id}")))?;
            agent.last_heartbeat_at = Utc::now();
            agent.current_builds = current_builds;
            agent.cpu_cores = system_info.cpu_cores;
            agent.memory_gb = system_info.memory_gb;
            agent.status = AgentStatus::Online;
            agent.clone()
        };
        if let Some(store) = &self.store {
            store.upsert(&updated).await?;
        }
        Ok(())
    }

    pub fn get(&self, id: ResourceId) -> Option<Agent> {
        self.agents.read().unwrap().get(&id).map(|a| self.with_effective_status(a.clone()))
    }

    /// Agents visible to an org (shared agents included), with read-time
    /// status.
    pub fn list(&self, org_id: Option<ResourceId>) -> Vec<Agent> {
        let agents = self.agents.read().unwrap();
        let mut out: Vec<Agent> = agents
            .values()
            .filter(|a| match (a.org_id, org_id) {
                (None, _) => true,
                (Some(agent_org), Some(org)) => agent_org == org,
                (Some(_), None) => false,
            })
            .map(|a| self.with_effective_status(a.clone()))
            .collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }

    /// Optimistic capacity bump after a successful dispatch; the next
    /// heartbeat carries the authoritative count.
    pub fn note_dispatched(&self, id: ResourceId) {
        if let Some(agent) = self.agents.write().unwrap().get_mut(&id) {
            agent.current_builds = agent.current_builds.saturating_add(1);
        }
    }

    fn with_effective_status(&self, mut agent: Agent) -> Agent {
        agent.status = agent.effective_status(Utc::now(), self.stale_after.as_secs() as i64);
        agent
    }

    pub fn counts(&self) -> (usize, usize, usize, u32) {
        let agents = self.agents.read().unwrap();
        let mut online = 0;
        let mut offline = 0;
        let mut capacity = 0;
        for agent in agents.values() {
            match agent.effective_status(Utc::now(), self.stale_after.as_secs() as i64) {
                AgentStatus::Online => {
                    online += 1;
                    capacity += agent.max_builds.saturating_sub(agent.current_builds);
                }
                AgentStatus::Offline => offline += 1,
            }
        }
        (agents.len(), online, offline, capacity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crucible_db::memory::MemoryAgentStore;

    fn request(name: &str) -> RegisterRequest {
        RegisterRequest {
            org_id: None,
            name: name.into(),
            url: format!("http://{name}:9000"),
            labels: ["linux"].into_iter().map(String::from).collect(),
            max_builds: 2,
            region: None,
            system_info: SystemInfo {
                cpu_cores: 4,
                memory_gb: 8,
                os: None,
                arch: None,
            },
        }
    }

    #[tokio::test]
    async fn register_writes_through_and_hydrates() {
        let store: Arc<dyn AgentStore> = Arc::new(MemoryAgentStore::default());
        let registry = AgentRegistry::new(Some(store.clone()), Duration::from_secs(90));
        let id = registry.register(request("runner-1")).await.unwrap();

        // The store saw the write.
        assert!(store.get(id).await.unwrap().is_some());

        // A fresh registry over the same store hydrates it back.
        let rehydrated = AgentRegistry::new(Some(store), Duration::from_secs(90));
        assert_eq!(rehydrated.hydrate_from_store().await.unwrap(), 1);
        assert!(rehydrated.get(id).is_some());
    }

    #[tokio::test]
    async fn reregistration_keeps_identity() {
        let registry = AgentRegistry::new(None, Duration::from_secs(90));
        let first = registry.register(request("runner-1")).await.unwrap();
        let second = registry.register(request("runner-1")).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(registry.list(None).len(), 1);
    }

    #[tokio::test]
    async fn stale_agents_read_offline() {
        let registry = AgentRegistry::new(None, Duration::from_millis(0));
        let id = registry.register(request("runner-1")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(1100)).await;
        assert_eq!(registry.get(id).unwrap().status, AgentStatus::Offline);

        registry
            .heartbeat(id, 0, SystemInfo { cpu_cores: 4, memory_gb: 8, os: None, arch: None })
            .await
            .unwrap();
        // A fresh heartbeat makes it online for a stale window of 1s+.
        let fresh = AgentRegistry::new(None, Duration::from_secs(90));
        let id2 = fresh.register(request("runner-2")).await.unwrap();
        assert_eq!(fresh.get(id2).unwrap().status, AgentStatus::Online);
    }

    #[tokio::test]
    async fn org_scoping_hides_foreign_agents() {
        let registry = AgentRegistry::new(None, Duration::from_secs(90));
        let org_a = ResourceId::new();
        let org_b = ResourceId::new();
        let mut scoped = request("scoped");
        scoped.org_id = Some(org_a);
        registry.register(scoped).await.unwrap();
        registry.register(request("shared")).await.unwrap();

        assert_eq!(registry.list(Some(org_a)).len(), 2);
        assert_eq!(registry.list(Some(org_b)).len(), 1);
    }
}
