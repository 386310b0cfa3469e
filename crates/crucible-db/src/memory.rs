//! In-memory store implementations.
//!
//! The embedded engine for single-process deployments, and the test double
//! for everything above the store contracts. Semantics mirror the Postgres
//! implementations: exactly-once dequeue, first-write-wins caches, terminal
//! build statuses that cannot be overwritten.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crucible_core::agent::Agent;
use crucible_core::approval::{ApprovalGate, GateStatus};
use crucible_core::artifact::ArtifactRecord;
use crucible_core::build::{Build, BuildStatus, GitInfo, PipelineSource, StageRecord, StepRecord};
use crucible_core::cache::{CacheEntry, StageCacheEntry};
use crucible_core::event::{BuildEvent, EventId};
use crucible_core::job::Job;
use crucible_core::queue::{QueueEntry, QueueEntryStatus};
use crucible_core::secret::{SecretAccess, SecretRecord, SecretScope};
use crucible_core::store::{
    AgentStore, ApprovalStore, ArtifactStore, BuildStore, CacheStore, EventStore, JobStore,
    QueueStore, SecretStore, StageResultStore, StageStore, StepStore, Stores,
};
use crucible_core::{Error, ResourceId, Result};

type SharedBuilds = Arc<Mutex<HashMap<ResourceId, Build>>>;

/// Wire a full in-memory [`Stores`] bundle.
pub fn memory_stores() -> Stores {
    let builds: SharedBuilds = Arc::new(Mutex::new(HashMap::new()));
    Stores {
        jobs: Arc::new(MemoryJobStore::default()),
        builds: Arc::new(MemoryBuildStore {
            builds: builds.clone(),
        }),
        stages: Arc::new(MemoryStageStore::default()),
        steps: Arc::new(MemoryStepStore::default()),
        events: Arc::new(MemoryEventStore::default()),
        queue: Arc::new(MemoryQueueStore::default()),
        agents: Arc::new(MemoryAgentStore::default()),
        cache: Arc::new(MemoryCacheStore::default()),
        stage_results: Arc::new(MemoryStageResultStore::default()),
        approvals: Arc::new(MemoryApprovalStore::default()),
        artifacts: Arc::new(MemoryArtifactStore { builds, artifacts: Mutex::new(Vec::new()) }),
        secrets: Arc::new(MemorySecretStore::default()),
    }
}

#[derive(Default)]
pub struct MemoryJobStore {
    jobs: Mutex<HashMap<ResourceId, Job>>,
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn create(&self, job: &Job) -> Result<()> {
        let mut jobs = self.jobs.lock().unwrap();
        if jobs
            .values()
            .any(|j| j.org_id == job.org_id && j.name == job.name)
        {
            return Err(Error::StoreConflict(format!("job name {}", job.name)));
        }
        jobs.insert(job.id, job.clone());
        Ok(())
    }

    async fn get(&self, org_id: ResourceId, id: ResourceId) -> Result<Job> {
        self.jobs
            .lock()
            .unwrap()
            .get(&id)
            .filter(|j| j.org_id == org_id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("job {id}")))
    }

    async fn find_by_name(&self, org_id: ResourceId, name: &str) -> Result<Option<Job>> {
        Ok(self
            .jobs
            .lock()
            .unwrap()
            .values()
            .find(|j| j.org_id == org_id && j.name == name)
            .cloned())
    }

    async fn list(&self, org_id: ResourceId) -> Result<Vec<Job>> {
        let mut jobs: Vec<_> = self
            .jobs
            .lock()
            .unwrap()
            .values()
            .filter(|j| j.org_id == org_id)
            .cloned()
            .collect();
        jobs.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(jobs)
    }
}

pub struct MemoryBuildStore {
    builds: SharedBuilds,
}

impl Default for MemoryBuildStore {
    fn default() -> Self {
        Self {
            builds: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

#[async_trait]
impl BuildStore for MemoryBuildStore {
    async fn create(&self, build: &Build) -> Result<Build> {
        let mut builds = self.builds.lock().unwrap();
        let next_number = builds
            .values()
            .filter(|b| b.job_id == build.job_id)
            .map(|b| b.build_number)
            .max()
            .unwrap_or(0)
            + 1;
        let mut stored = build.clone();
        stored.build_number = next_number;
        builds.insert(stored.id, stored.clone());
        Ok(stored)
    }

    async fn get(&self, org_id: ResourceId, id: ResourceId) -> Result<Build> {
        self.builds
            .lock()
            .unwrap()
            .get(&id)
            .filter(|b| b.org_id == org_id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("build {id}")))
    }

    async fn find(&self, id: ResourceId) -> Result<Option<Build>> {
        Ok(self.builds.lock().unwrap().get(&id).cloned())
    }

    async fn mark_running(&self, id: ResourceId, workspace_path: &str) -> Result<()> {
        let mut builds = self.builds.lock().unwrap();
        if let Some(build) = builds.get_mut(&id) {
            if !build.status.is_terminal() {
                build.status = BuildStatus::Running;
                build.workspace_path = Some(workspace_path.to_string());
            }
        }
        Ok(())
    }

    async fn set_git(&self, id: ResourceId, git: &GitInfo) -> Result<()> {
        if let Some(build) = self.builds.lock().unwrap().get_mut(&id) {
            build.git = Some(git.clone());
        }
        Ok(())
    }

    async fn set_pipeline_source(&self, id: ResourceId, source: PipelineSource) -> Result<()> {
        if let Some(build) = self.builds.lock().unwrap().get_mut(&id) {
            build.pipeline_source = Some(source);
        }
        Ok(())
    }

    async fn set_dispatched(&self, id: ResourceId, agent_id: ResourceId) -> Result<()> {
        if let Some(build) = self.builds.lock().unwrap().get_mut(&id) {
            build.agent_id = Some(agent_id);
            build.dispatched_at = Some(Utc::now());
        }
        Ok(())
    }

    async fn finalize(
        &self,
        id: ResourceId,
        status: BuildStatus,
        error_message: Option<&str>,
    ) -> Result<bool> {
        let mut builds = self.builds.lock().unwrap();
        match builds.get_mut(&id) {
            Some(build) if !build.status.is_terminal() => {
                build.status = status;
                build.finished_at = Some(Utc::now());
                if let Some(message) = error_message {
                    build.error_message = Some(message.to_string());
                }
                Ok(true)
            }
            Some(_) => Ok(false),
            None => Err(Error::NotFound(format!("build {id}"))),
        }
    }

    async fn find_recent_for_commit(
        &self,
        org_id: ResourceId,
        job_id: ResourceId,
        commit: &str,
        since: DateTime<Utc>,
    ) -> Result<Option<Build>> {
        Ok(self
            .builds
            .lock()
            .unwrap()
            .values()
            .filter(|b| {
                b.org_id == org_id
                    && b.job_id == job_id
                    && b.git.as_ref().is_some_and(|g| g.commit == commit)
                    && matches!(
                        b.status,
                        BuildStatus::Queued | BuildStatus::Running | BuildStatus::Success
                    )
                    && b.started_at >= since
            })
            .max_by_key(|b| b.started_at)
            .cloned())
    }

    async fn list_for_job(
        &self,
        org_id: ResourceId,
        job_id: ResourceId,
        limit: i64,
    ) -> Result<Vec<Build>> {
        let mut builds: Vec<_> = self
            .builds
            .lock()
            .unwrap()
            .values()
            .filter(|b| b.org_id == org_id && b.job_id == job_id)
            .cloned()
            .collect();
        builds.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        builds.truncate(limit as usize);
        Ok(builds)
    }

    async fn list_by_status(&self, status: BuildStatus) -> Result<Vec<Build>> {
        Ok(self
            .builds
            .lock()
            .unwrap()
            .values()
            .filter(|b| b.status == status)
            .cloned()
            .collect())
    }
}

#[derive(Default)]
pub struct MemoryStageStore {
    stages: Mutex<Vec<StageRecord>>,
}

#[async_trait]
impl StageStore for MemoryStageStore {
    async fn insert(&self, stage: &StageRecord) -> Result<()> {
        self.stages.lock().unwrap().push(stage.clone());
        Ok(())
    }

    async fn update(&self, stage: &StageRecord) -> Result<()> {
        let mut stages = self.stages.lock().unwrap();
        if let Some(existing) = stages.iter_mut().find(|s| s.id == stage.id) {
            *existing = stage.clone();
        }
        Ok(())
    }

    async fn list_for_build(&self, build_id: ResourceId) -> Result<Vec<StageRecord>> {
        let mut stages: Vec<_> = self
            .stages
            .lock()
            .unwrap()
            .iter()
            .filter(|s| s.build_id == build_id)
            .cloned()
            .collect();
        stages.sort_by_key(|s| s.started_at);
        Ok(stages)
    }
}

#[derive(Default)]
pub struct MemoryStepStore {
    steps: Mutex<Vec<StepRecord>>,
}

#[async_trait]
impl StepStore for MemoryStepStore {
    async fn insert(&self, step: &StepRecord) -> Result<()> {
        self.steps.lock().unwrap().push(step.clone());
        Ok(())
    }

    async fn update(&self, step: &StepRecord) -> Result<()> {
        let mut steps = self.steps.lock().unwrap();
        if let Some(existing) = steps.iter_mut().find(|s| s.id == step.id) {
            *existing = step.clone();
        }
        Ok(())
    }

    async fn list_for_build(&self, build_id: ResourceId) -> Result<Vec<StepRecord>> {
        let mut steps: Vec<_> = self
            .steps
            .lock()
            .unwrap()
            .iter()
            .filter(|s| s.build_id == build_id)
            .cloned()
            .collect();
        steps.sort_by_key(|s| s.started_at);
        Ok(steps)
    }
}

#[derive(Default)]
pub struct MemoryEventStore {
    events: Mutex<Vec<BuildEvent>>,
}

#[async_trait]
impl EventStore for MemoryEventStore {
    async fn append(&self, event: &BuildEvent) -> Result<()> {
        self.events.lock().unwrap().push(event.clone());
        Ok(())
    }

    async fn replay(
        &self,
        build_id: ResourceId,
        after: Option<&EventId>,
        limit: usize,
    ) -> Result<Vec<BuildEvent>> {
        let mut events: Vec<_> = self
            .events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.build_id == build_id)
            .filter(|e| after.is_none_or(|cursor| &e.event_id > cursor))
            .cloned()
            .collect();
        events.sort_by(|a, b| a.event_id.cmp(&b.event_id));
        events.truncate(limit);
        Ok(events)
    }

    async fn delete_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let mut events = self.events.lock().unwrap();
        let before = events.len();
        events.retain(|e| e.created_at >= cutoff);
        Ok((before - events.len()) as u64)
    }
}

#[derive(Default)]
pub struct MemoryQueueStore {
    entries: Mutex<Vec<QueueEntry>>,
}

#[async_trait]
impl QueueStore for MemoryQueueStore {
    async fn enqueue(&self, entry: &QueueEntry) -> Result<()> {
        self.entries.lock().unwrap().push(entry.clone());
        Ok(())
    }

    async fn dequeue(&self, worker_id: &str) -> Result<Option<QueueEntry>> {
        let mut entries = self.entries.lock().unwrap();
        let best = entries
            .iter_mut()
            .filter(|e| e.status == QueueEntryStatus::Pending)
            .min_by_key(|e| (std::cmp::Reverse(e.priority.rank()), e.enqueued_at));
        Ok(best.map(|entry| {
            entry.status = QueueEntryStatus::Claimed;
            entry.claimed_by = Some(worker_id.to_string());
            entry.claimed_at = Some(Utc::now());
            entry.clone()
        }))
    }

    async fn complete(&self, id: ResourceId) -> Result<()> {
        let mut entries = self.entries.lock().unwrap();
        if let Some(entry) = entries.iter_mut().find(|e| e.id == id) {
            entry.status = QueueEntryStatus::Done;
        }
        Ok(())
    }

    async fn pending_depth(&self) -> Result<u64> {
        Ok(self
            .entries
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.status == QueueEntryStatus::Pending)
            .count() as u64)
    }

    async fn release_claimed_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let mut entries = self.entries.lock().unwrap();
        let mut released = 0;
        for entry in entries.iter_mut() {
            if entry.status == QueueEntryStatus::Claimed
                && entry.claimed_at.is_some_and(|at| at < cutoff)
            {
                entry.status = QueueEntryStatus::Pending;
                entry.claimed_by = None;
                entry.claimed_at = None;
                released += 1;
            }
        }
        Ok(released)
    }
}

#[derive(Default)]
pub struct MemoryAgentStore {
    agents: Mutex<HashMap<ResourceId, Agent>>,
}

#[async_trait]
impl AgentStore for MemoryAgentStore {
    async fn upsert(&self, agent: &Agent) -> Result<()> {
        self.agents.lock().unwrap().insert(agent.id, agent.clone());
        Ok(())
    }

    async fn get(&self, id: ResourceId) -> Result<Option<Agent>> {
        Ok(self.agents.lock().unwrap().get(&id).cloned())
    }

    async fn list(&self) -> Result<Vec<Agent>> {
        let mut agents: Vec<_> = self.agents.lock().unwrap().values().cloned().collect();
        agents.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(agents)
    }
}

#[derive(Default)]
pub struct MemoryCacheStore {
    entries: Mutex<Vec<CacheEntry>>,
}

#[async_trait]
impl CacheStore for MemoryCacheStore {
    async fn insert(&self, entry: &CacheEntry) -> Result<bool> {
        let mut entries = self.entries.lock().unwrap();
        if entries
            .iter()
            .any(|e| e.job_id == entry.job_id && e.cache_key == entry.cache_key)
        {
            return Ok(false);
        }
        entries.push(entry.clone());
        Ok(true)
    }

    async fn find_exact(
        &self,
        org_id: ResourceId,
        job_id: ResourceId,
        key: &str,
    ) -> Result<Option<CacheEntry>> {
        Ok(self
            .entries
            .lock()
            .unwrap()
            .iter()
            .find(|e| e.org_id == org_id && e.job_id == job_id && e.cache_key == key)
            .cloned())
    }

    async fn find_latest_with_prefix(
        &self,
        org_id: ResourceId,
        job_id: ResourceId,
        prefix: &str,
    ) -> Result<Option<CacheEntry>> {
        Ok(self
            .entries
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.org_id == org_id && e.job_id == job_id && e.cache_key.starts_with(prefix))
            .max_by_key(|e| e.created_at)
            .cloned())
    }

    async fn record_hit(&self, id: ResourceId) -> Result<()> {
        let mut entries = self.entries.lock().unwrap();
        if let Some(entry) = entries.iter_mut().find(|e| e.id == id) {
            entry.hit_count += 1;
        }
        Ok(())
    }

    async fn evict_older_than(&self, cutoff: DateTime<Utc>) -> Result<Vec<CacheEntry>> {
        let mut entries = self.entries.lock().unwrap();
        let (evicted, kept): (Vec<_>, Vec<_>) =
            entries.drain(..).partition(|e| e.created_at < cutoff);
        *entries = kept;
        Ok(evicted)
    }

    async fn evict_to_total_size(&self, max_total_bytes: i64) -> Result<Vec<CacheEntry>> {
        let mut entries = self.entries.lock().unwrap();
        // Newest entries survive; evict from the oldest end once the
        // running total passes the cap.
        entries.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        let mut running = 0;
        let mut keep = Vec::new();
        let mut evicted = Vec::new();
        for entry in entries.drain(..) {
            running += entry.size_bytes;
            if running <= max_total_bytes {
                keep.push(entry);
            } else {
                evicted.push(entry);
            }
        }
        *entries = keep;
        Ok(evicted)
    }
}

#[derive(Default)]
pub struct MemoryStageResultStore {
    entries: Mutex<HashMap<(ResourceId, String), StageCacheEntry>>,
}

#[async_trait]
impl StageResultStore for MemoryStageResultStore {
    async fn put(&self, entry: &StageCacheEntry) -> Result<bool> {
        let mut entries = self.entries.lock().unwrap();
        let key = (entry.job_id, entry.fingerprint.clone());
        if entries.contains_key(&key) {
            return Ok(false);
        }
        entries.insert(key, entry.clone());
        Ok(true)
    }

    async fn get(
        &self,
        org_id: ResourceId,
        job_id: ResourceId,
        fingerprint: &str,
    ) -> Result<Option<StageCacheEntry>> {
        Ok(self
            .entries
            .lock()
            .unwrap()
            .get(&(job_id, fingerprint.to_string()))
            .filter(|e| e.org_id == org_id)
            .cloned())
    }
}

#[derive(Default)]
pub struct MemoryApprovalStore {
    gates: Mutex<HashMap<ResourceId, ApprovalGate>>,
}

#[async_trait]
impl ApprovalStore for MemoryApprovalStore {
    async fn create(&self, gate: &ApprovalGate) -> Result<()> {
        self.gates.lock().unwrap().insert(gate.id, gate.clone());
        Ok(())
    }

    async fn get(&self, id: ResourceId) -> Result<ApprovalGate> {
        self.gates
            .lock()
            .unwrap()
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("approval gate {id}")))
    }

    async fn approve(&self, id: ResourceId, approver: &str) -> Result<ApprovalGate> {
        let mut gates = self.gates.lock().unwrap();
        let gate = gates
            .get_mut(&id)
            .ok_or_else(|| Error::NotFound(format!("approval gate {id}")))?;
        if gate.status.is_terminal() {
            return Err(Error::StoreConflict(format!(
                "gate {id} already {}",
                gate.status.as_str()
            )));
        }
        if !gate.approver_ids.iter().any(|a| a == approver) {
            gate.approver_ids.push(approver.to_string());
            gate.approval_count += 1;
        }
        if gate.approval_count >= gate.required_approvals {
            gate.status = GateStatus::Approved;
        }
        Ok(gate.clone())
    }

    async fn reject(&self, id: ResourceId, approver: &str) -> Result<ApprovalGate> {
        let mut gates = self.gates.lock().unwrap();
        let gate = gates
            .get_mut(&id)
            .ok_or_else(|| Error::NotFound(format!("approval gate {id}")))?;
        if gate.status.is_terminal() {
            return Err(Error::StoreConflict(format!(
                "gate {id} already {}",
                gate.status.as_str()
            )));
        }
        if !gate.approver_ids.iter().any(|a| a == approver) {
            gate.approver_ids.push(approver.to_string());
        }
        gate.status = GateStatus::Rejected;
        Ok(gate.clone())
    }

    async fn expire_due(&self, now: DateTime<Utc>) -> Result<Vec<ApprovalGate>> {
        let mut gates = self.gates.lock().unwrap();
        let mut expired = Vec::new();
        for gate in gates.values_mut() {
            if gate.status == GateStatus::Pending && gate.timeout_at <= now {
                gate.status = GateStatus::TimedOut;
                expired.push(gate.clone());
            }
        }
        Ok(expired)
    }
}

pub struct MemoryArtifactStore {
    builds: SharedBuilds,
    artifacts: Mutex<Vec<ArtifactRecord>>,
}

#[async_trait]
impl ArtifactStore for MemoryArtifactStore {
    async fn insert(&self, artifact: &ArtifactRecord) -> Result<()> {
        self.artifacts.lock().unwrap().push(artifact.clone());
        Ok(())
    }

    async fn get(&self, id: ResourceId) -> Result<Option<ArtifactRecord>> {
        Ok(self
            .artifacts
            .lock()
            .unwrap()
            .iter()
            .find(|a| a.id == id)
            .cloned())
    }

    async fn list_for_build(&self, build_id: ResourceId) -> Result<Vec<ArtifactRecord>> {
        let mut artifacts: Vec<_> = self
            .artifacts
            .lock()
            .unwrap()
            .iter()
            .filter(|a| a.build_id == build_id)
            .cloned()
            .collect();
        artifacts.sort_by(|a, b| a.filename.cmp(&b.filename));
        Ok(artifacts)
    }

    async fn find_latest_for_job(
        &self,
        org_id: ResourceId,
        job_id: ResourceId,
        filename: &str,
        before_build: ResourceId,
    ) -> Result<Option<ArtifactRecord>> {
        let builds = self.builds.lock().unwrap();
        Ok(self
            .artifacts
            .lock()
            .unwrap()
            .iter()
            .filter(|a| {
                a.org_id == org_id
                    && a.filename == filename
                    && a.build_id != before_build
                    && builds.get(&a.build_id).is_some_and(|b| b.job_id == job_id)
            })
            .max_by_key(|a| a.created_at)
            .cloned())
    }
}

#[derive(Default)]
pub struct MemorySecretStore {
    secrets: Mutex<Vec<SecretRecord>>,
    accesses: Mutex<Vec<SecretAccess>>,
}

#[async_trait]
impl SecretStore for MemorySecretStore {
    async fn put(&self, secret: &SecretRecord) -> Result<()> {
        let mut secrets = self.secrets.lock().unwrap();
        secrets.retain(|s| {
            !(s.org_id == secret.org_id && s.scope == secret.scope && s.name == secret.name)
        });
        secrets.push(secret.clone());
        Ok(())
    }

    async fn list_for_job(&self, org_id: ResourceId, job_id: ResourceId) -> Result<Vec<SecretRecord>> {
        Ok(self
            .secrets
            .lock()
            .unwrap()
            .iter()
            .filter(|s| {
                s.org_id == org_id
                    && match &s.scope {
                        SecretScope::Global => true,
                        SecretScope::Job(scoped) => *scoped == job_id,
                    }
            })
            .cloned()
            .collect())
    }

    async fn log_access(&self, access: &SecretAccess) -> Result<()> {
        self.accesses.lock().unwrap().push(access.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crucible_core::build::TriggerType;
    use crucible_core::queue::Priority;

    #[tokio::test]
    async fn build_numbers_increase_per_job() {
        let stores = memory_stores();
        let org = ResourceId::new();
        let job = ResourceId::new();
        let first = stores
            .builds
            .create(&Build::new(job, org, TriggerType::Manual, HashMap::new()))
            .await
            .unwrap();
        let second = stores
            .builds
            .create(&Build::new(job, org, TriggerType::Manual, HashMap::new()))
            .await
            .unwrap();
        assert_eq!(first.build_number, 1);
        assert_eq!(second.build_number, 2);
    }

    #[tokio::test]
    async fn finalize_is_idempotent_and_terminal_wins() {
        let stores = memory_stores();
        let build = stores
            .builds
            .create(&Build::new(
                ResourceId::new(),
                ResourceId::new(),
                TriggerType::Manual,
                HashMap::new(),
            ))
            .await
            .unwrap();
        assert!(stores
            .builds
            .finalize(build.id, BuildStatus::Failure, Some("boom"))
            .await
            .unwrap());
        assert!(!stores
            .builds
            .finalize(build.id, BuildStatus::Success, None)
            .await
            .unwrap());
        let stored = stores.builds.find(build.id).await.unwrap().unwrap();
        assert_eq!(stored.status, BuildStatus::Failure);
        assert_eq!(stored.error_message.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn concurrent_dequeue_claims_each_entry_once() {
        let stores = memory_stores();
        let org = ResourceId::new();
        let job = ResourceId::new();
        for _ in 0..20 {
            stores
                .queue
                .enqueue(&QueueEntry::new(org, job, Priority::Normal, serde_json::json!({})))
                .await
                .unwrap();
        }

        let mut handles = Vec::new();
        for worker in 0..4 {
            let queue = stores.queue.clone();
            handles.push(tokio::spawn(async move {
                let mut claimed = Vec::new();
                while let Some(entry) = queue.dequeue(&format!("w{worker}")).await.unwrap() {
                    claimed.push(entry.id);
                }
                claimed
            }));
        }

        let mut all = Vec::new();
        for handle in handles {
            all.extend(handle.await.unwrap());
        }
        all.sort();
        let total = all.len();
        all.dedup();
        assert_eq!(total, 20);
        assert_eq!(all.len(), 20, "an entry was claimed twice");
    }

    #[tokio::test]
    async fn dequeue_orders_by_priority_then_age() {
        let stores = memory_stores();
        let org = ResourceId::new();
        let job = ResourceId::new();
        let low = QueueEntry::new(org, job, Priority::Low, serde_json::json!(1));
        let high = QueueEntry::new(org, job, Priority::High, serde_json::json!(2));
        stores.queue.enqueue(&low).await.unwrap();
        stores.queue.enqueue(&high).await.unwrap();
        let first = stores.queue.dequeue("w").await.unwrap().unwrap();
        assert_eq!(first.id, high.id);
    }

    #[tokio::test]
    async fn approvals_count_each_approver_once() {
        let stores = memory_stores();
        let gate = ApprovalGate::pending(
            ResourceId::new(),
            ResourceId::new(),
            "Deploy",
            2,
            Utc::now() + chrono::Duration::minutes(5),
        );
        stores.approvals.create(&gate).await.unwrap();

        let after = stores.approvals.approve(gate.id, "alice").await.unwrap();
        assert_eq!(after.approval_count, 1);
        assert_eq!(after.status, GateStatus::Pending);

        // Same approver again does not move the count.
        let after = stores.approvals.approve(gate.id, "alice").await.unwrap();
        assert_eq!(after.approval_count, 1);

        let after = stores.approvals.approve(gate.id, "bob").await.unwrap();
        assert_eq!(after.approval_count, 2);
        assert_eq!(after.status, GateStatus::Approved);

        // Terminal gates conflict.
        let err = stores.approvals.approve(gate.id, "carol").await.unwrap_err();
        assert_eq!(err.kind(), "store-conflict");
    }

    #[tokio::test]
    async fn cache_evicts_oldest_past_size_cap() {
        let stores = memory_stores();
        let org = ResourceId::new();
        let job = ResourceId::new();
        for index in 0..4i64 {
            let entry = CacheEntry {
                id: ResourceId::new(),
                org_id: org,
                job_id: job,
                cache_key: format!("k{index}"),
                paths: vec![],
                size_bytes: 100,
                hit_count: 0,
                created_at: Utc::now() + chrono::Duration::seconds(index),
            };
            stores.cache.insert(&entry).await.unwrap();
        }

        let evicted = stores.cache.evict_to_total_size(250).await.unwrap();
        assert_eq!(evicted.len(), 2);
        // The two oldest were evicted.
        assert!(stores.cache.find_exact(org, job, "k0").await.unwrap().is_none());
        assert!(stores.cache.find_exact(org, job, "k1").await.unwrap().is_none());
        assert!(stores.cache.find_exact(org, job, "k3").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn cache_insert_is_first_write_wins() {
        let stores = memory_stores();
        let org = ResourceId::new();
        let job = ResourceId::new();
        let entry = CacheEntry {
            id: ResourceId::new(),
            org_id: org,
            job_id: job,
            cache_key: "deps-abc".into(),
            paths: vec!["node_modules".into()],
            size_bytes: 10,
            hit_count: 0,
            created_at: Utc::now(),
        };
        assert!(stores.cache.insert(&entry).await.unwrap());
        let mut duplicate = entry.clone();
        duplicate.id = ResourceId::new();
        assert!(!stores.cache.insert(&duplicate).await.unwrap());
        let found = stores.cache.find_exact(org, job, "deps-abc").await.unwrap().unwrap();
        assert_eq!(found.id, entry.id);
    }
}
