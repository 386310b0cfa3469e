//! Store contracts.
//!
//! Abstract persistence for every entity the orchestration core touches.
//! Implementations must provide transactional writes where multiple rows are
//! involved, index-backed queries by `org_id`, and portable ordering
//! semantics. Every write belonging to a build inherits the build's
//! `org_id`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;

use crate::ResourceId;
use crate::agent::Agent;
use crate::approval::ApprovalGate;
use crate::artifact::ArtifactRecord;
use crate::build::{Build, BuildStatus, GitInfo, PipelineSource, StageRecord, StepRecord};
use crate::cache::{CacheEntry, StageCacheEntry};
use crate::event::{BuildEvent, EventId};
use crate::job::Job;
use crate::queue::QueueEntry;
use crate::secret::{SecretAccess, SecretRecord};
use crate::Result;

#[async_trait]
pub trait JobStore: Send + Sync {
    async fn create(&self, job: &Job) -> Result<()>;
    async fn get(&self, org_id: ResourceId, id: ResourceId) -> Result<Job>;
    async fn find_by_name(&self, org_id: ResourceId, name: &str) -> Result<Option<Job>>;
    async fn list(&self, org_id: ResourceId) -> Result<Vec<Job>>;
}

#[async_trait]
pub trait BuildStore: Send + Sync {
    /// Insert the build, allocating the next per-job build number. Returns
    /// the stored record.
    async fn create(&self, build: &Build) -> Result<Build>;
    async fn get(&self, org_id: ResourceId, id: ResourceId) -> Result<Build>;
    /// Internal lookup without an org filter, for trusted master-side paths
    /// (orphan monitor, agent result ingestion).
    async fn find(&self, id: ResourceId) -> Result<Option<Build>>;
    /// Transition to `running`, recording the workspace. No-op when the
    /// build is already terminal.
    async fn mark_running(&self, id: ResourceId, workspace_path: &str) -> Result<()>;
    async fn set_git(&self, id: ResourceId, git: &GitInfo) -> Result<()>;
    async fn set_pipeline_source(&self, id: ResourceId, source: PipelineSource) -> Result<()>;
    async fn set_dispatched(&self, id: ResourceId, agent_id: ResourceId) -> Result<()>;
    /// Idempotent terminal transition. Returns false when the build was
    /// already terminal (the stored status wins).
    async fn finalize(
        &self,
        id: ResourceId,
        status: BuildStatus,
        error_message: Option<&str>,
    ) -> Result<bool>;
    /// Most recent non-failed build for the same job and commit, used by the
    /// deduplication window.
    async fn find_recent_for_commit(
        &self,
        org_id: ResourceId,
        job_id: ResourceId,
        commit: &str,
        since: DateTime<Utc>,
    ) -> Result<Option<Build>>;
    async fn list_for_job(
        &self,
        org_id: ResourceId,
        job_id: ResourceId,
        limit: i64,
    ) -> Result<Vec<Build>>;
    async fn list_by_status(&self, status: BuildStatus) -> Result<Vec<Build>>;
}

#[async_trait]
pub trait StageStore: Send + Sync {
    async fn insert(&self, stage: &StageRecord) -> Result<()>;
    async fn update(&self, stage: &StageRecord) -> Result<()>;
    async fn list_for_build(&self, build_id: ResourceId) -> Result<Vec<StageRecord>>;
}

#[async_trait]
pub trait StepStore: Send + Sync {
    async fn insert(&self, step: &StepRecord) -> Result<()>;
    async fn update(&self, step: &StepRecord) -> Result<()>;
    async fn list_for_build(&self, build_id: ResourceId) -> Result<Vec<StepRecord>>;
}

#[async_trait]
pub trait EventStore: Send + Sync {
    async fn append(&self, event: &BuildEvent) -> Result<()>;
    /// Events for a build strictly after the cursor, in `event_id` order.
    async fn replay(
        &self,
        build_id: ResourceId,
        after: Option<&EventId>,
        limit: usize,
    ) -> Result<Vec<BuildEvent>>;
    /// TTL cleanup. Returns the number of deleted events.
    async fn delete_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64>;
}

#[async_trait]
pub trait QueueStore: Send + Sync {
    async fn enqueue(&self, entry: &QueueEntry) -> Result<()>;
    /// Transactional exactly-once claim of the highest-priority oldest
    /// pending entry.
    async fn dequeue(&self, worker_id: &str) -> Result<Option<QueueEntry>>;
    async fn complete(&self, id: ResourceId) -> Result<()>;
    async fn pending_depth(&self) -> Result<u64>;
    /// Release entries claimed before `cutoff` back to pending (claimer
    /// died mid-dispatch). Returns the number released.
    async fn release_claimed_before(&self, cutoff: DateTime<Utc>) -> Result<u64>;
}

#[async_trait]
pub trait AgentStore: Send + Sync {
    async fn upsert(&self, agent: &Agent) -> Result<()>;
    async fn get(&self, id: ResourceId) -> Result<Option<Agent>>;
    async fn list(&self) -> Result<Vec<Agent>>;
}

#[async_trait]
pub trait CacheStore: Send + Sync {
    /// First-write-wins. Returns false when the key already existed.
    async fn insert(&self, entry: &CacheEntry) -> Result<bool>;
    async fn find_exact(
        &self,
        org_id: ResourceId,
        job_id: ResourceId,
        key: &str,
    ) -> Result<Option<CacheEntry>>;
    /// Most recent entry whose key begins with `prefix`.
    async fn find_latest_with_prefix(
        &self,
        org_id: ResourceId,
        job_id: ResourceId,
        prefix: &str,
    ) -> Result<Option<CacheEntry>>;
    async fn record_hit(&self, id: ResourceId) -> Result<()>;
    /// Remove entries older than the cutoff, returning them so the caller
    /// can delete the backing files.
    async fn evict_older_than(&self, cutoff: DateTime<Utc>) -> Result<Vec<CacheEntry>>;
    /// Evict oldest-first until the remaining total size fits under
    /// `max_total_bytes`, returning the evicted entries.
    async fn evict_to_total_size(&self, max_total_bytes: i64) -> Result<Vec<CacheEntry>>;
}

#[async_trait]
pub trait StageResultStore: Send + Sync {
    /// First-write-wins per `(job_id, fingerprint)`. Returns false when the
    /// fingerprint already existed.
    async fn put(&self, entry: &StageCacheEntry) -> Result<bool>;
    async fn get(
        &self,
        org_id: ResourceId,
        job_id: ResourceId,
        fingerprint: &str,
    ) -> Result<Option<StageCacheEntry>>;
}

#[async_trait]
pub trait ApprovalStore: Send + Sync {
    async fn create(&self, gate: &ApprovalGate) -> Result<()>;
    async fn get(&self, id: ResourceId) -> Result<ApprovalGate>;
    /// Atomically record one approval. Approvers are counted once; the gate
    /// flips to approved when the threshold is reached. Errors with
    /// `store-conflict` when the gate is already terminal.
    async fn approve(&self, id: ResourceId, approver: &str) -> Result<ApprovalGate>;
    async fn reject(&self, id: ResourceId, approver: &str) -> Result<ApprovalGate>;
    /// Move pending gates past their deadline to timed-out; returns the
    /// transitioned gates.
    async fn expire_due(&self, now: DateTime<Utc>) -> Result<Vec<ApprovalGate>>;
}

#[async_trait]
pub trait ArtifactStore: Send + Sync {
    async fn insert(&self, artifact: &ArtifactRecord) -> Result<()>;
    async fn get(&self, id: ResourceId) -> Result<Option<ArtifactRecord>>;
    async fn list_for_build(&self, build_id: ResourceId) -> Result<Vec<ArtifactRecord>>;
    /// Latest artifact of `filename` among this job's earlier builds; the
    /// delta encoder's base.
    async fn find_latest_for_job(
        &self,
        org_id: ResourceId,
        job_id: ResourceId,
        filename: &str,
        before_build: ResourceId,
    ) -> Result<Option<ArtifactRecord>>;
}

#[async_trait]
pub trait SecretStore: Send + Sync {
    async fn put(&self, secret: &SecretRecord) -> Result<()>;
    /// Global secrets plus those scoped to the job.
    async fn list_for_job(&self, org_id: ResourceId, job_id: ResourceId) -> Result<Vec<SecretRecord>>;
    async fn log_access(&self, access: &SecretAccess) -> Result<()>;
}

/// Non-blocking named lock tied to the holder's connection or process.
#[async_trait]
pub trait LeaderLock: Send + Sync {
    /// Attempt to take the lock; true when this caller is now the leader.
    async fn try_acquire(&self, name: &str) -> Result<bool>;
    async fn release(&self, name: &str) -> Result<()>;
}

/// The full store bundle handed to the executor and schedulers.
#[derive(Clone)]
pub struct Stores {
    pub jobs: Arc<dyn JobStore>,
    pub builds: Arc<dyn BuildStore>,
    pub stages: Arc<dyn StageStore>,
    pub steps: Arc<dyn StepStore>,
    pub events: Arc<dyn EventStore>,
    pub queue: Arc<dyn QueueStore>,
    pub agents: Arc<dyn AgentStore>,
    pub cache: Arc<dyn CacheStore>,
    pub stage_results: Arc<dyn StageResultStore>,
    pub approvals: Arc<dyn ApprovalStore>,
    pub artifacts: Arc<dyn ArtifactStore>,
    pub secrets: Arc<dyn SecretStore>,
}
