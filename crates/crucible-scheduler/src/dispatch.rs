//! Build dispatch.
//!
//! Routes a triggered build to the durable queue, a remote agent, or the
//! local pool. Candidate agents are filtered by labels, capacity, heartbeat
//! freshness, declared resource minima and breaker state, then scored on
//! free capacity, cpu and memory, with a locality bonus for a matching
//! region.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tracing::{info, warn};

use crucible_config::system::SystemConfig;
use crucible_core::agent::{Agent, AgentStatus};
use crucible_core::build::Build;
use crucible_core::job::Job;
use crucible_core::queue::{Priority, QueueEntry};
use crucible_core::store::Stores;
use crucible_core::{Error, Result};

use crate::breaker::BreakerRegistry;
use crate::registry::AgentRegistry;
use crate::runner::BuildRunner;

/// Declared minimum resources for candidate filtering.
#[derive(Debug, Clone, Copy, Default)]
pub struct ResourceMinima {
    pub cpu_cores: Option<u32>,
    pub memory_gb: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Parked in the durable queue; the drainer dispatches later.
    Queued,
    /// Running on the master's local pool.
    Local,
    /// Accepted by a remote agent.
    Remote(crucible_core::ResourceId),
}

pub struct Dispatcher {
    config: SystemConfig,
    stores: Stores,
    registry: Arc<AgentRegistry>,
    breakers: Arc<BreakerRegistry>,
    runner: Arc<BuildRunner>,
    client: reqwest::Client,
}

impl Dispatcher {
    pub fn new(
        config: SystemConfig,
        stores: Stores,
        registry: Arc<AgentRegistry>,
        breakers: Arc<BreakerRegistry>,
        runner: Arc<BuildRunner>,
    ) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .expect("reqwest client");
        Self {
            config,
            stores,
            registry,
            breakers,
            runner,
            client,
        }
    }

    /// Entry point for fresh triggers: with queueing enabled the build is
    /// parked durably and dispatched by the drainer.
    pub async fn dispatch(&self, build: &Build, job: &Job) -> Result<DispatchOutcome> {
        if self.config.queue_enabled {
            let entry = QueueEntry::new(
                build.org_id,
                job.id,
                job.priority.unwrap_or(Priority::Normal),
                json!({ "build_id": build.id }),
            );
            self.stores.queue.enqueue(&entry).await?;
            info!(build_id = %build.id, priority = entry.priority.as_str(), "build queued");
            return Ok(DispatchOutcome::Queued);
        }
        self.dispatch_now(build, job).await
    }

    /// Decide local vs remote and execute the decision.
    pub async fn dispatch_now(&self, build: &Build, job: &Job) -> Result<DispatchOutcome> {
        self.dispatch_now_with(build, job, ResourceMinima::default()).await
    }

    /// Like [`Self::dispatch_now`], with declared resource minima applied to
    /// candidate filtering.
    pub async fn dispatch_now_with(
        &self,
        build: &Build,
        job: &Job,
        minima: ResourceMinima,
    ) -> Result<DispatchOutcome> {
        if !self.config.distributed_dispatch {
            self.runner.submit(build.clone());
            return Ok(DispatchOutcome::Local);
        }

        let required: Vec<&str> = job.agent_labels.iter().map(String::as_str).collect();
        let mut candidates: Vec<Agent> = self
            .registry
            .list(Some(build.org_id))
            .into_iter()
            .filter(|agent| agent.status == AgentStatus::Online)
            .filter(|agent| agent.has_capacity())
            .filter(|agent| agent.matches_labels(required.iter().copied()))
            .filter(|agent| minima.cpu_cores.is_none_or(|min| agent.cpu_cores >= min))
            .filter(|agent| minima.memory_gb.is_none_or(|min| agent.memory_gb >= min))
            .filter(|agent| self.breakers.breaker_for(agent.id).allow_request())
            .collect();

        candidates.sort_by(|a, b| {
            score(b, None)
                .partial_cmp(&score(a, None))
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        for agent in candidates {
            match self.post_dispatch(&agent, build, job).await {
                Ok(()) => {
                    self.stores.builds.set_dispatched(build.id, agent.id).await?;
                    self.registry.note_dispatched(agent.id);
                    self.breakers.breaker_for(agent.id).record_success();
                    info!(build_id = %build.id, agent = %agent.name, "build dispatched");
                    return Ok(DispatchOutcome::Remote(agent.id));
                }
                Err(e) => {
                    warn!(build_id = %build.id, agent = %agent.name, error = %e, "dispatch attempt failed");
                    self.breakers.breaker_for(agent.id).record_failure();
                }
            }
        }

        if self.config.fallback_local {
            info!(build_id = %build.id, "no agent available, falling back to local pool");
            self.runner.submit(build.clone());
            return Ok(DispatchOutcome::Local);
        }

        Err(Error::NoAgentAvailable(format!(
            "no agent matches labels {:?}",
            job.agent_labels
        )))
    }

    async fn post_dispatch(&self, agent: &Agent, build: &Build, job: &Job) -> Result<()> {
        let url = format!("{}/builds", agent.url.trim_end_matches('/'));
        let body = json!({
            "build_id": build.id,
            "job_id": job.id,
            "org_id": build.org_id,
            "pipeline_value": job.pipeline_value,
            "parameters": build.parameters,
            "env": {},
        });
        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.config.agent_token)
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::DispatchFailed(format!("{url}: {e}")))?;
        if response.status().as_u16() != 202 {
            return Err(Error::DispatchFailed(format!(
                "{url}: status {}",
                response.status()
            )));
        }
        Ok(())
    }
}

/// Weighted score: free capacity dominates, cpu and memory break ties, and a
/// matching region adds a locality bonus.
pub fn score(agent: &Agent, preferred_region: Option<&str>) -> f64 {
    let capacity = if agent.max_builds == 0 {
        0.0
    } else {
        1.0 - agent.current_builds as f64 / agent.max_builds as f64
    };
    let cpu = (agent.cpu_cores as f64 / 16.0).min(1.0);
    let memory = (agent.memory_gb as f64 / 64.0).min(1.0);
    let mut total = capacity * 0.6 + cpu * 0.2 + memory * 0.2;
    if let (Some(preferred), Some(region)) = (preferred_region, agent.region.as_deref()) {
        if preferred == region {
            total += 0.1;
        }
    }
    total
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use crucible_core::ResourceId;
    use crucible_core::build::{BuildStatus, TriggerType};
    use crucible_core::hooks::{AllowAllPolicy, NoopNotifier, NoopStatusReporter};
    use crucible_core::pipeline::{Pipeline, Stage, Step};
    use crucible_db::memory::memory_stores;
    use crucible_executor::bus::EventBus;
    use crucible_executor::process::ProcessRunner;
    use crucible_executor::run::{Executor, ExecutorDeps};
    use crucible_executor::steps::StepRegistry;
    use std::collections::{BTreeSet, HashMap};

    fn agent(name: &str, current: u32, max: u32, cpu: u32, memory: u32) -> Agent {
        Agent {
            id: ResourceId::new(),
            org_id: None,
            name: name.into(),
            url: "http://127.0.0.1:1".into(),
            labels: BTreeSet::new(),
            max_builds: max,
            current_builds: current,
            cpu_cores: cpu,
            memory_gb: memory,
            region: None,
            last_heartbeat_at: Utc::now(),
            status: AgentStatus::Online,
        }
    }

    #[test]
    fn score_prefers_free_capacity() {
        let idle = agent("idle", 0, 4, 8, 16);
        let busy = agent("busy", 3, 4, 8, 16);
        assert!(score(&idle, None) > score(&busy, None));
    }

    #[test]
    fn score_applies_region_bonus() {
        let mut near = agent("near", 0, 4, 8, 16);
        near.region = Some("eu-1".into());
        let far = agent("far", 0, 4, 8, 16);
        assert!(score(&near, Some("eu-1")) > score(&far, Some("eu-1")));
        assert_eq!(score(&near, None), score(&far, None));
    }

    fn dispatcher(config: SystemConfig) -> (Dispatcher, Stores, ResourceId, tempfile::TempDir) {
        let stores = memory_stores();
        let bus = Arc::new(EventBus::new(stores.events.clone()));
        let ws = tempfile::tempdir().unwrap();
        let mut exec_config = config.clone();
        exec_config.workspace_root = ws.path().join("ws");
        exec_config.artifact_root = ws.path().join("artifacts");
        exec_config.cache_root = ws.path().join("cache");

        let executor = Executor::new(ExecutorDeps {
            stores: stores.clone(),
            bus,
            config: exec_config,
            formats: Arc::new(crucible_config::formats::FormatRegistry::with_defaults()),
            registry: Arc::new(StepRegistry::with_defaults(Arc::new(ProcessRunner::new()))),
            scm: None,
            policy: Arc::new(AllowAllPolicy),
            notifier: Arc::new(NoopNotifier),
            scm_status: Arc::new(NoopStatusReporter),
            vault: None,
            approval_poll: Duration::from_millis(20),
        });
        let runner = BuildRunner::new(executor, stores.clone(), 2);
        let registry = Arc::new(AgentRegistry::new(None, Duration::from_secs(90)));
        let breakers = Arc::new(BreakerRegistry::new(Default::default()));
        let org = ResourceId::new();
        (
            Dispatcher::new(config, stores.clone(), registry, breakers, runner),
            stores,
            org,
            ws,
        )
    }

    async fn job_and_build(stores: &Stores, org: ResourceId, labels: Vec<String>) -> (Job, Build) {
        let mut job = Job::new(org, format!("job-{}", ResourceId::new()));
        job.agent_labels = labels;
        job.pipeline_value = Some(Pipeline {
            stages: vec![Stage::new("S", vec![Step::shell("c", "echo ok")])],
            ..Default::default()
        });
        stores.jobs.create(&job).await.unwrap();
        let build = stores
            .builds
            .create(&Build::new(job.id, org, TriggerType::Manual, HashMap::new()))
            .await
            .unwrap();
        (job, build)
    }

    #[tokio::test]
    async fn queue_path_parks_the_build() {
        let mut config = SystemConfig::default();
        config.queue_enabled = true;
        let (dispatcher, stores, org, _ws) = dispatcher(config);
        let (job, build) = job_and_build(&stores, org, vec![]).await;

        let outcome = dispatcher.dispatch(&build, &job).await.unwrap();
        assert_eq!(outcome, DispatchOutcome::Queued);
        assert_eq!(stores.queue.pending_depth().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn local_when_distributed_dispatch_disabled() {
        let (dispatcher, stores, org, _ws) = dispatcher(SystemConfig::default());
        let (job, build) = job_and_build(&stores, org, vec![]).await;
        let outcome = dispatcher.dispatch(&build, &job).await.unwrap();
        assert_eq!(outcome, DispatchOutcome::Local);
    }

    #[tokio::test]
    async fn no_candidates_without_fallback_fails_with_no_agent_available() {
        let mut config = SystemConfig::default();
        config.distributed_dispatch = true;
        config.fallback_local = false;
        let (dispatcher, stores, org, _ws) = dispatcher(config);
        let (job, build) = job_and_build(&stores, org, vec!["gpu".to_string()]).await;

        let err = dispatcher.dispatch(&build, &job).await.unwrap_err();
        assert_eq!(err.kind(), "no-agent-available");
        // The build never ran: no stage records were produced.
        assert!(stores.stages.list_for_build(build.id).await.unwrap().is_empty());
        let stored = stores.builds.find(build.id).await.unwrap().unwrap();
        assert_eq!(stored.status, BuildStatus::Queued);
    }

    #[tokio::test]
    async fn no_candidates_with_fallback_runs_locally() {
        let mut config = SystemConfig::default();
        config.distributed_dispatch = true;
        config.fallback_local = true;
        let (dispatcher, stores, org, _ws) = dispatcher(config);
        let (job, build) = job_and_build(&stores, org, vec!["gpu".to_string()]).await;
        let outcome = dispatcher.dispatch(&build, &job).await.unwrap();
        assert_eq!(outcome, DispatchOutcome::Local);
    }
}
