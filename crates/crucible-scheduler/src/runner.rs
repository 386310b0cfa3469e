//! The local build runner.
//!
//! A bounded worker pool on the master, a registry of active builds mapping
//! build id to cancellation flag and task handle, and the orphan monitor for
//! builds whose agent went silent.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{Semaphore, watch};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crucible_core::build::{Build, BuildStatus};
use crucible_core::store::Stores;
use crucible_core::{Error, ResourceId, Result};
use crucible_executor::Executor;

use crate::registry::AgentRegistry;

struct ActiveBuild {
    cancel: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

pub struct BuildRunner {
    executor: Arc<Executor>,
    stores: Stores,
    pool: Arc<Semaphore>,
    active: Mutex<HashMap<ResourceId, ActiveBuild>>,
}

impl BuildRunner {
    pub fn new(executor: Arc<Executor>, stores: Stores, max_local_builds: usize) -> Arc<Self> {
        Arc::new(Self {
            executor,
            stores,
            pool: Arc::new(Semaphore::new(max_local_builds.max(1))),
            active: Mutex::new(HashMap::new()),
        })
    }

    /// Schedule a build on the local pool. The build record must already
    /// exist; it stays `queued` until a pool slot frees up.
    pub fn submit(self: &Arc<Self>, build: Build) {
        let build_id = build.id;
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let runner = self.clone();

        let handle = tokio::spawn(async move {
            let permit = match runner.pool.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => {
                    error!(build_id = %build_id, "build pool closed");
                    return;
                }
            };
            let result = runner.executor.execute(build, cancel_rx).await;
            drop(permit);
            if let Err(e) = &result {
                warn!(build_id = %build_id, kind = e.kind(), error = %e, "build ended with error");
            }
            runner.finalize(build_id);
        });

        self.active.lock().unwrap().insert(
            build_id,
            ActiveBuild {
                cancel: cancel_tx,
                handle,
            },
        );
        info!(build_id = %build_id, "build submitted to local pool");
    }

    /// Cooperative cancellation: set the flag; the executor observes it at
    /// stage/step boundaries and inside the process wait loop.
    pub fn cancel(&self, build_id: ResourceId) -> Result<()> {
        let active = self.active.lock().unwrap();
        match active.get(&build_id) {
            Some(entry) => {
                let _ = entry.cancel.send(true);
                info!(build_id = %build_id, "cancellation requested");
                Ok(())
            }
            None => Err(Error::NotFound(format!("active build {build_id}"))),
        }
    }

    /// Idempotent removal from the active registry.
    pub fn finalize(&self, build_id: ResourceId) {
        if self.active.lock().unwrap().remove(&build_id).is_some() {
            info!(build_id = %build_id, "build removed from active registry");
        }
    }

    pub fn active_count(&self) -> usize {
        self.active.lock().unwrap().len()
    }

    pub fn is_active(&self, build_id: ResourceId) -> bool {
        self.active.lock().unwrap().contains_key(&build_id)
    }

    /// Wait for a specific build to leave the pool (used by tests and
    /// drain-on-shutdown).
    pub async fn wait_for(&self, build_id: ResourceId) {
        let handle = {
            let mut active = self.active.lock().unwrap();
            active.get_mut(&build_id).map(|entry| {
                // Move the handle out; finalize() removes the entry.
                std::mem::replace(&mut entry.handle, tokio::spawn(async {}))
            })
        };
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    /// Fail builds left `running` by a previous master that never handed
    /// them to an agent. Runs once on startup, before the queue drainer.
    pub async fn recover_interrupted(stores: &Stores) -> Result<u64> {
        let running = stores.builds.list_by_status(BuildStatus::Running).await?;
        let mut recovered = 0;
        for build in running {
            if build.agent_id.is_none() {
                stores
                    .builds
                    .finalize(build.id, BuildStatus::Failure, Some("interrupted by master restart"))
                    .await?;
                recovered += 1;
            }
        }
        if recovered > 0 {
            warn!(count = recovered, "recovered interrupted builds");
        }
        Ok(recovered)
    }
}

/// Periodically aborts `running` builds whose assigned agent has stopped
/// heartbeating past the stale threshold plus a grace period.
pub struct OrphanMonitor {
    stores: Stores,
    registry: Arc<AgentRegistry>,
    stale_after: Duration,
    grace: Duration,
    interval: Duration,
}

impl OrphanMonitor {
    pub fn new(
        stores: Stores,
        registry: Arc<AgentRegistry>,
        stale_after: Duration,
        grace: Duration,
        interval: Duration,
    ) -> Self {
        Self {
            stores,
            registry,
            stale_after,
            grace,
            interval,
        }
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!("orphan monitor started");
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
                _ = tokio::time::sleep(self.interval) => {
                    if let Err(e) = self.scan().await {
                        error!(error = %e, "orphan scan failed");
                    }
                }
            }
        }
        info!("orphan monitor stopped");
    }

    pub async fn scan(&self) -> Result<u64> {
        let running = self.stores.builds.list_by_status(BuildStatus::Running).await?;
        let cutoff = self.stale_after + self.grace;
        let mut orphaned = 0;
        for build in running {
            let Some(agent_id) = build.agent_id else {
                continue;
            };
            let silent_for = match self.registry.get(agent_id) {
                Some(agent) => Utc::now()
                    .signed_duration_since(agent.last_heartbeat_at)
                    .to_std()
                    .unwrap_or_default(),
                // An agent the registry has never seen counts as silent
                // since dispatch.
                None => build
                    .dispatched_at
                    .map(|at| Utc::now().signed_duration_since(at).to_std().unwrap_or_default())
                    .unwrap_or_default(),
            };
            if silent_for > cutoff {
                warn!(build_id = %build.id, agent_id = %agent_id, "orphaned build detected");
                self.stores
                    .builds
                    .finalize(
                        build.id,
                        BuildStatus::Aborted,
                        Some(&format!("orphaned: agent {agent_id} stopped heartbeating")),
                    )
                    .await?;
                orphaned += 1;
            }
        }
        Ok(orphaned)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crucible_config::formats::FormatRegistry;
    use crucible_config::system::SystemConfig;
    use crucible_core::build::TriggerType;
    use crucible_core::hooks::{AllowAllPolicy, NoopNotifier, NoopStatusReporter};
    use crucible_core::job::Job;
    use crucible_core::pipeline::{Pipeline, Stage, Step};
    use crucible_db::memory::memory_stores;
    use crucible_executor::bus::EventBus;
    use crucible_executor::process::ProcessRunner;
    use crucible_executor::run::ExecutorDeps;
    use crucible_executor::steps::StepRegistry;

    struct Rig {
        stores: Stores,
        runner: Arc<BuildRunner>,
        org: ResourceId,
        _dirs: Vec<tempfile::TempDir>,
    }

    fn rig(max_local: usize) -> Rig {
        let stores = memory_stores();
        let bus = Arc::new(EventBus::new(stores.events.clone()));
        let dirs = vec![
            tempfile::tempdir().unwrap(),
            tempfile::tempdir().unwrap(),
            tempfile::tempdir().unwrap(),
        ];
        let mut config = SystemConfig::default();
        config.workspace_root = dirs[0].path().to_path_buf();
        config.artifact_root = dirs[1].path().to_path_buf();
        config.cache_root = dirs[2].path().to_path_buf();

        let executor = Executor::new(ExecutorDeps {
            stores: stores.clone(),
            bus,
            config,
            formats: Arc::new(FormatRegistry::with_defaults()),
            registry: Arc::new(StepRegistry::with_defaults(Arc::new(ProcessRunner::new()))),
            scm: None,
            policy: Arc::new(AllowAllPolicy),
            notifier: Arc::new(NoopNotifier),
            scm_status: Arc::new(NoopStatusReporter),
            vault: None,
            approval_poll: Duration::from_millis(20),
        });
        let runner = BuildRunner::new(executor, stores.clone(), max_local);
        Rig {
            stores,
            runner,
            org: ResourceId::new(),
            _dirs: dirs,
        }
    }

    async fn job_with_command(rig: &Rig, command: &str) -> Job {
        let mut job = Job::new(rig.org, format!("job-{}", ResourceId::new()));
        job.pipeline_value = Some(Pipeline {
            stages: vec![Stage::new("S", vec![Step::shell("c", command)])],
            ..Default::default()
        });
        rig.stores.jobs.create(&job).await.unwrap();
        job
    }

    #[tokio::test]
    async fn submit_runs_and_clears_registry() {
        let rig = rig(2);
        let job = job_with_command(&rig, "echo ok").await;
        let build = rig
            .stores
            .builds
            .create(&Build::new(job.id, rig.org, TriggerType::Manual, HashMap::new()))
            .await
            .unwrap();
        rig.runner.submit(build.clone());
        assert!(rig.runner.is_active(build.id));
        rig.runner.wait_for(build.id).await;

        assert_eq!(rig.runner.active_count(), 0);
        let stored = rig.stores.builds.find(build.id).await.unwrap().unwrap();
        assert_eq!(stored.status, BuildStatus::Success);
    }

    #[tokio::test]
    async fn cancel_aborts_running_build() {
        let rig = rig(2);
        let job = job_with_command(&rig, "sleep 30").await;
        let build = rig
            .stores
            .builds
            .create(&Build::new(job.id, rig.org, TriggerType::Manual, HashMap::new()))
            .await
            .unwrap();
        rig.runner.submit(build.clone());
        tokio::time::sleep(Duration::from_millis(300)).await;
        rig.runner.cancel(build.id).unwrap();
        rig.runner.wait_for(build.id).await;

        let stored = rig.stores.builds.find(build.id).await.unwrap().unwrap();
        assert_eq!(stored.status, BuildStatus::Aborted);
    }

    #[tokio::test]
    async fn cancel_unknown_build_is_not_found() {
        let rig = rig(1);
        assert!(rig.runner.cancel(ResourceId::new()).is_err());
    }

    #[tokio::test]
    async fn recover_interrupted_fails_local_running_builds() {
        let rig = rig(1);
        let job = job_with_command(&rig, "echo ok").await;
        let build = rig
            .stores
            .builds
            .create(&Build::new(job.id, rig.org, TriggerType::Manual, HashMap::new()))
            .await
            .unwrap();
        rig.stores.builds.mark_running(build.id, "/tmp/ws").await.unwrap();

        let recovered = BuildRunner::recover_interrupted(&rig.stores).await.unwrap();
        assert_eq!(recovered, 1);
        let stored = rig.stores.builds.find(build.id).await.unwrap().unwrap();
        assert_eq!(stored.status, BuildStatus::Failure);
    }

    #[tokio::test]
    async fn orphan_monitor_aborts_builds_on_silent_agents() {
        let rig = rig(1);
        let registry = Arc::new(AgentRegistry::new(None, Duration::from_millis(0)));
        let job = job_with_command(&rig, "echo ok").await;
        let build = rig
            .stores
            .builds
            .create(&Build::new(job.id, rig.org, TriggerType::Manual, HashMap::new()))
            .await
            .unwrap();
        rig.stores.builds.mark_running(build.id, "/tmp/ws").await.unwrap();
        rig.stores
            .builds
            .set_dispatched(build.id, ResourceId::new())
            .await
            .unwrap();

        let monitor = OrphanMonitor::new(
            rig.stores.clone(),
            registry,
            Duration::from_millis(0),
            Duration::from_millis(0),
            Duration::from_secs(3600),
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
        let orphaned = monitor.scan().await.unwrap();
        assert_eq!(orphaned, 1);

        let stored = rig.stores.builds.find(build.id).await.unwrap().unwrap();
        assert_eq!(stored.status, BuildStatus::Aborted);
        assert!(stored.error_message.unwrap().starts_with("orphaned"));
    }
}
