//! The queue drainer.
//!
//! Runs on the leader: claims entries one at a time (exactly-once via the
//! store's transactional dequeue) and hands each to the dispatcher. Stale
//! claims from a crashed drainer are periodically released back to pending.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crucible_core::ResourceId;
use crucible_core::queue::QueueEntry;
use crucible_core::store::Stores;
use crucible_core::{Error, Result};

use crate::dispatch::Dispatcher;

/// Claims older than this are assumed abandoned by a dead drainer.
const STALE_CLAIM: Duration = Duration::from_secs(300);

pub struct QueueProcessor {
    stores: Stores,
    dispatcher: Arc<Dispatcher>,
    worker_id: String,
    idle_wait: Duration,
}

impl QueueProcessor {
    pub fn new(stores: Stores, dispatcher: Arc<Dispatcher>, worker_id: impl Into<String>) -> Self {
        Self {
            stores,
            dispatcher,
            worker_id: worker_id.into(),
            idle_wait: Duration::from_secs(1),
        }
    }

    pub fn with_idle_wait(mut self, idle_wait: Duration) -> Self {
        self.idle_wait = idle_wait;
        self
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(worker_id = %self.worker_id, "queue processor started");
        let mut stale_sweep = tokio::time::interval(STALE_CLAIM);
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
                _ = stale_sweep.tick() => {
                    match self.stores.queue.release_claimed_before(Utc::now() - chrono::Duration::from_std(STALE_CLAIM).unwrap()).await {
                        Ok(0) => {}
                        Ok(released) => warn!(released, "released stale queue claims"),
                        Err(e) => error!(error = %e, "stale claim sweep failed"),
                    }
                }
                claimed = self.stores.queue.dequeue(&self.worker_id) => {
                    match claimed {
                        Ok(Some(entry)) => {
                            if let Err(e) = self.process(&entry).await {
                                error!(entry_id = %entry.id, error = %e, "queue entry processing failed");
                            }
                            if let Err(e) = self.stores.queue.complete(entry.id).await {
                                error!(entry_id = %entry.id, error = %e, "queue completion failed");
                            }
                        }
                        Ok(None) => {
                            tokio::time::sleep(self.idle_wait).await;
                        }
                        Err(e) => {
                            warn!(error = %e, "queue dequeue failed");
                            tokio::time::sleep(self.idle_wait.max(Duration::from_secs(5))).await;
                        }
                    }
                }
            }
        }
        info!(worker_id = %self.worker_id, "queue processor stopped");
    }

    /// Dispatch the claimed entry's build.
    pub async fn process(&self, entry: &QueueEntry) -> Result<()> {
        let build_id: ResourceId = entry
            .payload
            .get("build_id")
            .and_then(|v| v.as_str())
            .ok_or_else(|| Error::QueueStalled(format!("entry {} has no build_id", entry.id)))?
            .parse()
            .map_err(|e| Error::QueueStalled(format!("entry {}: {e}", entry.id)))?;

        let build = self
            .stores
            .builds
            .find(build_id)
            .await?
            .ok_or_else(|| Error::QueueStalled(format!("queued build {build_id} is gone")))?;
        if build.status.is_terminal() {
            info!(build_id = %build_id, "queued build already terminal, skipping");
            return Ok(());
        }
        let job = self.stores.jobs.get(build.org_id, build.job_id).await?;
        self.dispatcher.dispatch_now(&build, &job).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crucible_config::system::SystemConfig;
    use crucible_core::build::{Build, BuildStatus, TriggerType};
    use crucible_core::hooks::{AllowAllPolicy, NoopNotifier, NoopStatusReporter};
    use crucible_core::job::Job;
    use crucible_core::pipeline::{Pipeline, Stage, Step};
    use crucible_db::memory::memory_stores;
    use crucible_executor::bus::EventBus;
    use crucible_executor::process::ProcessRunner;
    use crucible_executor::run::{Executor, ExecutorDeps};
    use crucible_executor::steps::StepRegistry;
    use crate::breaker::BreakerRegistry;
    use crate::registry::AgentRegistry;
    use crate::runner::BuildRunner;
    use std::collections::HashMap;

    #[tokio::test]
    async fn processes_queued_build_to_completion() {
        let stores = memory_stores();
        let bus = Arc::new(EventBus::new(stores.events.clone()));
        let dirs = tempfile::tempdir().unwrap();
        let mut config = SystemConfig::default();
        config.queue_enabled = true;
        config.workspace_root = dirs.path().join("ws");
        config.artifact_root = dirs.path().join("artifacts");
        config.cache_root = dirs.path().join("cache");

        let executor = Executor::new(ExecutorDeps {
            stores: stores.clone(),
            bus,
            config: config.clone(),
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
        let dispatcher = Arc::new(Dispatcher::new(
            config,
            stores.clone(),
            Arc::new(AgentRegistry::new(None, Duration::from_secs(90))),
            Arc::new(BreakerRegistry::new(Default::default())),
            runner.clone(),
        ));

        let org = ResourceId::new();
        let mut job = Job::new(org, "queued-job");
        job.pipeline_value = Some(Pipeline {
            stages: vec![Stage::new("S", vec![Step::shell("c", "echo ok")])],
            ..Default::default()
        });
        stores.jobs.create(&job).await.unwrap();
        let build = stores
            .builds
            .create(&Build::new(job.id, org, TriggerType::Api, HashMap::new()))
            .await
            .unwrap();

        // Trigger path: enqueue.
        dispatcher.dispatch(&build, &job).await.unwrap();
        assert_eq!(stores.queue.pending_depth().await.unwrap(), 1);

        // Drainer path: claim, dispatch locally, complete.
        let processor = QueueProcessor::new(stores.clone(), dispatcher, "drainer-test");
        let entry = stores.queue.dequeue("drainer-test").await.unwrap().unwrap();
        processor.process(&entry).await.unwrap();
        stores.queue.complete(entry.id).await.unwrap();

        runner.wait_for(build.id).await;
        let stored = stores.builds.find(build.id).await.unwrap().unwrap();
        assert_eq!(stored.status, BuildStatus::Success);
        assert_eq!(stores.queue.pending_depth().await.unwrap(), 0);
    }
}
