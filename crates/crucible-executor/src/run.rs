//! The build executor.
//!
//! Drives one build end-to-end: workspace, checkout, pipeline resolution,
//! secret injection, container propagation, matrix expansion, the stage loop
//! (DAG or sequential), post actions, artifact collection, notification, and
//! finalization. Every observable transition is published through the event
//! bus after being persisted.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::json;
use tokio::sync::{Semaphore, mpsc, watch};
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use crucible_config::expr::{ExprContext, resolve_pipeline};
use crucible_config::formats::FormatRegistry;
use crucible_config::system::SystemConfig;
use crucible_core::build::{
    Build, BuildStatus, PipelineSource, StageRecord, StepRecord, StepStatus,
};
use crucible_core::event::EventKind;
use crucible_core::hooks::{Notifier, PolicyContext, PolicyDecision, PolicyHook, ScmProvider, ScmStatusReporter};
use crucible_core::job::Job;
use crucible_core::approval::{ApprovalGate, GateStatus};
use crucible_core::cache::{StageCacheEntry, StageResultSnapshot};
use crucible_core::mask::LogMasker;
use crucible_core::matrix::expand_stages;
use crucible_core::pipeline::{ConditionKind, Pipeline, Stage, Step, StepType};
use crucible_core::store::Stores;
use crucible_core::{Error, ResourceId, Result};

use crate::approval::ApprovalWaiter;
use crate::artifact::ArtifactCollector;
use crate::bus::EventBus;
use crate::cache::{self, DirCache, stage_fingerprint};
use crate::dag::{Dag, is_dag_mode};
use crate::process::{LineSink, ProcessOutcome, StreamKind};
use crate::secrets::SecretVault;
use crate::steps::{StepContext, StepRegistry};
use crate::workspace::WorkspaceManager;

/// Everything the executor is wired with at startup.
pub struct ExecutorDeps {
    pub stores: Stores,
    pub bus: Arc<EventBus>,
    pub config: SystemConfig,
    pub formats: Arc<FormatRegistry>,
    pub registry: Arc<StepRegistry>,
    pub scm: Option<Arc<dyn ScmProvider>>,
    pub policy: Arc<dyn PolicyHook>,
    pub notifier: Arc<dyn Notifier>,
    pub scm_status: Arc<dyn ScmStatusReporter>,
    pub vault: Option<Arc<SecretVault>>,
    pub approval_poll: Duration,
}

/// Per-build context shared by every stage task.
struct BuildCtx {
    build: Build,
    job: Job,
    /// Base environment for every step.
    env: HashMap<String, String>,
    masker: Arc<LogMasker>,
    cancel: watch::Receiver<bool>,
    workspace: PathBuf,
}

#[derive(Debug, Clone)]
struct StageOutcome {
    status: StepStatus,
    exit_code: Option<i32>,
    error: Option<String>,
}

impl StageOutcome {
    fn success() -> Self {
        Self {
            status: StepStatus::Success,
            exit_code: Some(0),
            error: None,
        }
    }

    fn failure(error: impl Into<String>, exit_code: Option<i32>) -> Self {
        Self {
            status: StepStatus::Failure,
            exit_code,
            error: Some(error.into()),
        }
    }
}

pub struct Executor {
    stores: Stores,
    bus: Arc<EventBus>,
    config: SystemConfig,
    formats: Arc<FormatRegistry>,
    registry: Arc<StepRegistry>,
    scm: Option<Arc<dyn ScmProvider>>,
    policy: Arc<dyn PolicyHook>,
    notifier: Arc<dyn Notifier>,
    scm_status: Arc<dyn ScmStatusReporter>,
    vault: Option<Arc<SecretVault>>,
    workspaces: WorkspaceManager,
    dir_cache: DirCache,
    waiter: ApprovalWaiter,
}

impl Executor {
    pub fn new(deps: ExecutorDeps) -> Arc<Self> {
        let workspaces = WorkspaceManager::new(deps.config.workspace_root.clone());
        let dir_cache = DirCache::new(deps.config.cache_root.clone());
        let waiter = ApprovalWaiter::new(deps.stores.approvals.clone(), deps.approval_poll);
        Arc::new(Self {
            stores: deps.stores,
            bus: deps.bus,
            config: deps.config,
            formats: deps.formats,
            registry: deps.registry,
            scm: deps.scm,
            policy: deps.policy,
            notifier: deps.notifier,
            scm_status: deps.scm_status,
            vault: deps.vault,
            workspaces,
            dir_cache,
            waiter,
        })
    }

    /// Run one build to a terminal status. Always finalizes the record and
    /// emits `build-completed`, whatever happens in between.
    pub async fn execute(
        self: &Arc<Self>,
        build: Build,
        cancel: watch::Receiver<bool>,
    ) -> Result<BuildStatus> {
        let build_id = build.id;
        let org_id = build.org_id;
        let outcome = self.execute_inner(build, cancel.clone()).await;

        let (status, error) = match &outcome {
            Ok(status) => (*status, None),
            Err(e) if *cancel.borrow() => {
                (BuildStatus::Aborted, Some(format!("{}: {e}", e.kind())))
            }
            Err(e) => (BuildStatus::Failure, Some(format!("{}: {e}", e.kind()))),
        };

        if let Err(e) = self
            .stores
            .builds
            .finalize(build_id, status, error.as_deref())
            .await
        {
            error!(build_id = %build_id, error = %e, "finalize failed");
        }
        self.bus
            .publish(self.bus.event(
                build_id,
                org_id,
                EventKind::BuildCompleted,
                None,
                None,
                json!({ "status": status.as_str(), "error": error }),
            ))
            .await;
        if let Err(e) = self.workspaces.cleanup(build_id) {
            warn!(build_id = %build_id, error = %e, "workspace cleanup failed");
        }
        info!(build_id = %build_id, status = status.as_str(), "build finished");
        outcome.map(|_| status)
    }

    async fn execute_inner(
        self: &Arc<Self>,
        mut build: Build,
        cancel: watch::Receiver<bool>,
    ) -> Result<BuildStatus> {
        let job = self.stores.jobs.get(build.org_id, build.job_id).await?;

        // 1. Workspace.
        let workspace = self.workspaces.allocate(build.id)?;
        self.stores
            .builds
            .mark_running(build.id, &workspace.display().to_string())
            .await?;
        self.bus
            .publish(self.bus.event(
                build.id,
                build.org_id,
                EventKind::BuildStarted,
                None,
                None,
                json!({
                    "job": job.name,
                    "build_number": build.build_number,
                    "trigger": build.trigger_type.as_str(),
                }),
            ))
            .await;

        // 2. Source checkout.
        if let (Some(source), Some(scm)) = (&job.source_config, &self.scm) {
            let git = scm.checkout(source, &workspace, None).await?;
            self.stores.builds.set_git(build.id, &git).await?;
            build.git = Some(git);
        }

        // 3. Pipeline resolution: repo file first, server definition last.
        let (source, mut pipeline) = match self.formats.resolve(&workspace)? {
            Some(resolved) => (resolved.source, resolved.pipeline),
            None => match &job.pipeline_value {
                Some(pipeline) => (PipelineSource::Server, pipeline.clone()),
                None => {
                    return Err(Error::PipelineNotFound(format!(
                        "job {} has no pipeline definition",
                        job.name
                    )));
                }
            },
        };
        pipeline.validate()?;
        self.stores.builds.set_pipeline_source(build.id, source).await?;

        // 5. Secrets: decrypt, mask, and keep for env injection and
        // expression resolution.
        let masker = Arc::new(LogMasker::new());
        let mut secret_env: HashMap<String, String> = HashMap::new();
        if let Some(vault) = &self.vault {
            for (name, value) in vault
                .load_for_job(build.org_id, build.job_id, Some(build.id))
                .await?
            {
                masker.register(&value);
                secret_env.insert(name, value);
            }
        }

        // 4. Expression resolution for file-sourced YAML pipelines.
        if source == PipelineSource::RepoYaml {
            let ctx = ExprContext {
                parameters: build.parameters.clone(),
                secrets: secret_env.clone(),
            };
            resolve_pipeline(&mut pipeline, &ctx)?;
        }

        // 6. Container propagation: pipeline container to stages without
        // one; a containerized stage runs its shell steps in the container.
        for stage in &mut pipeline.stages {
            if stage.container.is_none() {
                stage.container = pipeline.container.clone();
            }
            if stage.container.is_some() {
                for step in &mut stage.steps {
                    if step.step_type == StepType::Shell {
                        step.step_type = StepType::Docker;
                    }
                }
            }
            if stage.matrix.is_none() {
                stage.matrix = pipeline.matrix.clone();
            }
        }

        // 7. Matrix expansion, before DAG resolution.
        let (stages, _) = expand_stages(std::mem::take(&mut pipeline.stages))?;

        // 8. Build deduplication window.
        if self.config.dedup_enabled {
            if let Some(git) = &build.git {
                let since = Utc::now()
                    - chrono::Duration::from_std(self.config.dedup_window)
                        .unwrap_or_else(|_| chrono::Duration::seconds(300));
                if let Some(existing) = self
                    .stores
                    .builds
                    .find_recent_for_commit(build.org_id, build.job_id, &git.commit, since)
                    .await?
                {
                    if existing.id != build.id {
                        info!(
                            build_id = %build.id,
                            existing = %existing.id,
                            commit = %git.commit,
                            "deduplicated against running build"
                        );
                        self.stores
                            .builds
                            .finalize(
                                build.id,
                                BuildStatus::Aborted,
                                Some(&format!("deduplicated into build {}", existing.id)),
                            )
                            .await?;
                        return Ok(BuildStatus::Aborted);
                    }
                }
            }
        }

        let ctx = Arc::new(BuildCtx {
            env: self.base_env(&build, &job, &pipeline, &secret_env),
            build,
            job,
            masker,
            cancel,
            workspace,
        });

        // 9. Stage loop.
        let failed = if is_dag_mode(&stages) {
            self.run_dag(&ctx, stages).await?
        } else {
            self.run_sequential(&ctx, stages).await
        };

        let cancelled = *ctx.cancel.borrow();
        let status_so_far = if cancelled {
            BuildStatus::Aborted
        } else if failed {
            BuildStatus::Failure
        } else {
            BuildStatus::Success
        };

        // 10. Post actions never change the build status.
        if let Some(post) = &pipeline.post {
            self.run_post_steps(&ctx, &post.always, "post:always").await;
            if status_so_far == BuildStatus::Success {
                self.run_post_steps(&ctx, &post.on_success, "post:on-success").await;
            } else {
                self.run_post_steps(&ctx, &post.on_failure, "post:on-failure").await;
            }
        }

        // 11. Artifact collection runs even for failed builds.
        if !pipeline.artifacts.is_empty() {
            let collector =
                ArtifactCollector::new(&self.config.artifact_root, self.config.incremental_artifacts);
            match collector
                .collect(&*self.stores.artifacts, &ctx.build, &ctx.workspace, &pipeline.artifacts)
                .await
            {
                Ok(records) => {
                    info!(build_id = %ctx.build.id, count = records.len(), "artifacts collected");
                }
                Err(e) => {
                    warn!(build_id = %ctx.build.id, error = %e, "artifact collection failed");
                }
            }
        }

        // 12. Notify and SCM status; failures are logged, never fatal.
        let mut finished = ctx.build.clone();
        finished.status = status_so_far;
        for notify in &pipeline.notify {
            if let Err(e) = self.notifier.notify(&finished, notify).await {
                warn!(build_id = %finished.id, kind = %notify.kind, error = %e, "notifier failed");
            }
        }
        if let Some(source) = &ctx.job.source_config {
            if let Err(e) = self.scm_status.report(&finished, source).await {
                warn!(build_id = %finished.id, error = %e, "scm status report failed");
            }
        }

        Ok(status_so_far)
    }

    /// The environment every step starts from.
    fn base_env(
        &self,
        build: &Build,
        job: &Job,
        pipeline: &Pipeline,
        secrets: &HashMap<String, String>,
    ) -> HashMap<String, String> {
        let mut env = HashMap::new();
        env.insert("CI".to_string(), "true".to_string());
        env.insert("CRUCIBLE_BUILD_ID".to_string(), build.id.to_string());
        env.insert("CRUCIBLE_BUILD_NUMBER".to_string(), build.build_number.to_string());
        env.insert("CRUCIBLE_JOB_NAME".to_string(), job.name.clone());
        env.extend(pipeline.env.clone());
        for (name, value) in &build.parameters {
            env.insert(format!("PARAM_{}", name.to_uppercase()), value.clone());
        }
        env.extend(secrets.clone());
        if let Some(git) = &build.git {
            env.insert("GIT_COMMIT".to_string(), git.commit.clone());
            env.insert("GIT_COMMIT_SHORT".to_string(), git.short_commit());
            env.insert("GIT_BRANCH".to_string(), git.branch.clone());
            env.insert("GIT_AUTHOR".to_string(), git.author.clone());
            env.insert("GIT_EMAIL".to_string(), git.email.clone());
            env.insert("GIT_MESSAGE".to_string(), git.message.clone());
        }
        env
    }

    async fn run_sequential(self: &Arc<Self>, ctx: &Arc<BuildCtx>, stages: Vec<Stage>) -> bool {
        let mut failed_stage: Option<String> = None;
        for stage in stages {
            if let Some(failed) = &failed_stage {
                self.record_skipped_stage(ctx, &stage.name, &format!("dependency failed: {failed}"))
                    .await;
                continue;
            }
            if *ctx.cancel.borrow() {
                self.record_skipped_stage(ctx, &stage.name, "build cancelled").await;
                continue;
            }
            let name = stage.name.clone();
            let outcome = self.run_stage(ctx.clone(), stage).await;
            if outcome.status != StepStatus::Success {
                failed_stage = Some(name);
            }
        }
        failed_stage.is_some()
    }

    async fn run_dag(self: &Arc<Self>, ctx: &Arc<BuildCtx>, stages: Vec<Stage>) -> Result<bool> {
        let dag = Dag::build(&stages)?;
        let stage_map: HashMap<String, Stage> =
            stages.into_iter().map(|s| (s.name.clone(), s)).collect();
        let semaphore = Arc::new(Semaphore::new(self.config.max_stage_concurrency.max(1)));

        let mut completed: HashSet<String> = HashSet::new();
        let mut settled: HashSet<String> = HashSet::new();
        let mut running: HashSet<String> = HashSet::new();
        let mut any_failure = false;
        let mut tasks: JoinSet<(String, StageOutcome)> = JoinSet::new();

        loop {
            if *ctx.cancel.borrow() {
                for name in &dag.order {
                    if !settled.contains(name) && !running.contains(name) {
                        self.record_skipped_stage(ctx, name, "build cancelled").await;
                        settled.insert(name.clone());
                    }
                }
            } else {
                for name in dag.ready(&completed, &settled, &running) {
                    let Ok(permit) = semaphore.clone().try_acquire_owned() else {
                        break;
                    };
                    let stage = stage_map[&name].clone();
                    let executor = self.clone();
                    let stage_ctx = ctx.clone();
                    running.insert(name.clone());
                    tasks.spawn(async move {
                        let _permit = permit;
                        let outcome = executor.run_stage(stage_ctx, stage).await;
                        (name, outcome)
                    });
                }
            }

            let Some(joined) = tasks.join_next().await else {
                break;
            };
            match joined {
                Ok((name, outcome)) => {
                    running.remove(&name);
                    settled.insert(name.clone());
                    match outcome.status {
                        StepStatus::Success => {
                            completed.insert(name);
                        }
                        _ => {
                            any_failure = true;
                            for descendant in dag.descendants(&name) {
                                if !settled.contains(&descendant) && !running.contains(&descendant) {
                                    self.record_skipped_stage(
                                        ctx,
                                        &descendant,
                                        &format!("dependency failed: {name}"),
                                    )
                                    .await;
                                    settled.insert(descendant);
                                }
                            }
                        }
                    }
                }
                Err(e) => {
                    error!(build_id = %ctx.build.id, error = %e, "stage task panicked");
                    any_failure = true;
                }
            }
        }

        // Anything still unsettled had an unsatisfiable dependency chain.
        for name in &dag.order {
            if !settled.contains(name) {
                self.record_skipped_stage(ctx, name, "dependencies not satisfied").await;
            }
        }
        Ok(any_failure)
    }

    /// Skipped stages are recorded with a pointer to the failing ancestor
    /// and never launched.
    async fn record_skipped_stage(&self, ctx: &Arc<BuildCtx>, name: &str, reason: &str) {
        let mut record = StageRecord::started(ctx.build.id, ctx.build.org_id, name);
        record.status = StepStatus::Skipped;
        record.finished_at = Some(Utc::now());
        record.error_message = Some(reason.to_string());
        if let Err(e) = self.stores.stages.insert(&record).await {
            error!(build_id = %ctx.build.id, stage = name, error = %e, "stage record failed");
        }
        self.bus
            .publish(self.bus.event(
                ctx.build.id,
                ctx.build.org_id,
                EventKind::StageCompleted,
                Some(name.to_string()),
                None,
                json!({ "status": "skipped", "reason": reason }),
            ))
            .await;
    }

    async fn run_stage(self: &Arc<Self>, ctx: Arc<BuildCtx>, stage: Stage) -> StageOutcome {
        match self.run_stage_inner(&ctx, &stage).await {
            Ok(outcome) => outcome,
            Err(e) => {
                let outcome = StageOutcome::failure(format!("{}: {e}", e.kind()), None);
                self.persist_stage_outcome(&ctx, &stage.name, &outcome, None).await;
                outcome
            }
        }
    }

    async fn run_stage_inner(
        self: &Arc<Self>,
        ctx: &Arc<BuildCtx>,
        stage: &Stage,
    ) -> Result<StageOutcome> {
        let build = &ctx.build;

        // Stage-result cache: a prior successful execution with the same
        // fingerprint short-circuits the stage.
        let fingerprint = build.git.as_ref().map(|git| {
            let commands: Vec<String> = stage.steps.iter().map(|s| s.command.clone()).collect();
            let mut env = ctx.env.clone();
            for step in &stage.steps {
                env.extend(step.env.clone());
            }
            stage_fingerprint(&git.commit, &stage.name, &commands, &env)
        });
        if let Some(fingerprint) = &fingerprint {
            if let Some(hit) = self
                .stores
                .stage_results
                .get(build.org_id, build.job_id, fingerprint)
                .await?
            {
                if hit.stage_result.status == StepStatus::Success {
                    info!(build_id = %build.id, stage = %stage.name, "stage cache hit");
                    let mut record = StageRecord::started(build.id, build.org_id, &stage.name);
                    record.status = StepStatus::Success;
                    record.exit_code = hit.stage_result.exit_code;
                    record.finished_at = Some(Utc::now());
                    self.stores.stages.insert(&record).await?;
                    self.bus
                        .publish(self.bus.event(
                            build.id,
                            build.org_id,
                            EventKind::StageCached,
                            Some(stage.name.clone()),
                            None,
                            json!({ "fingerprint": fingerprint, "cached_commit": hit.git_commit }),
                        ))
                        .await;
                    self.bus
                        .publish(self.bus.event(
                            build.id,
                            build.org_id,
                            EventKind::StageCompleted,
                            Some(stage.name.clone()),
                            None,
                            json!({ "status": "success", "cached": true }),
                        ))
                        .await;
                    return Ok(StageOutcome::success());
                }
            }
        }

        // Policy.
        let decision = self
            .policy
            .evaluate(PolicyContext {
                build,
                job_name: &ctx.job.name,
                stage_name: &stage.name,
            })
            .await;
        if let PolicyDecision::Deny(reason) = decision {
            let outcome = StageOutcome::failure(format!("policy-denied: {reason}"), None);
            self.persist_stage_outcome(ctx, &stage.name, &outcome, None).await;
            return Ok(outcome);
        }

        // Approval gate.
        if let Some(approval) = &stage.approval {
            let gate = ApprovalGate::pending(
                build.id,
                build.org_id,
                &stage.name,
                approval.required_approvals,
                Utc::now() + chrono::Duration::milliseconds(approval.timeout_ms as i64),
            );
            self.stores.approvals.create(&gate).await?;
            self.bus
                .publish(self.bus.event(
                    build.id,
                    build.org_id,
                    EventKind::ApprovalRequired,
                    Some(stage.name.clone()),
                    None,
                    json!({
                        "gate_id": gate.id,
                        "required_approvals": approval.required_approvals,
                        "approvers": approval.approvers,
                        "timeout_at": gate.timeout_at,
                    }),
                ))
                .await;

            let status = self.waiter.wait(gate.id, &ctx.cancel).await?;
            let outcome_tag = match status {
                GateStatus::Approved => "approved",
                GateStatus::Rejected => "rejected",
                GateStatus::TimedOut => "timed-out",
                GateStatus::Pending => unreachable!("waiter returns terminal states"),
            };
            self.bus
                .publish(self.bus.event(
                    build.id,
                    build.org_id,
                    EventKind::ApprovalResolved,
                    Some(stage.name.clone()),
                    None,
                    json!({ "gate_id": gate.id, "outcome": outcome_tag }),
                ))
                .await;
            match status {
                GateStatus::Approved => {}
                GateStatus::Rejected => {
                    let outcome = StageOutcome::failure("approval-rejected", None);
                    self.persist_stage_outcome(ctx, &stage.name, &outcome, None).await;
                    return Ok(outcome);
                }
                GateStatus::TimedOut | GateStatus::Pending => {
                    let outcome = StageOutcome::failure("approval-timeout", None);
                    self.persist_stage_outcome(ctx, &stage.name, &outcome, None).await;
                    return Ok(outcome);
                }
            }
        }

        // Cache restore.
        for decl in &stage.cache {
            let key = cache::resolve_cache_key(&decl.key, &ctx.workspace)?;
            match cache::restore_declared(
                &*self.stores.cache,
                &self.dir_cache,
                build.org_id,
                build.job_id,
                decl,
                &key,
                &ctx.workspace,
            )
            .await
            {
                Ok(Some(entry)) => {
                    info!(build_id = %build.id, stage = %stage.name, key = %entry.cache_key, "cache restored");
                }
                Ok(None) => {}
                // cache-io falls through to plain execution.
                Err(e) => {
                    warn!(build_id = %build.id, stage = %stage.name, error = %e, "cache restore failed");
                }
            }
        }

        let mut record = StageRecord::started(build.id, build.org_id, &stage.name);
        record.container_image = stage.container.as_ref().map(|c| c.image.clone());
        self.stores.stages.insert(&record).await?;
        self.bus
            .publish(self.bus.event(
                build.id,
                build.org_id,
                EventKind::StageStarted,
                Some(stage.name.clone()),
                None,
                json!({ "parallel": stage.parallel }),
            ))
            .await;

        // Steps.
        let outcome = if stage.parallel {
            let futures: Vec<_> = stage
                .steps
                .iter()
                .map(|step| self.run_step(ctx, stage, step))
                .collect();
            let results = futures::future::join_all(futures).await;
            results
                .into_iter()
                .find(|o| o.status != StepStatus::Success && o.status != StepStatus::Skipped)
                .unwrap_or_else(StageOutcome::success)
        } else {
            let mut failed: Option<StageOutcome> = None;
            for step in &stage.steps {
                if failed.is_some() {
                    let mut skipped = StepRecord::started(build.id, build.org_id, &stage.name, &step.name);
                    skipped.status = StepStatus::Skipped;
                    skipped.finished_at = Some(Utc::now());
                    self.stores.steps.insert(&skipped).await?;
                    continue;
                }
                let outcome = self.run_step(ctx, stage, step).await;
                if outcome.status != StepStatus::Success && outcome.status != StepStatus::Skipped {
                    failed = Some(outcome);
                }
            }
            failed.unwrap_or_else(StageOutcome::success)
        };

        // Cache save and result fingerprint on success.
        if outcome.status == StepStatus::Success {
            for decl in &stage.cache {
                let key = cache::resolve_cache_key(&decl.key, &ctx.workspace)?;
                if let Err(e) = cache::save_declared(
                    &*self.stores.cache,
                    &self.dir_cache,
                    build.org_id,
                    build.job_id,
                    decl,
                    &key,
                    &ctx.workspace,
                )
                .await
                {
                    warn!(build_id = %build.id, stage = %stage.name, error = %e, "cache save failed");
                }
            }
            if let (Some(fingerprint), Some(git)) = (&fingerprint, &build.git) {
                let entry = StageCacheEntry {
                    org_id: build.org_id,
                    job_id: build.job_id,
                    fingerprint: fingerprint.clone(),
                    stage_name: stage.name.clone(),
                    stage_result: StageResultSnapshot {
                        status: StepStatus::Success,
                        exit_code: outcome.exit_code,
                        step_exits: Vec::new(),
                    },
                    git_commit: git.commit.clone(),
                    created_at: Utc::now(),
                };
                if let Err(e) = self.stores.stage_results.put(&entry).await {
                    warn!(build_id = %build.id, stage = %stage.name, error = %e, "stage cache write failed");
                }
            }
        }

        self.persist_stage_outcome(ctx, &stage.name, &outcome, Some(record)).await;
        Ok(outcome)
    }

    async fn persist_stage_outcome(
        &self,
        ctx: &Arc<BuildCtx>,
        stage_name: &str,
        outcome: &StageOutcome,
        started_record: Option<StageRecord>,
    ) {
        // Records created before execution are updated in place; failure
        // paths that never inserted one insert it terminal.
        let was_inserted = started_record.is_some();
        let mut record = started_record
            .unwrap_or_else(|| StageRecord::started(ctx.build.id, ctx.build.org_id, stage_name));
        record.status = outcome.status;
        record.exit_code = outcome.exit_code;
        record.error_message = outcome.error.clone();
        record.finished_at = Some(Utc::now());

        let result = if was_inserted {
            self.stores.stages.update(&record).await
        } else {
            self.stores.stages.insert(&record).await
        };
        if let Err(e) = result {
            error!(build_id = %ctx.build.id, stage = stage_name, error = %e, "stage record failed");
        }

        self.bus
            .publish(self.bus.event(
                ctx.build.id,
                ctx.build.org_id,
                EventKind::StageCompleted,
                Some(stage_name.to_string()),
                None,
                json!({ "status": outcome.status.as_str(), "error": outcome.error }),
            ))
            .await;
    }

    fn condition_holds(&self, ctx: &BuildCtx, step: &Step) -> bool {
        let Some(condition) = &step.condition else {
            return true;
        };
        match condition.kind {
            ConditionKind::Branch => {
                let branch = ctx.build.git.as_ref().map(|g| g.branch.as_str()).unwrap_or("");
                condition.value.as_deref() == Some(branch)
            }
            ConditionKind::Param => {
                let Some(param) = &condition.param else {
                    return false;
                };
                ctx.build.parameters.get(param) == condition.value.as_ref()
            }
        }
    }

    async fn run_step(&self, ctx: &Arc<BuildCtx>, stage: &Stage, step: &Step) -> StageOutcome {
        if *ctx.cancel.borrow() {
            let mut record = StepRecord::started(ctx.build.id, ctx.build.org_id, &stage.name, &step.name);
            record.status = StepStatus::Aborted;
            record.finished_at = Some(Utc::now());
            record.error_message = Some("step-aborted: build cancelled".into());
            let _ = self.stores.steps.insert(&record).await;
            return StageOutcome {
                status: StepStatus::Aborted,
                exit_code: None,
                error: Some("step-aborted: build cancelled".into()),
            };
        }

        if !self.condition_holds(ctx, step) {
            let mut record = StepRecord::started(ctx.build.id, ctx.build.org_id, &stage.name, &step.name);
            record.status = StepStatus::Skipped;
            record.finished_at = Some(Utc::now());
            let _ = self.stores.steps.insert(&record).await;
            return StageOutcome {
                status: StepStatus::Skipped,
                exit_code: None,
                error: None,
            };
        }

        let mut record = StepRecord::started(ctx.build.id, ctx.build.org_id, &stage.name, &step.name);
        record.container_image = step
            .image
            .clone()
            .or_else(|| stage.container.as_ref().map(|c| c.image.clone()));
        if let Err(e) = self.stores.steps.insert(&record).await {
            error!(build_id = %ctx.build.id, step = %step.name, error = %e, "step record failed");
        }
        self.bus
            .publish(self.bus.event(
                ctx.build.id,
                ctx.build.org_id,
                EventKind::StepStarted,
                Some(stage.name.clone()),
                Some(step.name.clone()),
                json!({ "type": step.step_type }),
            ))
            .await;

        let (sink, forwarder) = self.masking_sink(ctx, &stage.name, &step.name);
        let step_ctx = StepContext {
            workspace: ctx.workspace.clone(),
            env: ctx.env.clone(),
            container: stage.container.clone(),
            default_timeout: self.config.default_step_timeout,
            cancel: ctx.cancel.clone(),
            sink,
        };

        let result = match self.registry.executor_for(step) {
            Ok(executor) => executor.execute(step, &step_ctx).await,
            Err(e) => Err(e),
        };
        drop(step_ctx);
        let _ = forwarder.await;

        let outcome = match result {
            Ok(process) => self.step_outcome_from(step, &process),
            Err(e) => StageOutcome::failure(format!("{}: {e}", e.kind()), None),
        };

        record.status = outcome.status;
        record.exit_code = outcome.exit_code;
        record.error_message = outcome.error.clone();
        record.finished_at = Some(Utc::now());
        if let Err(e) = self.stores.steps.update(&record).await {
            error!(build_id = %ctx.build.id, step = %step.name, error = %e, "step record update failed");
        }
        self.bus
            .publish(self.bus.event(
                ctx.build.id,
                ctx.build.org_id,
                EventKind::StepCompleted,
                Some(stage.name.clone()),
                Some(step.name.clone()),
                json!({
                    "status": outcome.status.as_str(),
                    "exit_code": outcome.exit_code,
                    "error": outcome.error,
                }),
            ))
            .await;
        outcome
    }

    fn step_outcome_from(&self, step: &Step, process: &ProcessOutcome) -> StageOutcome {
        if process.interrupted {
            return StageOutcome {
                status: StepStatus::Aborted,
                exit_code: Some(process.exit_code),
                error: Some("step-aborted: build cancelled".into()),
            };
        }
        if process.timed_out {
            let timeout = step
                .timeout_ms
                .unwrap_or(self.config.default_step_timeout.as_millis() as u64);
            return StageOutcome::failure(
                format!("step-timeout: exceeded {timeout} ms"),
                Some(process.exit_code),
            );
        }
        if process.exit_code != 0 {
            return StageOutcome::failure(
                format!("step-nonzero-exit: {}", process.exit_code),
                Some(process.exit_code),
            );
        }
        StageOutcome::success()
    }

    /// Sink that masks each line and forwards it as a `step-log` event.
    fn masking_sink(
        &self,
        ctx: &Arc<BuildCtx>,
        stage_name: &str,
        step_name: &str,
    ) -> (LineSink, tokio::task::JoinHandle<()>) {
        let (tx, mut rx) = mpsc::unbounded_channel::<(StreamKind, String)>();
        let masker = ctx.masker.clone();
        let sink: LineSink = Arc::new(move |stream, line| {
            let _ = tx.send((stream, masker.mask(line)));
        });

        let bus = self.bus.clone();
        let build_id = ctx.build.id;
        let org_id = ctx.build.org_id;
        let stage_name = stage_name.to_string();
        let step_name = step_name.to_string();
        let forwarder = tokio::spawn(async move {
            while let Some((stream, chunk)) = rx.recv().await {
                bus.publish(bus.event(
                    build_id,
                    org_id,
                    EventKind::StepLog,
                    Some(stage_name.clone()),
                    Some(step_name.clone()),
                    json!({ "stream": stream.as_str(), "chunk": chunk }),
                ))
                .await;
            }
        });
        (sink, forwarder)
    }

    async fn run_post_steps(&self, ctx: &Arc<BuildCtx>, steps: &[Step], phase: &str) {
        for step in steps {
            let stage = Stage::new(phase, Vec::new());
            let outcome = self.run_step(ctx, &stage, step).await;
            if outcome.status != StepStatus::Success && outcome.status != StepStatus::Skipped {
                warn!(
                    build_id = %ctx.build.id,
                    phase,
                    step = %step.name,
                    error = outcome.error.as_deref().unwrap_or(""),
                    "post action failed"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crucible_core::build::{GitInfo, TriggerType};
    use crucible_core::hooks::{AllowAllPolicy, NoopNotifier, NoopStatusReporter};
    use crucible_core::pipeline::{ApprovalPolicy, Matrix};
    use crucible_db::memory::memory_stores;
    use std::collections::BTreeMap;

    struct Harness {
        stores: Stores,
        bus: Arc<EventBus>,
        executor: Arc<Executor>,
        org: ResourceId,
        _dirs: Vec<tempfile::TempDir>,
    }

    fn harness() -> Harness {
        let stores = memory_stores();
        let bus = Arc::new(EventBus::new(stores.events.clone()));
        let ws = tempfile::tempdir().unwrap();
        let artifacts = tempfile::tempdir().unwrap();
        let cache = tempfile::tempdir().unwrap();
        let mut config = SystemConfig::default();
        config.workspace_root = ws.path().to_path_buf();
        config.artifact_root = artifacts.path().to_path_buf();
        config.cache_root = cache.path().to_path_buf();
        config.default_step_timeout = Duration::from_secs(30);

        let executor = Executor::new(ExecutorDeps {
            stores: stores.clone(),
            bus: bus.clone(),
            config,
            formats: Arc::new(FormatRegistry::with_defaults()),
            registry: Arc::new(StepRegistry::with_defaults(Arc::new(
                crate::process::ProcessRunner::new(),
            ))),
            scm: None,
            policy: Arc::new(AllowAllPolicy),
            notifier: Arc::new(NoopNotifier),
            scm_status: Arc::new(NoopStatusReporter),
            vault: None,
            approval_poll: Duration::from_millis(20),
        });
        Harness {
            stores,
            bus,
            executor,
            org: ResourceId::new(),
            _dirs: vec![ws, artifacts, cache],
        }
    }

    async fn make_job(h: &Harness, pipeline: Pipeline) -> Job {
        let mut job = Job::new(h.org, format!("job-{}", ResourceId::new()));
        job.pipeline_value = Some(pipeline);
        h.stores.jobs.create(&job).await.unwrap();
        job
    }

    async fn run_build(h: &Harness, job: &Job, git: Option<GitInfo>) -> (Build, BuildStatus) {
        let mut build = Build::new(job.id, h.org, TriggerType::Manual, HashMap::new());
        build.git = git;
        let build = h.stores.builds.create(&build).await.unwrap();
        let (_tx, cancel) = watch::channel(false);
        let status = h.executor.execute(build.clone(), cancel).await.unwrap();
        (build, status)
    }

    async fn event_kinds(h: &Harness, build_id: ResourceId) -> Vec<EventKind> {
        h.bus
            .replay(build_id, None, 1000)
            .await
            .unwrap()
            .iter()
            .map(|e| e.kind)
            .collect()
    }

    #[tokio::test]
    async fn sequential_build_success_emits_ordered_lifecycle() {
        let h = harness();
        let pipeline = Pipeline {
            stages: vec![Stage::new("Build", vec![Step::shell("c", "echo ok")])],
            ..Default::default()
        };
        let job = make_job(&h, pipeline).await;
        let (build, status) = run_build(&h, &job, None).await;
        assert_eq!(status, BuildStatus::Success);

        let kinds: Vec<EventKind> = event_kinds(&h, build.id)
            .await
            .into_iter()
            .filter(|k| *k != EventKind::StepLog)
            .collect();
        assert_eq!(
            kinds,
            vec![
                EventKind::BuildStarted,
                EventKind::StageStarted,
                EventKind::StepStarted,
                EventKind::StepCompleted,
                EventKind::StageCompleted,
                EventKind::BuildCompleted,
            ]
        );

        let stages = h.stores.stages.list_for_build(build.id).await.unwrap();
        assert_eq!(stages.len(), 1);
        assert_eq!(stages[0].status, StepStatus::Success);
        let steps = h.stores.steps.list_for_build(build.id).await.unwrap();
        assert_eq!(steps.len(), 1);
        assert_eq!(steps[0].exit_code, Some(0));

        let stored = h.stores.builds.find(build.id).await.unwrap().unwrap();
        assert_eq!(stored.status, BuildStatus::Success);
        assert!(stored.finished_at.is_some());
    }

    #[tokio::test]
    async fn dag_failure_cascades_to_descendants() {
        let h = harness();
        let mut a = Stage::new("A", vec![Step::shell("c", "echo a")]);
        let mut b = Stage::new("B", vec![Step::shell("c", "exit 1")]);
        let mut c = Stage::new("C", vec![Step::shell("c", "echo c")]);
        let mut d = Stage::new("D", vec![Step::shell("c", "echo d")]);
        a.depends_on = vec![];
        b.depends_on = vec!["A".into()];
        c.depends_on = vec!["A".into()];
        d.depends_on = vec!["B".into(), "C".into()];
        let job = make_job(&h, Pipeline { stages: vec![a, b, c, d], ..Default::default() }).await;

        let (build, status) = run_build(&h, &job, None).await;
        assert_eq!(status, BuildStatus::Failure);

        let stages = h.stores.stages.list_for_build(build.id).await.unwrap();
        let status_of = |name: &str| stages.iter().find(|s| s.name == name).unwrap().status;
        assert_eq!(status_of("A"), StepStatus::Success);
        assert_eq!(status_of("B"), StepStatus::Failure);
        assert!(matches!(status_of("C"), StepStatus::Success | StepStatus::Skipped));
        assert_eq!(status_of("D"), StepStatus::Skipped);
        let d_record = stages.iter().find(|s| s.name == "D").unwrap();
        assert!(d_record.error_message.as_deref().unwrap().contains("B"));
    }

    #[tokio::test]
    async fn matrix_expands_with_exclusion_and_env() {
        let h = harness();
        let mut stage = Stage::new("Build", vec![Step::shell("c", "test \"$MATRIX_OS\" != ''")]);
        stage.matrix = Some(Matrix {
            axes: BTreeMap::from([
                ("os".to_string(), vec!["linux".to_string(), "macos".to_string()]),
                ("jdk".to_string(), vec!["11".to_string(), "17".to_string()]),
            ]),
            exclude: vec![BTreeMap::from([
                ("os".to_string(), "macos".to_string()),
                ("jdk".to_string(), "11".to_string()),
            ])],
        });
        let job = make_job(&h, Pipeline { stages: vec![stage], ..Default::default() }).await;

        let (build, status) = run_build(&h, &job, None).await;
        assert_eq!(status, BuildStatus::Success);

        let stages = h.stores.stages.list_for_build(build.id).await.unwrap();
        let mut names: Vec<&str> = stages.iter().map(|s| s.name.as_str()).collect();
        names.sort();
        assert_eq!(
            names,
            vec![
                "Build [jdk=11, os=linux]",
                "Build [jdk=17, os=linux]",
                "Build [jdk=17, os=macos]",
            ]
        );
    }

    #[tokio::test]
    async fn approval_gate_times_out_and_fails_build() {
        let h = harness();
        let mut stage = Stage::new("Deploy", vec![Step::shell("c", "echo deploy")]);
        stage.approval = Some(ApprovalPolicy {
            required_approvals: 1,
            timeout_ms: 300,
            approvers: vec![],
        });
        let job = make_job(&h, Pipeline { stages: vec![stage], ..Default::default() }).await;

        let started = std::time::Instant::now();
        let (build, status) = run_build(&h, &job, None).await;
        assert_eq!(status, BuildStatus::Failure);
        assert!(started.elapsed() >= Duration::from_millis(300));

        let events = h.bus.replay(build.id, None, 1000).await.unwrap();
        assert!(events.iter().any(|e| e.kind == EventKind::ApprovalRequired));
        let resolved = events
            .iter()
            .find(|e| e.kind == EventKind::ApprovalResolved)
            .unwrap();
        assert_eq!(resolved.payload["outcome"], "timed-out");

        let stages = h.stores.stages.list_for_build(build.id).await.unwrap();
        assert_eq!(stages[0].status, StepStatus::Failure);
        assert!(stages[0].error_message.as_deref().unwrap().contains("approval-timeout"));
        // The deploy step never ran.
        assert!(h.stores.steps.list_for_build(build.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn approved_gate_lets_stage_run() {
        let h = harness();
        let mut stage = Stage::new("Deploy", vec![Step::shell("c", "echo deploy")]);
        stage.approval = Some(ApprovalPolicy {
            required_approvals: 1,
            timeout_ms: 10_000,
            approvers: vec!["alice".into()],
        });
        let job = make_job(&h, Pipeline { stages: vec![stage], ..Default::default() }).await;

        let mut build = Build::new(job.id, h.org, TriggerType::Manual, HashMap::new());
        build = h.stores.builds.create(&build).await.unwrap();
        let (_tx, cancel) = watch::channel(false);

        let approvals = h.stores.approvals.clone();
        let bus = h.bus.clone();
        let build_id = build.id;
        let approver = tokio::spawn(async move {
            // Wait for the gate id to appear on the event stream, then
            // approve it like an external operator would.
            for _ in 0..100 {
                let events = bus.replay(build_id, None, 1000).await.unwrap();
                if let Some(event) = events.iter().find(|e| e.kind == EventKind::ApprovalRequired) {
                    let gate_id: ResourceId =
                        event.payload["gate_id"].as_str().unwrap().parse().unwrap();
                    approvals.approve(gate_id, "alice").await.unwrap();
                    return;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            panic!("approval-required never published");
        });

        let status = h.executor.execute(build.clone(), cancel).await.unwrap();
        approver.await.unwrap();
        assert_eq!(status, BuildStatus::Success);
        let steps = h.stores.steps.list_for_build(build.id).await.unwrap();
        assert_eq!(steps.len(), 1);
        assert_eq!(steps[0].status, StepStatus::Success);
    }

    #[tokio::test]
    async fn stage_cache_hit_skips_execution_on_rerun() {
        let h = harness();
        let pipeline = Pipeline {
            stages: vec![Stage::new("X", vec![Step::shell("make", "echo make")])],
            ..Default::default()
        };
        let job = make_job(&h, pipeline).await;
        let git = GitInfo {
            commit: "abc1234def".into(),
            branch: "main".into(),
            ..Default::default()
        };

        let (first, status) = run_build(&h, &job, Some(git.clone())).await;
        assert_eq!(status, BuildStatus::Success);
        assert_eq!(h.stores.steps.list_for_build(first.id).await.unwrap().len(), 1);

        let (second, status) = run_build(&h, &job, Some(git)).await;
        assert_eq!(status, BuildStatus::Success);

        let kinds = event_kinds(&h, second.id).await;
        assert!(kinds.contains(&EventKind::StageCached));
        assert!(!kinds.contains(&EventKind::StepStarted));
        assert!(h.stores.steps.list_for_build(second.id).await.unwrap().is_empty());
        let stages = h.stores.stages.list_for_build(second.id).await.unwrap();
        assert_eq!(stages[0].status, StepStatus::Success);
    }

    #[tokio::test]
    async fn secrets_are_masked_in_step_logs() {
        use crate::secrets::{SecretCipher, SecretVault};
        use base64::Engine;
        use base64::engine::general_purpose::STANDARD as BASE64;
        use crucible_core::secret::SecretScope;

        let h = harness();
        let cipher = SecretCipher::from_b64(&BASE64.encode([1u8; 32])).unwrap();
        let pipeline = Pipeline {
            stages: vec![Stage::new("Leak", vec![Step::shell("c", "echo token is $SHH")])],
            ..Default::default()
        };
        let mut job = Job::new(h.org, "leaky");
        job.pipeline_value = Some(pipeline);
        h.stores.jobs.create(&job).await.unwrap();

        let record = cipher
            .seal(h.org, SecretScope::Job(job.id), "SHH", "tok_supersecret")
            .unwrap();
        h.stores.secrets.put(&record).await.unwrap();

        // Rebuild the executor with a vault wired in.
        let vault = Arc::new(SecretVault::new(cipher, h.stores.secrets.clone()));
        let mut config = SystemConfig::default();
        config.workspace_root = h._dirs[0].path().to_path_buf();
        config.artifact_root = h._dirs[1].path().to_path_buf();
        config.cache_root = h._dirs[2].path().to_path_buf();
        let executor = Executor::new(ExecutorDeps {
            stores: h.stores.clone(),
            bus: h.bus.clone(),
            config,
            formats: Arc::new(FormatRegistry::with_defaults()),
            registry: Arc::new(StepRegistry::with_defaults(Arc::new(
                crate::process::ProcessRunner::new(),
            ))),
            scm: None,
            policy: Arc::new(AllowAllPolicy),
            notifier: Arc::new(NoopNotifier),
            scm_status: Arc::new(NoopStatusReporter),
            vault: Some(vault),
            approval_poll: Duration::from_millis(20),
        });

        let build = h
            .stores
            .builds
            .create(&Build::new(job.id, h.org, TriggerType::Manual, HashMap::new()))
            .await
            .unwrap();
        let (_tx, cancel) = watch::channel(false);
        let status = executor.execute(build.clone(), cancel).await.unwrap();
        assert_eq!(status, BuildStatus::Success);

        let events = h.bus.replay(build.id, None, 1000).await.unwrap();
        let logs: Vec<&serde_json::Value> = events
            .iter()
            .filter(|e| e.kind == EventKind::StepLog)
            .map(|e| &e.payload)
            .collect();
        assert!(!logs.is_empty());
        for payload in &logs {
            assert!(!payload["chunk"].as_str().unwrap().contains("tok_supersecret"));
        }
        assert!(logs.iter().any(|p| p["chunk"].as_str().unwrap().contains("***")));
    }

    #[tokio::test]
    async fn step_timeout_fails_with_step_timeout() {
        let h = harness();
        let mut step = Step::shell("sleepy", "sleep 30");
        step.timeout_ms = Some(1);
        let job = make_job(&h, Pipeline {
            stages: vec![Stage::new("S", vec![step])],
            ..Default::default()
        })
        .await;

        let (build, status) = run_build(&h, &job, None).await;
        assert_eq!(status, BuildStatus::Failure);
        let steps = h.stores.steps.list_for_build(build.id).await.unwrap();
        assert!(steps[0].error_message.as_deref().unwrap().starts_with("step-timeout"));
    }

    #[tokio::test]
    async fn cancellation_aborts_build_and_skips_pending_stages() {
        let h = harness();
        let job = make_job(&h, Pipeline {
            stages: vec![
                Stage::new("Long", vec![Step::shell("c", "sleep 30")]),
                Stage::new("After", vec![Step::shell("c", "echo after")]),
            ],
            ..Default::default()
        })
        .await;

        let build = h
            .stores
            .builds
            .create(&Build::new(job.id, h.org, TriggerType::Manual, HashMap::new()))
            .await
            .unwrap();
        let (tx, cancel) = watch::channel(false);
        let executor = h.executor.clone();
        let run = {
            let build = build.clone();
            tokio::spawn(async move { executor.execute(build, cancel).await })
        };
        tokio::time::sleep(Duration::from_millis(300)).await;
        tx.send(true).unwrap();

        let status = run.await.unwrap().unwrap();
        assert_eq!(status, BuildStatus::Aborted);
        let stages = h.stores.stages.list_for_build(build.id).await.unwrap();
        let after = stages.iter().find(|s| s.name == "After").unwrap();
        assert_eq!(after.status, StepStatus::Skipped);
        let steps = h.stores.steps.list_for_build(build.id).await.unwrap();
        assert_eq!(steps[0].status, StepStatus::Aborted);
    }

    #[tokio::test]
    async fn post_actions_run_without_changing_status() {
        let h = harness();
        let ws_marker = "post_ran.txt";
        let pipeline = Pipeline {
            stages: vec![Stage::new("Fail", vec![Step::shell("c", "exit 2")])],
            post: Some(crucible_core::pipeline::PostActions {
                always: vec![Step::shell("mark", format!("touch {ws_marker}"))],
                on_success: vec![],
                on_failure: vec![Step::shell("report", "echo failed")],
            }),
            ..Default::default()
        };
        let job = make_job(&h, pipeline).await;
        let (build, status) = run_build(&h, &job, None).await;
        assert_eq!(status, BuildStatus::Failure);

        let steps = h.stores.steps.list_for_build(build.id).await.unwrap();
        assert!(steps.iter().any(|s| s.stage_name == "post:always" && s.status == StepStatus::Success));
        assert!(steps.iter().any(|s| s.stage_name == "post:on-failure"));
        assert!(!steps.iter().any(|s| s.stage_name == "post:on-success"));
    }

    #[tokio::test]
    async fn condition_skips_step_on_param_mismatch() {
        let h = harness();
        let mut conditional = Step::shell("only-release", "echo release");
        conditional.condition = Some(crucible_core::pipeline::StepCondition {
            kind: ConditionKind::Param,
            value: Some("release".into()),
            param: Some("target".into()),
        });
        let mut job = Job::new(h.org, "conditional");
        job.pipeline_value = Some(Pipeline {
            stages: vec![Stage::new("S", vec![conditional, Step::shell("always", "echo hi")])],
            ..Default::default()
        });
        job.parameter_defs = vec![crucible_core::pipeline::ParamDef {
            name: "target".into(),
            default: Some("debug".into()),
            choices: vec![],
            description: None,
        }];
        h.stores.jobs.create(&job).await.unwrap();

        let mut build = Build::new(
            job.id,
            h.org,
            TriggerType::Manual,
            HashMap::from([("target".to_string(), "debug".to_string())]),
        );
        build = h.stores.builds.create(&build).await.unwrap();
        let (_tx, cancel) = watch::channel(false);
        let status = h.executor.execute(build.clone(), cancel).await.unwrap();
        assert_eq!(status, BuildStatus::Success);

        let steps = h.stores.steps.list_for_build(build.id).await.unwrap();
        let conditional = steps.iter().find(|s| s.name == "only-release").unwrap();
        assert_eq!(conditional.status, StepStatus::Skipped);
        let always = steps.iter().find(|s| s.name == "always").unwrap();
        assert_eq!(always.status, StepStatus::Success);
    }

    #[tokio::test]
    async fn dedup_window_aborts_duplicate_commit_builds() {
        let h = harness();
        let pipeline = Pipeline {
            stages: vec![Stage::new("Build", vec![Step::shell("c", "echo ok")])],
            ..Default::default()
        };
        let mut job = Job::new(h.org, "dedup-job");
        job.pipeline_value = Some(pipeline);
        h.stores.jobs.create(&job).await.unwrap();
        let git = GitInfo {
            commit: "feedbeef00".into(),
            branch: "main".into(),
            ..Default::default()
        };

        // An earlier build for the same commit is still running.
        let mut first = Build::new(job.id, h.org, TriggerType::Push, HashMap::new());
        first.git = Some(git.clone());
        let first = h.stores.builds.create(&first).await.unwrap();
        h.stores.builds.mark_running(first.id, "/tmp/ws").await.unwrap();
        h.stores.builds.set_git(first.id, &git).await.unwrap();

        let mut config = SystemConfig::default();
        config.workspace_root = h._dirs[0].path().to_path_buf();
        config.artifact_root = h._dirs[1].path().to_path_buf();
        config.cache_root = h._dirs[2].path().to_path_buf();
        config.dedup_enabled = true;
        let executor = Executor::new(ExecutorDeps {
            stores: h.stores.clone(),
            bus: h.bus.clone(),
            config,
            formats: Arc::new(FormatRegistry::with_defaults()),
            registry: Arc::new(StepRegistry::with_defaults(Arc::new(
                crate::process::ProcessRunner::new(),
            ))),
            scm: None,
            policy: Arc::new(AllowAllPolicy),
            notifier: Arc::new(NoopNotifier),
            scm_status: Arc::new(NoopStatusReporter),
            vault: None,
            approval_poll: Duration::from_millis(20),
        });

        let mut second = Build::new(job.id, h.org, TriggerType::Push, HashMap::new());
        second.git = Some(git);
        let second = h.stores.builds.create(&second).await.unwrap();
        let (_tx, cancel) = watch::channel(false);
        let status = executor.execute(second.clone(), cancel).await.unwrap();

        assert_eq!(status, BuildStatus::Aborted);
        let stored = h.stores.builds.find(second.id).await.unwrap().unwrap();
        assert!(stored.error_message.unwrap().contains(&first.id.to_string()));
        // The duplicate never executed a stage.
        assert!(h.stores.stages.list_for_build(second.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn missing_pipeline_fails_with_stable_kind() {
        let h = harness();
        let job = Job::new(h.org, "empty-job");
        h.stores.jobs.create(&job).await.unwrap();
        let build = h
            .stores
            .builds
            .create(&Build::new(job.id, h.org, TriggerType::Manual, HashMap::new()))
            .await
            .unwrap();
        let (_tx, cancel) = watch::channel(false);
        let err = h.executor.execute(build.clone(), cancel).await.unwrap_err();
        assert_eq!(err.kind(), "pipeline-not-found");
        let stored = h.stores.builds.find(build.id).await.unwrap().unwrap();
        assert_eq!(stored.status, BuildStatus::Failure);
        assert!(stored.error_message.unwrap().contains("pipeline-not-found"));
    }
}
