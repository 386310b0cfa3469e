//! Step executors.
//!
//! Step dispatch is a registry keyed by the step's type tag; new executors
//! can be registered by the host without touching the stage loop. Shell runs
//! through the process runner directly; docker and docker-compose generate a
//! validated command line and shell out to the installed binaries.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;

use crucible_core::pipeline::{Container, Step, StepType};
use crucible_core::{Error, Result};

use crate::docker;
use crate::process::{LineSink, ProcessOutcome, ProcessRequest, ProcessRunner};
use crate::workspace::confine;

/// Everything a step executor needs from the surrounding stage.
pub struct StepContext {
    pub workspace: PathBuf,
    /// Merged environment: pipeline, stage container, matrix, secrets,
    /// parameters, git metadata.
    pub env: HashMap<String, String>,
    /// Stage-level container, if the stage runs containerized.
    pub container: Option<Container>,
    pub default_timeout: Duration,
    pub cancel: watch::Receiver<bool>,
    pub sink: LineSink,
}

impl StepContext {
    fn timeout_for(&self, step: &Step) -> Duration {
        step.timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(self.default_timeout)
    }

    fn cwd_for(&self, step: &Step) -> Result<PathBuf> {
        match &step.dir {
            Some(dir) => confine(&self.workspace, dir),
            None => Ok(self.workspace.clone()),
        }
    }
}

/// One pluggable step backend.
#[async_trait]
pub trait StepExecutor: Send + Sync {
    async fn execute(&self, step: &Step, ctx: &StepContext) -> Result<ProcessOutcome>;
}

/// Registry from type tag to executor.
pub struct StepRegistry {
    executors: HashMap<String, Arc<dyn StepExecutor>>,
}

impl StepRegistry {
    /// Registry with the built-in shell, docker, and docker-compose
    /// executors.
    pub fn with_defaults(runner: Arc<ProcessRunner>) -> Self {
        let mut registry = Self {
            executors: HashMap::new(),
        };
        registry.register("shell", Arc::new(ShellStepExecutor { runner: runner.clone() }));
        registry.register("docker", Arc::new(DockerStepExecutor { runner: runner.clone() }));
        registry.register("docker-compose", Arc::new(ComposeStepExecutor { runner }));
        registry
    }

    pub fn register(&mut self, tag: impl Into<String>, executor: Arc<dyn StepExecutor>) {
        self.executors.insert(tag.into(), executor);
    }

    pub fn executor_for(&self, step: &Step) -> Result<Arc<dyn StepExecutor>> {
        let tag = match step.step_type {
            StepType::Shell => "shell",
            StepType::Docker => "docker",
            StepType::DockerCompose => "docker-compose",
        };
        self.executors
            .get(tag)
            .cloned()
            .ok_or_else(|| Error::PipelineInvalid(format!("no executor registered for {tag}")))
    }
}

pub struct ShellStepExecutor {
    runner: Arc<ProcessRunner>,
}

#[async_trait]
impl StepExecutor for ShellStepExecutor {
    async fn execute(&self, step: &Step, ctx: &StepContext) -> Result<ProcessOutcome> {
        let mut env = ctx.env.clone();
        env.extend(step.env.clone());
        self.runner
            .run(
                ProcessRequest {
                    command: step.command.clone(),
                    env,
                    cwd: ctx.cwd_for(step)?,
                    timeout: Some(ctx.timeout_for(step)),
                },
                ctx.sink.clone(),
                ctx.cancel.clone(),
            )
            .await
    }
}

pub struct DockerStepExecutor {
    runner: Arc<ProcessRunner>,
}

#[async_trait]
impl StepExecutor for DockerStepExecutor {
    async fn execute(&self, step: &Step, ctx: &StepContext) -> Result<ProcessOutcome> {
        // The step's image wins over the stage container's.
        let container = match (&step.image, &ctx.container) {
            (Some(image), Some(container)) => {
                let mut c = container.clone();
                c.image = image.clone();
                c
            }
            (Some(image), None) => Container {
                image: image.clone(),
                volumes: Vec::new(),
                cache_volumes: Default::default(),
                env: HashMap::new(),
            },
            (None, Some(container)) => container.clone(),
            (None, None) => {
                return Err(Error::PipelineInvalid(format!(
                    "docker step {} has no image",
                    step.name
                )));
            }
        };

        let mut env = ctx.env.clone();
        env.extend(step.env.clone());
        let workspace = ctx
            .workspace
            .to_str()
            .ok_or_else(|| Error::Internal("non-utf8 workspace path".into()))?;
        let command = docker::build_run_command(
            &container,
            (workspace, "/workspace"),
            "/workspace",
            &env,
            &step.command,
        )?;

        self.runner
            .run(
                ProcessRequest {
                    command,
                    // The generated command line carries the env; the docker
                    // client itself only needs a clean environment.
                    env: HashMap::new(),
                    cwd: ctx.workspace.clone(),
                    timeout: Some(ctx.timeout_for(step)),
                },
                ctx.sink.clone(),
                ctx.cancel.clone(),
            )
            .await
    }
}

pub struct ComposeStepExecutor {
    runner: Arc<ProcessRunner>,
}

#[async_trait]
impl StepExecutor for ComposeStepExecutor {
    async fn execute(&self, step: &Step, ctx: &StepContext) -> Result<ProcessOutcome> {
        let service = step.image.as_deref().ok_or_else(|| {
            Error::PipelineInvalid(format!("docker-compose step {} has no service", step.name))
        })?;
        let mut env = ctx.env.clone();
        env.extend(step.env.clone());
        let command = docker::build_compose_command(service, &env, &step.command)?;
        self.runner
            .run(
                ProcessRequest {
                    command,
                    env: HashMap::new(),
                    cwd: ctx.cwd_for(step)?,
                    timeout: Some(ctx.timeout_for(step)),
                },
                ctx.sink.clone(),
                ctx.cancel.clone(),
            )
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crucible_core::pipeline::Step;

    fn context(workspace: PathBuf) -> StepContext {
        let (_tx, cancel) = watch::channel(false);
        StepContext {
            workspace,
            env: HashMap::new(),
            container: None,
            default_timeout: Duration::from_secs(30),
            cancel,
            sink: Arc::new(|_, _| {}),
        }
    }

    #[tokio::test]
    async fn shell_step_runs_in_workspace() {
        let ws = tempfile::tempdir().unwrap();
        let registry = StepRegistry::with_defaults(Arc::new(ProcessRunner::new()));
        let step = Step::shell("c", "pwd");
        let ctx = context(ws.path().to_path_buf());
        let outcome = registry.executor_for(&step).unwrap().execute(&step, &ctx).await.unwrap();
        assert_eq!(outcome.exit_code, 0);
        let pwd = std::fs::canonicalize(ws.path()).unwrap();
        assert_eq!(outcome.stdout.trim(), pwd.to_str().unwrap());
    }

    #[tokio::test]
    async fn step_env_overrides_context_env() {
        let ws = tempfile::tempdir().unwrap();
        let registry = StepRegistry::with_defaults(Arc::new(ProcessRunner::new()));
        let mut step = Step::shell("c", "echo $WHO");
        step.env.insert("WHO".into(), "step".into());
        let mut ctx = context(ws.path().to_path_buf());
        ctx.env.insert("WHO".into(), "pipeline".into());
        let outcome = registry.executor_for(&step).unwrap().execute(&step, &ctx).await.unwrap();
        assert_eq!(outcome.stdout.trim(), "step");
    }

    #[tokio::test]
    async fn step_dir_is_confined() {
        let ws = tempfile::tempdir().unwrap();
        let registry = StepRegistry::with_defaults(Arc::new(ProcessRunner::new()));
        let mut step = Step::shell("c", "pwd");
        step.dir = Some("../outside".into());
        let ctx = context(ws.path().to_path_buf());
        let err = registry.executor_for(&step).unwrap().execute(&step, &ctx).await.unwrap_err();
        assert_eq!(err.kind(), "invalid-input");
    }
}
