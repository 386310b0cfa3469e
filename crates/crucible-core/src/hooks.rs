//! Host collaborator seams.
//!
//! Policy, notification, SCM status and checkout are supplied by the host
//! through these narrow traits. They are pure side-effects with no dependency
//! on core state; the core never interprets their internals.

use async_trait::async_trait;
use std::path::Path;

use crate::Result;
use crate::build::{Build, GitInfo};
use crate::job::SourceConfig;
use crate::pipeline::NotifierConfig;

/// Outcome of a policy evaluation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolicyDecision {
    Allow,
    Deny(String),
}

/// Context handed to policy hooks before each stage runs.
#[derive(Debug, Clone)]
pub struct PolicyContext<'a> {
    pub build: &'a Build,
    pub job_name: &'a str,
    pub stage_name: &'a str,
}

#[async_trait]
pub trait PolicyHook: Send + Sync {
    async fn evaluate(&self, ctx: PolicyContext<'_>) -> PolicyDecision;
}

/// Policy hook that allows everything; the default when the host installs
/// no governance layer.
pub struct AllowAllPolicy;

#[async_trait]
impl PolicyHook for AllowAllPolicy {
    async fn evaluate(&self, _ctx: PolicyContext<'_>) -> PolicyDecision {
        PolicyDecision::Allow
    }
}

/// Delivers a finished build's result to an external sink (chat, mail, ...).
/// Failures are logged by the caller and never change the build status.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, build: &Build, config: &NotifierConfig) -> Result<()>;
}

pub struct NoopNotifier;

#[async_trait]
impl Notifier for NoopNotifier {
    async fn notify(&self, _build: &Build, _config: &NotifierConfig) -> Result<()> {
        Ok(())
    }
}

/// Reports commit status back to the SCM host.
#[async_trait]
pub trait ScmStatusReporter: Send + Sync {
    async fn report(&self, build: &Build, config: &SourceConfig) -> Result<()>;
}

pub struct NoopStatusReporter;

#[async_trait]
impl ScmStatusReporter for NoopStatusReporter {
    async fn report(&self, _build: &Build, _config: &SourceConfig) -> Result<()> {
        Ok(())
    }
}

/// Checks out source into a workspace and reports commit metadata.
#[async_trait]
pub trait ScmProvider: Send + Sync {
    async fn checkout(
        &self,
        source: &SourceConfig,
        workspace: &Path,
        commit_override: Option<&str>,
    ) -> Result<GitInfo>;
}
