//! Error types for Crucible.
//!
//! Every failure mode that can reach a build, stage or step outcome carries a
//! stable string kind, surfaced through [`Error::kind`]. The kind strings are
//! part of the persisted record format and must not change.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("checkout failed: {0}")]
    CheckoutFailed(String),

    #[error("pipeline not found: {0}")]
    PipelineNotFound(String),

    #[error("invalid pipeline: {0}")]
    PipelineInvalid(String),

    #[error("expression resolution failed: {0}")]
    ExpressionResolution(String),

    #[error("matrix expansion exceeds limit: {0}")]
    MatrixExplosion(String),

    #[error("dependency cycle: {0}")]
    DagCycle(String),

    #[error("unknown dependency: {0}")]
    DagUnresolved(String),

    #[error("secret missing: {0}")]
    SecretMissing(String),

    #[error("denied by policy: {0}")]
    PolicyDenied(String),

    #[error("approval rejected: {0}")]
    ApprovalRejected(String),

    #[error("approval timed out: {0}")]
    ApprovalTimeout(String),

    #[error("step timed out after {0} ms")]
    StepTimeout(u64),

    #[error("step exited with code {0}")]
    StepNonzeroExit(i32),

    #[error("step aborted: {0}")]
    StepAborted(String),

    #[error("cache io: {0}")]
    CacheIo(String),

    #[error("artifact io: {0}")]
    ArtifactIo(String),

    #[error("no agent available: {0}")]
    NoAgentAvailable(String),

    #[error("dispatch failed: {0}")]
    DispatchFailed(String),

    #[error("circuit breaker open for agent {0}")]
    BreakerOpen(String),

    #[error("build orphaned: {0}")]
    Orphaned(String),

    #[error("agent auth failed: {0}")]
    AgentAuthFailed(String),

    #[error("queue stalled: {0}")]
    QueueStalled(String),

    #[error("store conflict: {0}")]
    StoreConflict(String),

    #[error("store error: {0}")]
    Store(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Stable string kind for persistence and API surfaces.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::CheckoutFailed(_) => "checkout-failed",
            Error::PipelineNotFound(_) => "pipeline-not-found",
            Error::PipelineInvalid(_) => "pipeline-invalid",
            Error::ExpressionResolution(_) => "expression-resolution",
            Error::MatrixExplosion(_) => "matrix-explosion",
            Error::DagCycle(_) => "dag-cycle",
            Error::DagUnresolved(_) => "dag-unresolved",
            Error::SecretMissing(_) => "secret-missing",
            Error::PolicyDenied(_) => "policy-denied",
            Error::ApprovalRejected(_) => "approval-rejected",
            Error::ApprovalTimeout(_) => "approval-timeout",
            Error::StepTimeout(_) => "step-timeout",
            Error::StepNonzeroExit(_) => "step-nonzero-exit",
            Error::StepAborted(_) => "step-aborted",
            Error::CacheIo(_) => "cache-io",
            Error::ArtifactIo(_) => "artifact-io",
            Error::NoAgentAvailable(_) => "no-agent-available",
            Error::DispatchFailed(_) => "dispatch-failed",
            Error::BreakerOpen(_) => "breaker-open",
            Error::Orphaned(_) => "orphaned",
            Error::AgentAuthFailed(_) => "agent-auth-failed",
            Error::QueueStalled(_) => "queue-stalled",
            Error::StoreConflict(_) => "store-conflict",
            Error::Store(_) => "store",
            Error::NotFound(_) => "not-found",
            Error::InvalidInput(_) => "invalid-input",
            Error::Internal(_) => "internal",
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_are_stable() {
        assert_eq!(Error::CheckoutFailed("x".into()).kind(), "checkout-failed");
        assert_eq!(Error::MatrixExplosion("26".into()).kind(), "matrix-explosion");
        assert_eq!(Error::StepTimeout(1).kind(), "step-timeout");
        assert_eq!(Error::BreakerOpen("a1".into()).kind(), "breaker-open");
        assert_eq!(Error::StoreConflict("dup".into()).kind(), "store-conflict");
    }
}
