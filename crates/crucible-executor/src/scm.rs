//! Git checkout provider.
//!
//! The default [`ScmProvider`]: shallow-clones the configured repository
//! through the process runner and reads commit metadata back out of the
//! working tree.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tracing::info;

use crucible_core::build::GitInfo;
use crucible_core::hooks::ScmProvider;
use crucible_core::job::SourceConfig;
use crucible_core::{Error, Result};

use crate::docker::shell_quote;
use crate::process::{LineSink, ProcessRequest, ProcessRunner};

const CHECKOUT_TIMEOUT: Duration = Duration::from_secs(600);

pub struct GitProvider {
    runner: Arc<ProcessRunner>,
}

impl GitProvider {
    pub fn new(runner: Arc<ProcessRunner>) -> Self {
        Self { runner }
    }

    async fn git(&self, cwd: &Path, command: String) -> Result<String> {
        let sink: LineSink = Arc::new(|_, _| {});
        let (_tx, cancel) = watch::channel(false);
        let outcome = self
            .runner
            .run(
                ProcessRequest {
                    command,
                    env: HashMap::new(),
                    cwd: cwd.to_path_buf(),
                    timeout: Some(CHECKOUT_TIMEOUT),
                },
                sink,
                cancel,
            )
            .await?;
        if outcome.exit_code != 0 {
            return Err(Error::CheckoutFailed(outcome.stderr.trim().to_string()));
        }
        Ok(outcome.stdout)
    }
}

#[async_trait]
impl ScmProvider for GitProvider {
    async fn checkout(
        &self,
        source: &SourceConfig,
        workspace: &Path,
        commit_override: Option<&str>,
    ) -> Result<GitInfo> {
        if source.url.is_empty() {
            return Err(Error::CheckoutFailed("no repository url configured".into()));
        }

        let mut clone = format!("git clone {}", shell_quote(&source.url));
        if let Some(depth) = source.depth {
            clone.push_str(&format!(" --depth {depth}"));
        }
        if let Some(branch) = &source.branch {
            clone.push_str(&format!(" -b {}", shell_quote(branch)));
        }
        clone.push_str(" .");

        info!(url = %source.url, workspace = %workspace.display(), "checking out source");
        self.git(workspace, clone).await?;

        if let Some(commit) = commit_override {
            self.git(workspace, format!("git checkout {}", shell_quote(commit)))
                .await?;
        }

        // %x00-separated fields keep multi-line commit subjects intact.
        let meta = self
            .git(
                workspace,
                "git log -1 --pretty=format:'%H%x00%an%x00%ae%x00%s'".to_string(),
            )
            .await?;
        let mut fields = meta.trim_end_matches('\n').split('\0');
        let commit = fields.next().unwrap_or_default().to_string();
        let author = fields.next().unwrap_or_default().to_string();
        let email = fields.next().unwrap_or_default().to_string();
        let message = fields.next().unwrap_or_default().to_string();

        let branch = self
            .git(workspace, "git rev-parse --abbrev-ref HEAD".to_string())
            .await?
            .trim()
            .to_string();

        if commit.is_empty() {
            return Err(Error::CheckoutFailed("could not read commit metadata".into()));
        }

        Ok(GitInfo {
            commit,
            branch,
            author,
            email,
            message,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Builds a real local repository with the git binary, then checks it out
    // the way a build would.
    async fn init_repo(dir: &Path) {
        let runner = GitProvider::new(Arc::new(ProcessRunner::new()));
        runner
            .git(
                dir,
                "git init -q -b main . && git config user.email ci@example.com && \
                 git config user.name CI && echo hello > README.md && git add . && \
                 git commit -qm 'initial commit'"
                    .to_string(),
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn checkout_extracts_commit_metadata() {
        let origin = tempfile::tempdir().unwrap();
        init_repo(origin.path()).await;

        let workspace = tempfile::tempdir().unwrap();
        let provider = GitProvider::new(Arc::new(ProcessRunner::new()));
        let source = SourceConfig {
            url: origin.path().display().to_string(),
            branch: None,
            depth: None,
        };
        let git = provider.checkout(&source, workspace.path(), None).await.unwrap();
        assert_eq!(git.commit.len(), 40);
        assert_eq!(git.branch, "main");
        assert_eq!(git.author, "CI");
        assert_eq!(git.email, "ci@example.com");
        assert_eq!(git.message, "initial commit");
        assert!(workspace.path().join("README.md").exists());
    }

    #[tokio::test]
    async fn checkout_failure_has_stable_kind() {
        let workspace = tempfile::tempdir().unwrap();
        let provider = GitProvider::new(Arc::new(ProcessRunner::new()));
        let source = SourceConfig {
            url: "/nonexistent/repo".into(),
            branch: None,
            depth: None,
        };
        let err = provider.checkout(&source, workspace.path(), None).await.unwrap_err();
        assert_eq!(err.kind(), "checkout-failed");
    }
}
