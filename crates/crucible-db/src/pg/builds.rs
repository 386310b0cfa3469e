//! Build store.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crucible_core::build::{Build, BuildStatus, GitInfo, PipelineSource};
use crucible_core::store::BuildStore;
use crucible_core::{Error, ResourceId, Result};

use crate::error::store_err;

#[derive(Debug, sqlx::FromRow)]
struct BuildRow {
    id: Uuid,
    job_id: Uuid,
    org_id: Uuid,
    build_number: i64,
    status: String,
    trigger_type: String,
    parameters: serde_json::Value,
    workspace_path: Option<String>,
    agent_id: Option<Uuid>,
    dispatched_at: Option<DateTime<Utc>>,
    started_at: DateTime<Utc>,
    finished_at: Option<DateTime<Utc>>,
    git_commit: Option<String>,
    git_branch: Option<String>,
    git_author: Option<String>,
    git_email: Option<String>,
    git_message: Option<String>,
    attempt_number: i32,
    root_build_id: Uuid,
    pipeline_source: Option<String>,
    error_message: Option<String>,
}

impl TryFrom<BuildRow> for Build {
    type Error = Error;

    fn try_from(row: BuildRow) -> Result<Build> {
        let git = row.git_commit.map(|commit| GitInfo {
            commit,
            branch: row.git_branch.unwrap_or_default(),
            author: row.git_author.unwrap_or_default(),
            email: row.git_email.unwrap_or_default(),
            message: row.git_message.unwrap_or_default(),
        });
        Ok(Build {
            id: ResourceId::from_uuid(row.id),
            job_id: ResourceId::from_uuid(row.job_id),
            org_id: ResourceId::from_uuid(row.org_id),
            build_number: row.build_number,
            status: row.status.parse()?,
            trigger_type: row.trigger_type.parse()?,
            parameters: serde_json::from_value(row.parameters)
                .map_err(|e| Error::Store(format!("parameters column: {e}")))?,
            workspace_path: row.workspace_path,
            agent_id: row.agent_id.map(ResourceId::from_uuid),
            dispatched_at: row.dispatched_at,
            started_at: row.started_at,
            finished_at: row.finished_at,
            git,
            attempt_number: row.attempt_number,
            root_build_id: ResourceId::from_uuid(row.root_build_id),
            pipeline_source: row.pipeline_source.as_deref().map(str::parse).transpose()?,
            error_message: row.error_message,
        })
    }
}

pub struct PgBuildStore {
    pool: PgPool,
}

impl PgBuildStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl BuildStore for PgBuildStore {
    async fn create(&self, build: &Build) -> Result<Build> {
        let row = sqlx::query_as::<_, BuildRow>(
            r#"
            INSERT INTO builds (
                id, job_id, org_id, build_number, status, trigger_type, parameters,
                started_at, attempt_number, root_build_id
            )
            VALUES (
                $1, $2, $3,
                (SELECT COALESCE(MAX(build_number), 0) + 1 FROM builds WHERE job_id = $2),
                $4, $5, $6, $7, $8, $9
            )
            RETURNING *
            "#,
        )
        .bind(build.id.as_uuid())
        .bind(build.job_id.as_uuid())
        .bind(build.org_id.as_uuid())
        .bind(build.status.as_str())
        .bind(build.trigger_type.as_str())
        .bind(serde_json::to_value(&build.parameters).unwrap_or_default())
        .bind(build.started_at)
        .bind(build.attempt_number)
        .bind(build.root_build_id.as_uuid())
        .fetch_one(&self.pool)
        .await
        .map_err(store_err)?;
        row.try_into()
    }

    async fn get(&self, org_id: ResourceId, id: ResourceId) -> Result<Build> {
        let row = sqlx::query_as::<_, BuildRow>(
            "SELECT * FROM builds WHERE id = $1 AND org_id = $2",
        )
        .bind(id.as_uuid())
        .bind(org_id.as_uuid())
        .fetch_optional(&self.pool)
        .await
        .map_err(store_err)?
        .ok_or_else(|| Error::NotFound(format!("build {id}")))?;
        row.try_into()
    }

    async fn find(&self, id: ResourceId) -> Result<Option<Build>> {
        let row = sqlx::query_as::<_, BuildRow>("SELECT * FROM builds WHERE id = $1")
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await
            .map_err(store_err)?;
        row.map(TryInto::try_into).transpose()
    }

    async fn mark_running(&self, id: ResourceId, workspace_path: &str) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE builds SET status = 'running', workspace_path = $2
            WHERE id = $1 AND status IN ('queued', 'running')
            "#,
        )
        .bind(id.as_uuid())
        .bind(workspace_path)
        .execute(&self.pool)
        .await
        .map_err(store_err)?;
        Ok(())
    }

    async fn set_git(&self, id: ResourceId, git: &GitInfo) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE builds
            SET git_commit = $2, git_branch = $3, git_author = $4, git_email = $5, git_message = $6
            WHERE id = $1
            "#,
        )
        .bind(id.as_uuid())
        .bind(&git.commit)
        .bind(&git.branch)
        .bind(&git.author)
        .bind(&git.email)
        .bind(&git.message)
        .execute(&self.pool)
        .await
        .map_err(store_err)?;
        Ok(())
    }

    async fn set_pipeline_source(&self, id: ResourceId, source: PipelineSource) -> Result<()> {
        sqlx::query("UPDATE builds SET pipeline_source = $2 WHERE id = $1")
            .bind(id.as_uuid())
            .bind(source.as_str())
            .execute(&self.pool)
            .await
            .map_err(store_err)?;
        Ok(())
    }

    async fn set_dispatched(&self, id: ResourceId, agent_id: ResourceId) -> Result<()> {
        sqlx::query("UPDATE builds SET agent_id = $2, dispatched_at = NOW() WHERE id = $1")
            .bind(id.as_uuid())
            .bind(agent_id.as_uuid())
            .execute(&self.pool)
            .await
            .map_err(store_err)?;
        Ok(())
    }

    async fn finalize(
        &self,
        id: ResourceId,
        status: BuildStatus,
        error_message: Option<&str>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE builds
            SET status = $2, error_message = COALESCE($3, error_message), finished_at = NOW()
            WHERE id = $1 AND status NOT IN ('success', 'failure', 'aborted')
            "#,
        )
        .bind(id.as_uuid())
        .bind(status.as_str())
        .bind(error_message)
        .execute(&self.pool)
        .await
        .map_err(store_err)?;
        Ok(result.rows_affected() > 0)
    }

    async fn find_recent_for_commit(
        &self,
        org_id: ResourceId,
        job_id: ResourceId,
        commit: &str,
        since: DateTime<Utc>,
    ) -> Result<Option<Build>> {
        let row = sqlx::query_as::<_, BuildRow>(
            r#"
            SELECT * FROM builds
            WHERE org_id = $1 AND job_id = $2 AND git_commit = $3
              AND status IN ('queued', 'running', 'success')
              AND started_at >= $4
            ORDER BY started_at DESC
            LIMIT 1
            "#,
        )
        .bind(org_id.as_uuid())
        .bind(job_id.as_uuid())
        .bind(commit)
        .bind(since)
        .fetch_optional(&self.pool)
        .await
        .map_err(store_err)?;
        row.map(TryInto::try_into).transpose()
    }

    async fn list_for_job(
        &self,
        org_id: ResourceId,
        job_id: ResourceId,
        limit: i64,
    ) -> Result<Vec<Build>> {
        let rows = sqlx::query_as::<_, BuildRow>(
            r#"
            SELECT * FROM builds
            WHERE org_id = $1 AND job_id = $2
            ORDER BY started_at DESC
            LIMIT $3
            "#,
        )
        .bind(org_id.as_uuid())
        .bind(job_id.as_uuid())
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(store_err)?;
        rows.into_iter().map(TryInto::try_into).collect()
    }

    async fn list_by_status(&self, status: BuildStatus) -> Result<Vec<Build>> {
        let rows = sqlx::query_as::<_, BuildRow>("SELECT * FROM builds WHERE status = $1")
            .bind(status.as_str())
            .fetch_all(&self.pool)
            .await
            .map_err(store_err)?;
        rows.into_iter().map(TryInto::try_into).collect()
    }
}
