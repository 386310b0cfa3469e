//! Job store.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crucible_core::job::Job;
use crucible_core::store::JobStore;
use crucible_core::{Error, ResourceId, Result};

use crate::error::store_err;

#[derive(Debug, sqlx::FromRow)]
struct JobRow {
    id: Uuid,
    org_id: Uuid,
    name: String,
    description: Option<String>,
    pipeline_value: Option<serde_json::Value>,
    parameter_defs: serde_json::Value,
    trigger_config: serde_json::Value,
    source_config: Option<serde_json::Value>,
    agent_labels: serde_json::Value,
    priority: Option<String>,
    created_at: DateTime<Utc>,
}

impl TryFrom<JobRow> for Job {
    type Error = Error;

    fn try_from(row: JobRow) -> Result<Job> {
        let column = |e: serde_json::Error| Error::Store(format!("jobs column: {e}"));
        Ok(Job {
            id: ResourceId::from_uuid(row.id),
            org_id: ResourceId::from_uuid(row.org_id),
            name: row.name,
            description: row.description,
            pipeline_value: row
                .pipeline_value
                .map(serde_json::from_value)
                .transpose()
                .map_err(column)?,
            parameter_defs: serde_json::from_value(row.parameter_defs).map_err(column)?,
            trigger_config: serde_json::from_value(row.trigger_config).map_err(column)?,
            source_config: row
                .source_config
                .map(serde_json::from_value)
                .transpose()
                .map_err(column)?,
            agent_labels: serde_json::from_value(row.agent_labels).map_err(column)?,
            priority: row
                .priority
                .map(|p| serde_json::from_value(serde_json::Value::String(p)))
                .transpose()
                .map_err(column)?,
            created_at: row.created_at,
        })
    }
}

pub struct PgJobStore {
    pool: PgPool,
}

impl PgJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl JobStore for PgJobStore {
    async fn create(&self, job: &Job) -> Result<()> {
        let column = |e: serde_json::Error| Error::Store(format!("jobs column: {e}"));
        sqlx::query(
            r#"
            INSERT INTO jobs (
                id, org_id, name, description, pipeline_value, parameter_defs,
                trigger_config, source_config, agent_labels, priority, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(job.id.as_uuid())
        .bind(job.org_id.as_uuid())
        .bind(&job.name)
        .bind(&job.description)
        .bind(
            job.pipeline_value
                .as_ref()
                .map(serde_json::to_value)
                .transpose()
                .map_err(column)?,
        )
        .bind(serde_json::to_value(&job.parameter_defs).map_err(column)?)
        .bind(serde_json::to_value(&job.trigger_config).map_err(column)?)
        .bind(
            job.source_config
                .as_ref()
                .map(serde_json::to_value)
                .transpose()
                .map_err(column)?,
        )
        .bind(serde_json::to_value(&job.agent_labels).map_err(column)?)
        .bind(job.priority.as_ref().map(|p| p.as_str()))
        .bind(job.created_at)
        .execute(&self.pool)
        .await
        .map_err(store_err)?;
        Ok(())
    }

    async fn get(&self, org_id: ResourceId, id: ResourceId) -> Result<Job> {
        let row = sqlx::query_as::<_, JobRow>("SELECT * FROM jobs WHERE id = $1 AND org_id = $2")
            .bind(id.as_uuid())
            .bind(org_id.as_uuid())
            .fetch_optional(&self.pool)
            .await
            .map_err(store_err)?
            .ok_or_else(|| Error::NotFound(format!("job {id}")))?;
        row.try_into()
    }

    async fn find_by_name(&self, org_id: ResourceId, name: &str) -> Result<Option<Job>> {
        let row = sqlx::query_as::<_, JobRow>(
            "SELECT * FROM jobs WHERE org_id = $1 AND name = $2",
        )
        .bind(org_id.as_uuid())
        .bind(name)
        .fetch_optional(&self.pool)
        .await
        .map_err(store_err)?;
        row.map(TryInto::try_into).transpose()
    }

    async fn list(&self, org_id: ResourceId) -> Result<Vec<Job>> {
        let rows = sqlx::query_as::<_, JobRow>(
            "SELECT * FROM jobs WHERE org_id = $1 ORDER BY name",
        )
        .bind(org_id.as_uuid())
        .fetch_all(&self.pool)
        .await
        .map_err(store_err)?;
        rows.into_iter().map(TryInto::try_into).collect()
    }
}
