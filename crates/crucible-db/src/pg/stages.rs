//! Stage and step record stores.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crucible_core::build::{StageRecord, StepRecord};
use crucible_core::store::{StageStore, StepStore};
use crucible_core::{Error, ResourceId, Result};

use crate::error::store_err;

#[derive(Debug, sqlx::FromRow)]
struct StageRow {
    id: Uuid,
    build_id: Uuid,
    org_id: Uuid,
    name: String,
    status: String,
    started_at: DateTime<Utc>,
    finished_at: Option<DateTime<Utc>>,
    exit_code: Option<i32>,
    error_message: Option<String>,
    container_image: Option<String>,
}

impl TryFrom<StageRow> for StageRecord {
    type Error = Error;

    fn try_from(row: StageRow) -> Result<StageRecord> {
        Ok(StageRecord {
            id: ResourceId::from_uuid(row.id),
            build_id: ResourceId::from_uuid(row.build_id),
            org_id: ResourceId::from_uuid(row.org_id),
            name: row.name,
            status: row.status.parse()?,
            started_at: row.started_at,
            finished_at: row.finished_at,
            exit_code: row.exit_code,
            error_message: row.error_message,
            container_image: row.container_image,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct StepRow {
    id: Uuid,
    build_id: Uuid,
    org_id: Uuid,
    stage_name: String,
    name: String,
    status: String,
    started_at: DateTime<Utc>,
    finished_at: Option<DateTime<Utc>>,
    exit_code: Option<i32>,
    error_message: Option<String>,
    container_image: Option<String>,
}

impl TryFrom<StepRow> for StepRecord {
    type Error = Error;

    fn try_from(row: StepRow) -> Result<StepRecord> {
        Ok(StepRecord {
            id: ResourceId::from_uuid(row.id),
            build_id: ResourceId::from_uuid(row.build_id),
            org_id: ResourceId::from_uuid(row.org_id),
            stage_name: row.stage_name,
            name: row.name,
            status: row.status.parse()?,
            started_at: row.started_at,
            finished_at: row.finished_at,
            exit_code: row.exit_code,
            error_message: row.error_message,
            container_image: row.container_image,
        })
    }
}

pub struct PgStageStore {
    pool: PgPool,
}

impl PgStageStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl StageStore for PgStageStore {
    async fn insert(&self, stage: &StageRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO build_stages (
                id, build_id, org_id, name, status, started_at, finished_at,
                exit_code, error_message, container_image
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(stage.id.as_uuid())
        .bind(stage.build_id.as_uuid())
        .bind(stage.org_id.as_uuid())
        .bind(&stage.name)
        .bind(stage.status.as_str())
        .bind(stage.started_at)
        .bind(stage.finished_at)
        .bind(stage.exit_code)
        .bind(&stage.error_message)
        .bind(&stage.container_image)
        .execute(&self.pool)
        .await
        .map_err(store_err)?;
        Ok(())
    }

    async fn update(&self, stage: &StageRecord) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE build_stages
            SET status = $2, finished_at = $3, exit_code = $4, error_message = $5
            WHERE id = $1
            "#,
        )
        .bind(stage.id.as_uuid())
        .bind(stage.status.as_str())
        .bind(stage.finished_at)
        .bind(stage.exit_code)
        .bind(&stage.error_message)
        .execute(&self.pool)
        .await
        .map_err(store_err)?;
        Ok(())
    }

    async fn list_for_build(&self, build_id: ResourceId) -> Result<Vec<StageRecord>> {
        let rows = sqlx::query_as::<_, StageRow>(
            "SELECT * FROM build_stages WHERE build_id = $1 ORDER BY started_at",
        )
        .bind(build_id.as_uuid())
        .fetch_all(&self.pool)
        .await
        .map_err(store_err)?;
        rows.into_iter().map(TryInto::try_into).collect()
    }
}

pub struct PgStepStore {
    pool: PgPool,
}

impl PgStepStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl StepStore for PgStepStore {
    async fn insert(&self, step: &StepRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO build_steps (
                id, build_id, org_id, stage_name, name, status, started_at,
                finished_at, exit_code, error_message, container_image
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(step.id.as_uuid())
        .bind(step.build_id.as_uuid())
        .bind(step.org_id.as_uuid())
        .bind(&step.stage_name)
        .bind(&step.name)
        .bind(step.status.as_str())
        .bind(step.started_at)
        .bind(step.finished_at)
        .bind(step.exit_code)
        .bind(&step.error_message)
        .bind(&step.container_image)
        .execute(&self.pool)
        .await
        .map_err(store_err)?;
        Ok(())
    }

    async fn update(&self, step: &StepRecord) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE build_steps
            SET status = $2, finished_at = $3, exit_code = $4, error_message = $5
            WHERE id = $1
            "#,
        )
        .bind(step.id.as_uuid())
        .bind(step.status.as_str())
        .bind(step.finished_at)
        .bind(step.exit_code)
        .bind(&step.error_message)
        .execute(&self.pool)
        .await
        .map_err(store_err)?;
        Ok(())
    }

    async fn list_for_build(&self, build_id: ResourceId) -> Result<Vec<StepRecord>> {
        let rows = sqlx::query_as::<_, StepRow>(
            "SELECT * FROM build_steps WHERE build_id = $1 ORDER BY started_at",
        )
        .bind(build_id.as_uuid())
        .fetch_all(&self.pool)
        .await
        .map_err(store_err)?;
        rows.into_iter().map(TryInto::try_into).collect()
    }
}
