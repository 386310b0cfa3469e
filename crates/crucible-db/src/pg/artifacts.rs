//! Artifact record store.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crucible_core::artifact::ArtifactRecord;
use crucible_core::store::ArtifactStore;
use crucible_core::{Error, ResourceId, Result};

use crate::error::store_err;

#[derive(Debug, sqlx::FromRow)]
struct ArtifactRow {
    id: Uuid,
    build_id: Uuid,
    org_id: Uuid,
    filename: String,
    path: String,
    size_bytes: i64,
    content_type: String,
    sha256: String,
    delta_base_id: Option<Uuid>,
    is_delta: bool,
    original_size_bytes: Option<i64>,
    created_at: DateTime<Utc>,
}

impl TryFrom<ArtifactRow> for ArtifactRecord {
    type Error = Error;

    fn try_from(row: ArtifactRow) -> Result<ArtifactRecord> {
        Ok(ArtifactRecord {
            id: ResourceId::from_uuid(row.id),
            build_id: ResourceId::from_uuid(row.build_id),
            org_id: ResourceId::from_uuid(row.org_id),
            filename: row.filename,
            path: row.path,
            size_bytes: row.size_bytes,
            content_type: row.content_type,
            sha256: row.sha256,
            delta_base_id: row.delta_base_id.map(ResourceId::from_uuid),
            is_delta: row.is_delta,
            original_size_bytes: row.original_size_bytes,
            created_at: row.created_at,
        })
    }
}

pub struct PgArtifactStore {
    pool: PgPool,
}

impl PgArtifactStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ArtifactStore for PgArtifactStore {
    async fn insert(&self, artifact: &ArtifactRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO build_artifacts (
                id, build_id, org_id, filename, path, size_bytes, content_type,
                sha256, delta_base_id, is_delta, original_size_bytes, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            "#,
        )
        .bind(artifact.id.as_uuid())
        .bind(artifact.build_id.as_uuid())
        .bind(artifact.org_id.as_uuid())
        .bind(&artifact.filename)
        .bind(&artifact.path)
        .bind(artifact.size_bytes)
        .bind(&artifact.content_type)
        .bind(&artifact.sha256)
        .bind(artifact.delta_base_id.map(|id| *id.as_uuid()))
        .bind(artifact.is_delta)
        .bind(artifact.original_size_bytes)
        .bind(artifact.created_at)
        .execute(&self.pool)
        .await
        .map_err(store_err)?;
        Ok(())
    }

    async fn get(&self, id: ResourceId) -> Result<Option<ArtifactRecord>> {
        let row = sqlx::query_as::<_, ArtifactRow>("SELECT * FROM build_artifacts WHERE id = $1")
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await
            .map_err(store_err)?;
        row.map(TryInto::try_into).transpose()
    }

    async fn list_for_build(&self, build_id: ResourceId) -> Result<Vec<ArtifactRecord>> {
        let rows = sqlx::query_as::<_, ArtifactRow>(
            "SELECT * FROM build_artifacts WHERE build_id = $1 ORDER BY filename",
        )
        .bind(build_id.as_uuid())
        .fetch_all(&self.pool)
        .await
        .map_err(store_err)?;
        rows.into_iter().map(TryInto::try_into).collect()
    }

    async fn find_latest_for_job(
        &self,
        org_id: ResourceId,
        job_id: ResourceId,
        filename: &str,
        before_build: ResourceId,
    ) -> Result<Option<ArtifactRecord>> {
        let row = sqlx::query_as::<_, ArtifactRow>(
            r#"
            SELECT a.* FROM build_artifacts a
            JOIN builds b ON b.id = a.build_id
            WHERE a.org_id = $1 AND b.job_id = $2 AND a.filename = $3 AND a.build_id <> $4
            ORDER BY a.created_at DESC
            LIMIT 1
            "#,
        )
        .bind(org_id.as_uuid())
        .bind(job_id.as_uuid())
        .bind(filename)
        .bind(before_build.as_uuid())
        .fetch_optional(&self.pool)
        .await
        .map_err(store_err)?;
        row.map(TryInto::try_into).transpose()
    }
}
