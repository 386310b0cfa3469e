//! Artifact cache and stage-result cache stores. Both are first-write-wins
//! via unique keys.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crucible_core::cache::{CacheEntry, StageCacheEntry};
use crucible_core::store::{CacheStore, StageResultStore};
use crucible_core::{Error, ResourceId, Result};

use crate::error::store_err;

#[derive(Debug, sqlx::FromRow)]
struct CacheRow {
    id: Uuid,
    org_id: Uuid,
    job_id: Uuid,
    cache_key: String,
    paths: serde_json::Value,
    size_bytes: i64,
    hit_count: i64,
    created_at: DateTime<Utc>,
}

impl TryFrom<CacheRow> for CacheEntry {
    type Error = Error;

    fn try_from(row: CacheRow) -> Result<CacheEntry> {
        Ok(CacheEntry {
            id: ResourceId::from_uuid(row.id),
            org_id: ResourceId::from_uuid(row.org_id),
            job_id: ResourceId::from_uuid(row.job_id),
            cache_key: row.cache_key,
            paths: serde_json::from_value(row.paths)
                .map_err(|e| Error::Store(format!("paths column: {e}")))?,
            size_bytes: row.size_bytes,
            hit_count: row.hit_count,
            created_at: row.created_at,
        })
    }
}

pub struct PgCacheStore {
    pool: PgPool,
}

impl PgCacheStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CacheStore for PgCacheStore {
    async fn insert(&self, entry: &CacheEntry) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO cache_entries (id, org_id, job_id, cache_key, paths, size_bytes, hit_count, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, 0, $7)
            ON CONFLICT (job_id, cache_key) DO NOTHING
            "#,
        )
        .bind(entry.id.as_uuid())
        .bind(entry.org_id.as_uuid())
        .bind(entry.job_id.as_uuid())
        .bind(&entry.cache_key)
        .bind(serde_json::to_value(&entry.paths).unwrap_or_default())
        .bind(entry.size_bytes)
        .bind(entry.created_at)
        .execute(&self.pool)
        .await
        .map_err(store_err)?;
        Ok(result.rows_affected() > 0)
    }

    async fn find_exact(
        &self,
        org_id: ResourceId,
        job_id: ResourceId,
        key: &str,
    ) -> Result<Option<CacheEntry>> {
        let row = sqlx::query_as::<_, CacheRow>(
            "SELECT * FROM cache_entries WHERE org_id = $1 AND job_id = $2 AND cache_key = $3",
        )
        .bind(org_id.as_uuid())
        .bind(job_id.as_uuid())
        .bind(key)
        .fetch_optional(&self.pool)
        .await
        .map_err(store_err)?;
        row.map(TryInto::try_into).transpose()
    }

    async fn find_latest_with_prefix(
        &self,
        org_id: ResourceId,
        job_id: ResourceId,
        prefix: &str,
    ) -> Result<Option<CacheEntry>> {
        // LIKE with the prefix escaped; most recent save wins.
        let pattern = format!("{}%", prefix.replace('\\', "\\\\").replace('%', "\\%").replace('_', "\\_"));
        let row = sqlx::query_as::<_, CacheRow>(
            r#"
            SELECT * FROM cache_entries
            WHERE org_id = $1 AND job_id = $2 AND cache_key LIKE $3
            ORDER BY created_at DESC
            LIMIT 1
            "#,
        )
        .bind(org_id.as_uuid())
        .bind(job_id.as_uuid())
        .bind(pattern)
        .fetch_optional(&self.pool)
        .await
        .map_err(store_err)?;
        row.map(TryInto::try_into).transpose()
    }

    async fn record_hit(&self, id: ResourceId) -> Result<()> {
        sqlx::query("UPDATE cache_entries SET hit_count = hit_count + 1 WHERE id = $1")
            .bind(id.as_uuid())
            .execute(&self.pool)
            .await
            .map_err(store_err)?;
        Ok(())
    }

    async fn evict_older_than(&self, cutoff: DateTime<Utc>) -> Result<Vec<CacheEntry>> {
        let rows = sqlx::query_as::<_, CacheRow>(
            "DELETE FROM cache_entries WHERE created_at < $1 RETURNING *",
        )
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await
        .map_err(store_err)?;
        rows.into_iter().map(TryInto::try_into).collect()
    }

    async fn evict_to_total_size(&self, max_total_bytes: i64) -> Result<Vec<CacheEntry>> {
        // Newest entries survive; everything past the running-total cap goes.
        let rows = sqlx::query_as::<_, CacheRow>(
            r#"
            DELETE FROM cache_entries WHERE id IN (
                SELECT id FROM (
                    SELECT id, SUM(size_bytes) OVER (ORDER BY created_at DESC, id) AS running
                    FROM cache_entries
                ) ranked
                WHERE running > $1
            )
            RETURNING *
            "#,
        )
        .bind(max_total_bytes)
        .fetch_all(&self.pool)
        .await
        .map_err(store_err)?;
        rows.into_iter().map(TryInto::try_into).collect()
    }
}

#[derive(Debug, sqlx::FromRow)]
struct StageCacheRow {
    org_id: Uuid,
    job_id: Uuid,
    fingerprint: String,
    stage_name: String,
    stage_result: serde_json::Value,
    git_commit: String,
    created_at: DateTime<Utc>,
}

impl TryFrom<StageCacheRow> for StageCacheEntry {
    type Error = Error;

    fn try_from(row: StageCacheRow) -> Result<StageCacheEntry> {
        Ok(StageCacheEntry {
            org_id: ResourceId::from_uuid(row.org_id),
            job_id: ResourceId::from_uuid(row.job_id),
            fingerprint: row.fingerprint,
            stage_name: row.stage_name,
            stage_result: serde_json::from_value(row.stage_result)
                .map_err(|e| Error::Store(format!("stage_result column: {e}")))?,
            git_commit: row.git_commit,
            created_at: row.created_at,
        })
    }
}

pub struct PgStageResultStore {
    pool: PgPool,
}

impl PgStageResultStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl StageResultStore for PgStageResultStore {
    async fn put(&self, entry: &StageCacheEntry) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO stage_cache (org_id, job_id, fingerprint, stage_name, stage_result, git_commit, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (job_id, fingerprint) DO NOTHING
            "#,
        )
        .bind(entry.org_id.as_uuid())
        .bind(entry.job_id.as_uuid())
        .bind(&entry.fingerprint)
        .bind(&entry.stage_name)
        .bind(serde_json::to_value(&entry.stage_result).unwrap_or_default())
        .bind(&entry.git_commit)
        .bind(entry.created_at)
        .execute(&self.pool)
        .await
        .map_err(store_err)?;
        Ok(result.rows_affected() > 0)
    }

    async fn get(
        &self,
        org_id: ResourceId,
        job_id: ResourceId,
        fingerprint: &str,
    ) -> Result<Option<StageCacheEntry>> {
        let row = sqlx::query_as::<_, StageCacheRow>(
            "SELECT * FROM stage_cache WHERE org_id = $1 AND job_id = $2 AND fingerprint = $3",
        )
        .bind(org_id.as_uuid())
        .bind(job_id.as_uuid())
        .bind(fingerprint)
        .fetch_optional(&self.pool)
        .await
        .map_err(store_err)?;
        row.map(TryInto::try_into).transpose()
    }
}
