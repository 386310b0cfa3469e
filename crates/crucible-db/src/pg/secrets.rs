//! Sealed secret store.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crucible_core::secret::{SecretAccess, SecretRecord, SecretScope};
use crucible_core::store::SecretStore;
use crucible_core::{Error, ResourceId, Result};

use crate::error::store_err;

#[derive(Debug, sqlx::FromRow)]
struct SecretRow {
    id: Uuid,
    org_id: Uuid,
    scope: String,
    scope_job_id: Option<Uuid>,
    name: String,
    ciphertext_b64: String,
    iv_b64: String,
    created_at: DateTime<Utc>,
}

impl TryFrom<SecretRow> for SecretRecord {
    type Error = Error;

    fn try_from(row: SecretRow) -> Result<SecretRecord> {
        let scope = match (row.scope.as_str(), row.scope_job_id) {
            ("global", _) => SecretScope::Global,
            ("job", Some(job_id)) => SecretScope::Job(ResourceId::from_uuid(job_id)),
            (other, _) => return Err(Error::Store(format!("unknown secret scope: {other}"))),
        };
        Ok(SecretRecord {
            id: ResourceId::from_uuid(row.id),
            org_id: ResourceId::from_uuid(row.org_id),
            scope,
            name: row.name,
            ciphertext_b64: row.ciphertext_b64,
            iv_b64: row.iv_b64,
            created_at: row.created_at,
        })
    }
}

pub struct PgSecretStore {
    pool: PgPool,
}

impl PgSecretStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SecretStore for PgSecretStore {
    async fn put(&self, secret: &SecretRecord) -> Result<()> {
        let (scope, scope_job_id) = match &secret.scope {
            SecretScope::Global => ("global", None),
            SecretScope::Job(job_id) => ("job", Some(*job_id.as_uuid())),
        };
        sqlx::query(
            r#"
            INSERT INTO secrets (id, org_id, scope, scope_job_id, name, ciphertext_b64, iv_b64, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (org_id, scope, scope_job_id, name) DO UPDATE SET
                ciphertext_b64 = EXCLUDED.ciphertext_b64,
                iv_b64 = EXCLUDED.iv_b64
            "#,
        )
        .bind(secret.id.as_uuid())
        .bind(secret.org_id.as_uuid())
        .bind(scope)
        .bind(scope_job_id)
        .bind(&secret.name)
        .bind(&secret.ciphertext_b64)
        .bind(&secret.iv_b64)
        .bind(secret.created_at)
        .execute(&self.pool)
        .await
        .map_err(store_err)?;
        Ok(())
    }

    async fn list_for_job(&self, org_id: ResourceId, job_id: ResourceId) -> Result<Vec<SecretRecord>> {
        let rows = sqlx::query_as::<_, SecretRow>(
            r#"
            SELECT * FROM secrets
            WHERE org_id = $1 AND (scope = 'global' OR (scope = 'job' AND scope_job_id = $2))
            ORDER BY name
            "#,
        )
        .bind(org_id.as_uuid())
        .bind(job_id.as_uuid())
        .fetch_all(&self.pool)
        .await
        .map_err(store_err)?;
        rows.into_iter().map(TryInto::try_into).collect()
    }

    async fn log_access(&self, access: &SecretAccess) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO secret_accesses (secret_id, org_id, build_id, accessed_at)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(access.secret_id.as_uuid())
        .bind(access.org_id.as_uuid())
        .bind(access.build_id.map(|id| *id.as_uuid()))
        .bind(access.accessed_at)
        .execute(&self.pool)
        .await
        .map_err(store_err)?;
        Ok(())
    }
}
