//! Durable priority queue.
//!
//! Dequeue uses `FOR UPDATE SKIP LOCKED` so concurrent drainers never claim
//! the same entry.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crucible_core::queue::{Priority, QueueEntry, QueueEntryStatus};
use crucible_core::store::QueueStore;
use crucible_core::{Error, ResourceId, Result};

use crate::error::store_err;

#[derive(Debug, sqlx::FromRow)]
struct QueueRow {
    id: Uuid,
    org_id: Uuid,
    job_id: Uuid,
    priority: i32,
    payload: serde_json::Value,
    status: String,
    enqueued_at: DateTime<Utc>,
    claimed_at: Option<DateTime<Utc>>,
    claimed_by: Option<String>,
}

impl TryFrom<QueueRow> for QueueEntry {
    type Error = Error;

    fn try_from(row: QueueRow) -> Result<QueueEntry> {
        let priority = match row.priority {
            2 => Priority::High,
            1 => Priority::Normal,
            _ => Priority::Low,
        };
        let status = match row.status.as_str() {
            "pending" => QueueEntryStatus::Pending,
            "claimed" => QueueEntryStatus::Claimed,
            "done" => QueueEntryStatus::Done,
            other => return Err(Error::Store(format!("unknown queue status: {other}"))),
        };
        Ok(QueueEntry {
            id: ResourceId::from_uuid(row.id),
            org_id: ResourceId::from_uuid(row.org_id),
            job_id: ResourceId::from_uuid(row.job_id),
            priority,
            payload: row.payload,
            status,
            enqueued_at: row.enqueued_at,
            claimed_at: row.claimed_at,
            claimed_by: row.claimed_by,
        })
    }
}

pub struct PgQueueStore {
    pool: PgPool,
}

impl PgQueueStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl QueueStore for PgQueueStore {
    async fn enqueue(&self, entry: &QueueEntry) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO build_queue (id, org_id, job_id, priority, payload, status, enqueued_at)
            VALUES ($1, $2, $3, $4, $5, 'pending', $6)
            "#,
        )
        .bind(entry.id.as_uuid())
        .bind(entry.org_id.as_uuid())
        .bind(entry.job_id.as_uuid())
        .bind(entry.priority.rank())
        .bind(&entry.payload)
        .bind(entry.enqueued_at)
        .execute(&self.pool)
        .await
        .map_err(store_err)?;
        Ok(())
    }

    async fn dequeue(&self, worker_id: &str) -> Result<Option<QueueEntry>> {
        let row = sqlx::query_as::<_, QueueRow>(
            r#"
            UPDATE build_queue
            SET status = 'claimed', claimed_by = $1, claimed_at = NOW()
            WHERE id = (
                SELECT id FROM build_queue
                WHERE status = 'pending'
                ORDER BY priority DESC, enqueued_at ASC
                FOR UPDATE SKIP LOCKED
                LIMIT 1
            )
            RETURNING *
            "#,
        )
        .bind(worker_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(store_err)?;
        row.map(TryInto::try_into).transpose()
    }

    async fn complete(&self, id: ResourceId) -> Result<()> {
        sqlx::query("UPDATE build_queue SET status = 'done' WHERE id = $1")
            .bind(id.as_uuid())
            .execute(&self.pool)
            .await
            .map_err(store_err)?;
        Ok(())
    }

    async fn pending_depth(&self) -> Result<u64> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM build_queue WHERE status = 'pending'")
                .fetch_one(&self.pool)
                .await
                .map_err(store_err)?;
        Ok(count as u64)
    }

    async fn release_claimed_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE build_queue
            SET status = 'pending', claimed_by = NULL, claimed_at = NULL
            WHERE status = 'claimed' AND claimed_at < $1
            "#,
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await
        .map_err(store_err)?;
        Ok(result.rows_affected())
    }
}
