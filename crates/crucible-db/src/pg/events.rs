//! Event store.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crucible_core::event::{BuildEvent, EventId};
use crucible_core::store::EventStore;
use crucible_core::{Error, ResourceId, Result};

use crate::error::store_err;

#[derive(Debug, sqlx::FromRow)]
struct EventRow {
    event_id: String,
    build_id: Uuid,
    org_id: Uuid,
    kind: String,
    stage_name: Option<String>,
    step_name: Option<String>,
    payload: serde_json::Value,
    created_at: DateTime<Utc>,
}

impl TryFrom<EventRow> for BuildEvent {
    type Error = Error;

    fn try_from(row: EventRow) -> Result<BuildEvent> {
        let kind = serde_json::from_value(serde_json::Value::String(row.kind))
            .map_err(|e| Error::Store(format!("event kind: {e}")))?;
        Ok(BuildEvent {
            event_id: EventId::from_string(row.event_id)?,
            build_id: ResourceId::from_uuid(row.build_id),
            org_id: ResourceId::from_uuid(row.org_id),
            kind,
            stage_name: row.stage_name,
            step_name: row.step_name,
            payload: row.payload,
            created_at: row.created_at,
        })
    }
}

pub struct PgEventStore {
    pool: PgPool,
}

impl PgEventStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl EventStore for PgEventStore {
    async fn append(&self, event: &BuildEvent) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO build_events (
                event_id, build_id, org_id, kind, stage_name, step_name, payload, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(event.event_id.as_str())
        .bind(event.build_id.as_uuid())
        .bind(event.org_id.as_uuid())
        .bind(event.kind.as_str())
        .bind(&event.stage_name)
        .bind(&event.step_name)
        .bind(&event.payload)
        .bind(event.created_at)
        .execute(&self.pool)
        .await
        .map_err(store_err)?;
        Ok(())
    }

    async fn replay(
        &self,
        build_id: ResourceId,
        after: Option<&EventId>,
        limit: usize,
    ) -> Result<Vec<BuildEvent>> {
        let rows = sqlx::query_as::<_, EventRow>(
            r#"
            SELECT * FROM build_events
            WHERE build_id = $1 AND ($2::TEXT IS NULL OR event_id > $2)
            ORDER BY event_id ASC
            LIMIT $3
            "#,
        )
        .bind(build_id.as_uuid())
        .bind(after.map(EventId::as_str))
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(store_err)?;
        rows.into_iter().map(TryInto::try_into).collect()
    }

    async fn delete_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM build_events WHERE created_at < $1")
            .bind(cutoff)
            .execute(&self.pool)
            .await
            .map_err(store_err)?;
        Ok(result.rows_affected())
    }
}
