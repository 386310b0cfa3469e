//! Agent store.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crucible_core::agent::{Agent, AgentStatus};
use crucible_core::store::AgentStore;
use crucible_core::{Error, ResourceId, Result};

use crate::error::store_err;

#[derive(Debug, sqlx::FromRow)]
struct AgentRow {
    id: Uuid,
    org_id: Option<Uuid>,
    name: String,
    url: String,
    labels: serde_json::Value,
    max_builds: i32,
    current_builds: i32,
    cpu_cores: i32,
    memory_gb: i32,
    region: Option<String>,
    last_heartbeat_at: DateTime<Utc>,
    status: String,
}

impl TryFrom<AgentRow> for Agent {
    type Error = Error;

    fn try_from(row: AgentRow) -> Result<Agent> {
        let status = match row.status.as_str() {
            "online" => AgentStatus::Online,
            "offline" => AgentStatus::Offline,
            other => return Err(Error::Store(format!("unknown agent status: {other}"))),
        };
        Ok(Agent {
            id: ResourceId::from_uuid(row.id),
            org_id: row.org_id.map(ResourceId::from_uuid),
            name: row.name,
            url: row.url,
            labels: serde_json::from_value(row.labels)
                .map_err(|e| Error::Store(format!("labels column: {e}")))?,
            max_builds: row.max_builds as u32,
            current_builds: row.current_builds as u32,
            cpu_cores: row.cpu_cores as u32,
            memory_gb: row.memory_gb as u32,
            region: row.region,
            last_heartbeat_at: row.last_heartbeat_at,
            status,
        })
    }
}

pub struct PgAgentStore {
    pool: PgPool,
}

impl PgAgentStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl AgentStore for PgAgentStore {
    async fn upsert(&self, agent: &Agent) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO agents (
                id, org_id, name, url, labels, max_builds, current_builds,
                cpu_cores, memory_gb, region, last_heartbeat_at, status
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            ON CONFLICT (id) DO UPDATE SET
                org_id = EXCLUDED.org_id,
                name = EXCLUDED.name,
                url = EXCLUDED.url,
                labels = EXCLUDED.labels,
                max_builds = EXCLUDED.max_builds,
                current_builds = EXCLUDED.current_builds,
                cpu_cores = EXCLUDED.cpu_cores,
                memory_gb = EXCLUDED.memory_gb,
                region = EXCLUDED.region,
                last_heartbeat_at = EXCLUDED.last_heartbeat_at,
                status = EXCLUDED.status
            "#,
        )
        .bind(agent.id.as_uuid())
        .bind(agent.org_id.map(|id| *id.as_uuid()))
        .bind(&agent.name)
        .bind(&agent.url)
        .bind(serde_json::to_value(&agent.labels).unwrap_or_default())
        .bind(agent.max_builds as i32)
        .bind(agent.current_builds as i32)
        .bind(agent.cpu_cores as i32)
        .bind(agent.memory_gb as i32)
        .bind(&agent.region)
        .bind(agent.last_heartbeat_at)
        .bind(agent.status.as_str())
        .execute(&self.pool)
        .await
        .map_err(store_err)?;
        Ok(())
    }

    async fn get(&self, id: ResourceId) -> Result<Option<Agent>> {
        let row = sqlx::query_as::<_, AgentRow>("SELECT * FROM agents WHERE id = $1")
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await
            .map_err(store_err)?;
        row.map(TryInto::try_into).transpose()
    }

    async fn list(&self) -> Result<Vec<Agent>> {
        let rows = sqlx::query_as::<_, AgentRow>("SELECT * FROM agents ORDER BY name")
            .fetch_all(&self.pool)
            .await
            .map_err(store_err)?;
        rows.into_iter().map(TryInto::try_into).collect()
    }
}
