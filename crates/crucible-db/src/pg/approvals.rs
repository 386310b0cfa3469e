//! Approval gate store.
//!
//! Approve/reject run in a transaction with a row lock so counts stay exact
//! under concurrent approvers.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crucible_core::approval::{ApprovalGate, GateStatus};
use crucible_core::store::ApprovalStore;
use crucible_core::{Error, ResourceId, Result};

use crate::error::store_err;

#[derive(Debug, sqlx::FromRow)]
struct GateRow {
    id: Uuid,
    build_id: Uuid,
    org_id: Uuid,
    stage_name: String,
    required_approvals: i32,
    approval_count: i32,
    approver_ids: serde_json::Value,
    status: String,
    created_at: DateTime<Utc>,
    timeout_at: DateTime<Utc>,
}

impl TryFrom<GateRow> for ApprovalGate {
    type Error = Error;

    fn try_from(row: GateRow) -> Result<ApprovalGate> {
        let status = parse_status(&row.status)?;
        Ok(ApprovalGate {
            id: ResourceId::from_uuid(row.id),
            build_id: ResourceId::from_uuid(row.build_id),
            org_id: ResourceId::from_uuid(row.org_id),
            stage_name: row.stage_name,
            required_approvals: row.required_approvals as u32,
            approval_count: row.approval_count as u32,
            approver_ids: serde_json::from_value(row.approver_ids)
                .map_err(|e| Error::Store(format!("approver_ids column: {e}")))?,
            status,
            created_at: row.created_at,
            timeout_at: row.timeout_at,
        })
    }
}

fn parse_status(s: &str) -> Result<GateStatus> {
    match s {
        "pending" => Ok(GateStatus::Pending),
        "approved" => Ok(GateStatus::Approved),
        "rejected" => Ok(GateStatus::Rejected),
        "timed-out" => Ok(GateStatus::TimedOut),
        other => Err(Error::Store(format!("unknown gate status: {other}"))),
    }
}

pub struct PgApprovalStore {
    pool: PgPool,
}

impl PgApprovalStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ApprovalStore for PgApprovalStore {
    async fn create(&self, gate: &ApprovalGate) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO build_approvals (
                id, build_id, org_id, stage_name, required_approvals, approval_count,
                approver_ids, status, created_at, timeout_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(gate.id.as_uuid())
        .bind(gate.build_id.as_uuid())
        .bind(gate.org_id.as_uuid())
        .bind(&gate.stage_name)
        .bind(gate.required_approvals as i32)
        .bind(gate.approval_count as i32)
        .bind(serde_json::to_value(&gate.approver_ids).unwrap_or_default())
        .bind(gate.status.as_str())
        .bind(gate.created_at)
        .bind(gate.timeout_at)
        .execute(&self.pool)
        .await
        .map_err(store_err)?;
        Ok(())
    }

    async fn get(&self, id: ResourceId) -> Result<ApprovalGate> {
        let row = sqlx::query_as::<_, GateRow>("SELECT * FROM build_approvals WHERE id = $1")
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await
            .map_err(store_err)?
            .ok_or_else(|| Error::NotFound(format!("approval gate {id}")))?;
        row.try_into()
    }

    async fn approve(&self, id: ResourceId, approver: &str) -> Result<ApprovalGate> {
        let mut tx = self.pool.begin().await.map_err(store_err)?;
        let row = sqlx::query_as::<_, GateRow>(
            "SELECT * FROM build_approvals WHERE id = $1 FOR UPDATE",
        )
        .bind(id.as_uuid())
        .fetch_optional(&mut *tx)
        .await
        .map_err(store_err)?
        .ok_or_else(|| Error::NotFound(format!("approval gate {id}")))?;

        let mut gate: ApprovalGate = row.try_into()?;
        if gate.status.is_terminal() {
            return Err(Error::StoreConflict(format!(
                "gate {id} already {}",
                gate.status.as_str()
            )));
        }
        // One vote per approver.
        if !gate.approver_ids.iter().any(|a| a == approver) {
            gate.approver_ids.push(approver.to_string());
            gate.approval_count += 1;
        }
        if gate.approval_count >= gate.required_approvals {
            gate.status = GateStatus::Approved;
        }

        sqlx::query(
            r#"
            UPDATE build_approvals
            SET approval_count = $2, approver_ids = $3, status = $4
            WHERE id = $1
            "#,
        )
        .bind(id.as_uuid())
        .bind(gate.approval_count as i32)
        .bind(serde_json::to_value(&gate.approver_ids).unwrap_or_default())
        .bind(gate.status.as_str())
        .execute(&mut *tx)
        .await
        .map_err(store_err)?;
        tx.commit().await.map_err(store_err)?;
        Ok(gate)
    }

    async fn reject(&self, id: ResourceId, approver: &str) -> Result<ApprovalGate> {
        let mut tx = self.pool.begin().await.map_err(store_err)?;
        let row = sqlx::query_as::<_, GateRow>(
            "SELECT * FROM build_approvals WHERE id = $1 FOR UPDATE",
        )
        .bind(id.as_uuid())
        .fetch_optional(&mut *tx)
        .await
        .map_err(store_err)?
        .ok_or_else(|| Error::NotFound(format!("approval gate {id}")))?;

        let mut gate: ApprovalGate = row.try_into()?;
        if gate.status.is_terminal() {
            return Err(Error::StoreConflict(format!(
                "gate {id} already {}",
                gate.status.as_str()
            )));
        }
        if !gate.approver_ids.iter().any(|a| a == approver) {
            gate.approver_ids.push(approver.to_string());
        }
        gate.status = GateStatus::Rejected;

        sqlx::query(
            "UPDATE build_approvals SET approver_ids = $2, status = 'rejected' WHERE id = $1",
        )
        .bind(id.as_uuid())
        .bind(serde_json::to_value(&gate.approver_ids).unwrap_or_default())
        .execute(&mut *tx)
        .await
        .map_err(store_err)?;
        tx.commit().await.map_err(store_err)?;
        Ok(gate)
    }

    async fn expire_due(&self, now: DateTime<Utc>) -> Result<Vec<ApprovalGate>> {
        let rows = sqlx::query_as::<_, GateRow>(
            r#"
            UPDATE build_approvals
            SET status = 'timed-out'
            WHERE status = 'pending' AND timeout_at <= $1
            RETURNING *
            "#,
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await
        .map_err(store_err)?;
        rows.into_iter().map(TryInto::try_into).collect()
    }
}
