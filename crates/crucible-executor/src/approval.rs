//! Approval gate waiting.
//!
//! The executor suspends the stage and polls the gate record until it
//! reaches a terminal state. Expiry is a conditional store transition, so a
//! leader-side scanner and this poll loop can race without double-firing.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;

use crucible_core::approval::GateStatus;
use crucible_core::store::ApprovalStore;
use crucible_core::{Error, ResourceId, Result};

pub struct ApprovalWaiter {
    approvals: Arc<dyn ApprovalStore>,
    poll: Duration,
}

impl ApprovalWaiter {
    pub fn new(approvals: Arc<dyn ApprovalStore>, poll: Duration) -> Self {
        Self { approvals, poll }
    }

    /// Block until the gate is terminal. Cancellation aborts the wait.
    pub async fn wait(
        &self,
        gate_id: ResourceId,
        cancel: &watch::Receiver<bool>,
    ) -> Result<GateStatus> {
        loop {
            if *cancel.borrow() {
                return Err(Error::StepAborted("build cancelled while awaiting approval".into()));
            }
            let gate = self.approvals.get(gate_id).await?;
            if gate.status.is_terminal() {
                return Ok(gate.status);
            }
            if gate.timeout_at <= Utc::now() {
                // Conditional transition; whoever wins, the next get() sees
                // the terminal state.
                self.approvals.expire_due(Utc::now()).await?;
                continue;
            }
            tokio::time::sleep(self.poll).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crucible_core::approval::ApprovalGate;
    use crucible_db::memory::MemoryApprovalStore;

    fn store() -> Arc<dyn ApprovalStore> {
        Arc::new(MemoryApprovalStore::default())
    }

    #[tokio::test]
    async fn resolves_on_approval() {
        let approvals = store();
        let gate = ApprovalGate::pending(
            ResourceId::new(),
            ResourceId::new(),
            "Deploy",
            1,
            Utc::now() + chrono::Duration::minutes(5),
        );
        approvals.create(&gate).await.unwrap();

        let waiter = ApprovalWaiter::new(approvals.clone(), Duration::from_millis(10));
        let (_tx, cancel) = watch::channel(false);
        let wait = tokio::spawn(async move { waiter.wait(gate.id, &cancel).await });

        tokio::time::sleep(Duration::from_millis(30)).await;
        approvals.approve(gate.id, "alice").await.unwrap();

        assert_eq!(wait.await.unwrap().unwrap(), GateStatus::Approved);
    }

    #[tokio::test]
    async fn times_out_without_approvers() {
        let approvals = store();
        let gate = ApprovalGate::pending(
            ResourceId::new(),
            ResourceId::new(),
            "Deploy",
            1,
            Utc::now() + chrono::Duration::milliseconds(50),
        );
        approvals.create(&gate).await.unwrap();

        let waiter = ApprovalWaiter::new(approvals.clone(), Duration::from_millis(10));
        let (_tx, cancel) = watch::channel(false);
        let status = waiter.wait(gate.id, &cancel).await.unwrap();
        assert_eq!(status, GateStatus::TimedOut);
        assert_eq!(approvals.get(gate.id).await.unwrap().status, GateStatus::TimedOut);
    }

    #[tokio::test]
    async fn cancellation_aborts_wait() {
        let approvals = store();
        let gate = ApprovalGate::pending(
            ResourceId::new(),
            ResourceId::new(),
            "Deploy",
            1,
            Utc::now() + chrono::Duration::minutes(5),
        );
        approvals.create(&gate).await.unwrap();

        let waiter = ApprovalWaiter::new(approvals, Duration::from_millis(10));
        let (tx, cancel) = watch::channel(false);
        tx.send(true).unwrap();
        let err = waiter.wait(gate.id, &cancel).await.unwrap_err();
        assert_eq!(err.kind(), "step-aborted");
    }
}
