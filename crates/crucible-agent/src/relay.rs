//! Event relay to the master.
//!
//! On the agent, the executor's durable plane is the master: every event is
//! handed to a relay task that POSTs it home. Delivery tolerates transient
//! master unavailability with bounded backoff; critical events stay buffered
//! until they get through or the retry budget is spent, non-critical events
//! are dropped after a few attempts.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tracing::{error, warn};

use crucible_core::ResourceId;
use crucible_core::event::{BuildEvent, EventId};
use crucible_core::store::EventStore;
use crucible_core::Result;

use crate::client::MasterClient;

const NON_CRITICAL_ATTEMPTS: u32 = 3;
const CRITICAL_ATTEMPTS: u32 = 20;
const BACKOFF_START: Duration = Duration::from_millis(500);
const BACKOFF_CAP: Duration = Duration::from_secs(30);

/// [`EventStore`] implementation that forwards appends to the master.
/// Replay and retention live master-side; here they are no-ops.
pub struct RelayEventStore {
    tx: mpsc::UnboundedSender<BuildEvent>,
}

impl RelayEventStore {
    /// Returns the store and the relay task driving deliveries.
    pub fn start(client: Arc<MasterClient>) -> (Arc<Self>, tokio::task::JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(relay_loop(client, rx));
        (Arc::new(Self { tx }), task)
    }
}

#[async_trait]
impl EventStore for RelayEventStore {
    async fn append(&self, event: &BuildEvent) -> Result<()> {
        // Queue full/closed means the relay died; the bus logs the error and
        // keeps the ephemeral plane alive.
        self.tx
            .send(event.clone())
            .map_err(|_| crucible_core::Error::Store("event relay closed".into()))
    }

    async fn replay(
        &self,
        _build_id: ResourceId,
        _after: Option<&EventId>,
        _limit: usize,
    ) -> Result<Vec<BuildEvent>> {
        Ok(Vec::new())
    }

    async fn delete_older_than(&self, _cutoff: DateTime<Utc>) -> Result<u64> {
        Ok(0)
    }
}

async fn relay_loop(client: Arc<MasterClient>, mut rx: mpsc::UnboundedReceiver<BuildEvent>) {
    while let Some(event) = rx.recv().await {
        let budget = if event.kind.is_critical() {
            CRITICAL_ATTEMPTS
        } else {
            NON_CRITICAL_ATTEMPTS
        };
        let mut backoff = BACKOFF_START;
        let mut delivered = false;
        for attempt in 1..=budget {
            match client.post_event(&event).await {
                Ok(()) => {
                    delivered = true;
                    break;
                }
                Err(e) => {
                    warn!(
                        build_id = %event.build_id,
                        kind = event.kind.as_str(),
                        attempt,
                        error = %e,
                        "event delivery failed"
                    );
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(BACKOFF_CAP);
                }
            }
        }
        if !delivered {
            if event.kind.is_critical() {
                error!(
                    build_id = %event.build_id,
                    kind = event.kind.as_str(),
                    "critical event lost after retry budget"
                );
            } else {
                warn!(
                    build_id = %event.build_id,
                    kind = event.kind.as_str(),
                    "non-critical event dropped"
                );
            }
        }
    }
}
