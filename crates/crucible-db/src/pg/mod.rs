//! PostgreSQL store implementations.

pub mod agents;
pub mod approvals;
pub mod artifacts;
pub mod builds;
pub mod cache;
pub mod events;
pub mod jobs;
pub mod queue;
pub mod secrets;
pub mod stages;

pub use agents::PgAgentStore;
pub use approvals::PgApprovalStore;
pub use artifacts::PgArtifactStore;
pub use builds::PgBuildStore;
pub use cache::{PgCacheStore, PgStageResultStore};
pub use events::PgEventStore;
pub use jobs::PgJobStore;
pub use queue::PgQueueStore;
pub use secrets::PgSecretStore;
pub use stages::{PgStageStore, PgStepStore};

use sqlx::PgPool;
use std::sync::Arc;

use crucible_core::store::Stores;

/// Wire every Postgres store implementation into a [`Stores`] bundle.
pub fn pg_stores(pool: PgPool) -> Stores {
    Stores {
        jobs: Arc::new(PgJobStore::new(pool.clone())),
        builds: Arc::new(PgBuildStore::new(pool.clone())),
        stages: Arc::new(PgStageStore::new(pool.clone())),
        steps: Arc::new(PgStepStore::new(pool.clone())),
        events: Arc::new(PgEventStore::new(pool.clone())),
        queue: Arc::new(PgQueueStore::new(pool.clone())),
        agents: Arc::new(PgAgentStore::new(pool.clone())),
        cache: Arc::new(PgCacheStore::new(pool.clone())),
        stage_results: Arc::new(PgStageResultStore::new(pool.clone())),
        approvals: Arc::new(PgApprovalStore::new(pool.clone())),
        artifacts: Arc::new(PgArtifactStore::new(pool.clone())),
        secrets: Arc::new(PgSecretStore::new(pool)),
    }
}
