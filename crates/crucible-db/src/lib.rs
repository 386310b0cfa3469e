//! Store implementations for Crucible.
//!
//! Two engines behind the same contracts: PostgreSQL (networked, multi-master
//! via advisory locks and `SKIP LOCKED`) and an embedded in-memory engine for
//! single-process deployments and tests. Engine selection happens at startup
//! from `SystemConfig::database_url`.

pub mod error;
pub mod leader;
pub mod memory;
pub mod pg;

pub use error::store_err;
pub use leader::{MemoryLeaderLock, PgLeaderLock};
pub use memory::memory_stores;
pub use pg::pg_stores;

use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;

use crucible_core::Result;

/// Create a new database connection pool.
pub async fn create_pool(database_url: &str) -> Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(database_url)
        .await
        .map_err(error::store_err)?;
    Ok(pool)
}

/// Run database migrations.
pub async fn run_migrations(pool: &PgPool) -> Result<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .map_err(|e| crucible_core::Error::Store(e.to_string()))?;
    Ok(())
}
