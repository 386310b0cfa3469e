//! Leader election locks.
//!
//! Postgres uses session advisory locks on a dedicated connection: losing the
//! connection releases the lock server-side, so a crashed leader is deposed
//! automatically. The embedded engine has no second master to fence against,
//! so it grants leadership unconditionally.

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use sqlx::{Connection, PgConnection};
use tokio::sync::Mutex;
use tracing::warn;

use crucible_core::Result;
use crucible_core::store::LeaderLock;

use crate::error::store_err;

/// Advisory-lock key for a singleton role name.
fn lock_key(name: &str) -> i64 {
    let digest = Sha256::digest(name.as_bytes());
    i64::from_be_bytes(digest[..8].try_into().expect("8 bytes"))
}

/// Session advisory lock held on a dedicated connection.
pub struct PgLeaderLock {
    url: String,
    conn: Mutex<Option<PgConnection>>,
}

impl PgLeaderLock {
    pub fn new(database_url: impl Into<String>) -> Self {
        Self {
            url: database_url.into(),
            conn: Mutex::new(None),
        }
    }
}

#[async_trait]
impl LeaderLock for PgLeaderLock {
    async fn try_acquire(&self, name: &str) -> Result<bool> {
        let mut guard = self.conn.lock().await;
        if guard.is_none() {
            *guard = Some(PgConnection::connect(&self.url).await.map_err(store_err)?);
        }
        let conn = guard.as_mut().expect("connection just established");
        match sqlx::query_scalar::<_, bool>("SELECT pg_try_advisory_lock($1)")
            .bind(lock_key(name))
            .fetch_one(conn)
            .await
        {
            Ok(acquired) => Ok(acquired),
            Err(e) => {
                // A dead connection dropped the lock server-side; reconnect on
                // the next poll.
                warn!(error = %e, name, "leader lock connection lost");
                *guard = None;
                Ok(false)
            }
        }
    }

    async fn release(&self, name: &str) -> Result<()> {
        let mut guard = self.conn.lock().await;
        if let Some(conn) = guard.as_mut() {
            sqlx::query_scalar::<_, bool>("SELECT pg_advisory_unlock($1)")
                .bind(lock_key(name))
                .fetch_one(conn)
                .await
                .map_err(store_err)?;
        }
        Ok(())
    }
}

/// Lock for the embedded engine: no multi-master support, so leadership is
/// granted unconditionally.
pub struct MemoryLeaderLock;

#[async_trait]
impl LeaderLock for MemoryLeaderLock {
    async fn try_acquire(&self, _name: &str) -> Result<bool> {
        Ok(true)
    }

    async fn release(&self, _name: &str) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_keys_are_stable_and_distinct() {
        assert_eq!(lock_key("queue-processor"), lock_key("queue-processor"));
        assert_ne!(lock_key("queue-processor"), lock_key("orphan-monitor"));
    }
}
