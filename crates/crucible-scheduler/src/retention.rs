//! Retention and housekeeping.
//!
//! Leader-side periodic sweep: TTL cleanup of old build events, expiry of
//! pending approval gates past their deadline, and age-based cache eviction
//! (records plus backing trees).

use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tracing::{error, info};

use crucible_core::Result;
use crucible_core::store::Stores;
use crucible_executor::cache::DirCache;

pub struct RetentionScanner {
    stores: Stores,
    dir_cache: DirCache,
    event_ttl: Duration,
    cache_max_age: Duration,
    cache_max_total_bytes: i64,
    interval: Duration,
}

impl RetentionScanner {
    pub fn new(
        stores: Stores,
        dir_cache: DirCache,
        event_ttl: Duration,
        cache_max_age: Duration,
        cache_max_total_bytes: i64,
        interval: Duration,
    ) -> Self {
        Self {
            stores,
            dir_cache,
            event_ttl,
            cache_max_age,
            cache_max_total_bytes,
            interval,
        }
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!("retention scanner started");
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
                _ = tokio::time::sleep(self.interval) => {
                    if let Err(e) = self.sweep().await {
                        error!(error = %e, "retention sweep failed");
                    }
                }
            }
        }
        info!("retention scanner stopped");
    }

    pub async fn sweep(&self) -> Result<()> {
        let now = Utc::now();

        let expired = self.stores.approvals.expire_due(now).await?;
        if !expired.is_empty() {
            info!(count = expired.len(), "expired approval gates");
        }

        let event_cutoff = now - chrono::Duration::from_std(self.event_ttl).unwrap_or_default();
        let deleted = self.stores.events.delete_older_than(event_cutoff).await?;
        if deleted > 0 {
            info!(deleted, "expired build events");
        }

        let cache_cutoff = now - chrono::Duration::from_std(self.cache_max_age).unwrap_or_default();
        let mut evicted = self.stores.cache.evict_older_than(cache_cutoff).await?;
        evicted.extend(
            self.stores
                .cache
                .evict_to_total_size(self.cache_max_total_bytes)
                .await?,
        );
        for entry in &evicted {
            if let Err(e) = self.dir_cache.remove(entry.id) {
                error!(entry_id = %entry.id, error = %e, "cache tree removal failed");
            }
        }
        if !evicted.is_empty() {
            info!(count = evicted.len(), "evicted cache entries");
        }

        Ok(())
    }
}
