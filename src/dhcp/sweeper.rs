use crate::error::Result;
use crate::events::{EventBus, EventType};
use crate::metrics;
use crate::store::cache::LeaseCache;
use crate::store::LeaseStore;
use chrono::Duration as ChronoDuration;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Periodically expires overdue leases and prunes rows past the retention
/// window. Every node runs one; both statements are single conditional
/// UPDATEs/DELETEs, so concurrent sweeps are harmless.
pub struct ExpirySweeper {
    store: Arc<LeaseStore>,
    cache: Option<Arc<LeaseCache>>,
    events: Arc<EventBus>,
    interval: Duration,
    retention: ChronoDuration,
}

impl ExpirySweeper {
    pub fn new(
        store: Arc<LeaseStore>,
        cache: Option<Arc<LeaseCache>>,
        events: Arc<EventBus>,
        interval: Duration,
        retention: ChronoDuration,
    ) -> Self {
        Self {
            store,
            cache,
            events,
            interval,
            retention,
        }
    }

    pub async fn run(&self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("expiry sweeper stopping");
                    return;
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.sweep().await {
                        error!("lease sweep failed: {}", e);
                    }
                }
            }
        }
    }

    pub async fn sweep(&self) -> Result<()> {
        let expired = self.store.expire_old().await?;
        if expired > 0 {
            info!("expired {} leases", expired);
            metrics::LEASES_EXPIRED.inc_by(expired);
            self.events.publish(
                EventType::LeaseExpired,
                format!("{expired} leases expired"),
                json!({ "count": expired }),
            );
        }

        if let Some(cache) = &self.cache {
            let dropped = cache.expire_old();
            if dropped > 0 {
                debug!("dropped {} stale cache entries", dropped);
            }
            let stats = cache.stats();
            debug!(
                "lease cache: {}/{} entries, {} hits, {} misses, {} evictions",
                stats.size, stats.max_size, stats.hits, stats.misses, stats.evictions
            );
        }

        let deleted = self.store.delete_old(self.retention).await?;
        if deleted > 0 {
            info!("pruned {} lease rows past retention", deleted);
        }

        match self.store.count_active_leases().await {
            Ok(count) => metrics::ACTIVE_LEASES.set(count),
            Err(e) => debug!("active lease count unavailable: {}", e),
        }

        Ok(())
    }
}
