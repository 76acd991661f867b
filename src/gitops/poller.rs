use crate::database::models::SyncTrigger;
use crate::error::Result;
use crate::gitops::sync::SyncService;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Drives the sync service: once at startup, then on a fixed interval.
/// Operators can also trigger a synchronous sync; a manual sync may overlap
/// a poll sync, which the reload callback tolerates.
pub struct GitOpsPoller {
    sync: Arc<SyncService>,
    interval: Duration,
}

impl GitOpsPoller {
    pub fn new(sync: Arc<SyncService>, interval: Duration) -> Self {
        Self { sync, interval }
    }

    pub async fn run(&self, cancel: CancellationToken) {
        if let Err(e) = self.sync.sync(SyncTrigger::Startup, None).await {
            warn!("startup config sync failed, continuing with current config: {}", e);
        }

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // the first tick completes immediately and the startup sync covers it
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("gitops poller stopping");
                    return;
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.sync.sync(SyncTrigger::Poll, None).await {
                        warn!("poll config sync failed: {}", e);
                    }
                }
            }
        }
    }

    /// Synchronous manual sync on behalf of `user`.
    pub async fn trigger_sync(&self, user: &str) -> Result<()> {
        self.sync.sync(SyncTrigger::Manual, Some(user)).await
    }
}
