//! Periodic purge of stale cached statuses

use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::{debug, info};

use super::manager::StatusSubscriptionManager;
use crate::config::SubscriptionConfig;

/// Drops cached statuses older than the retention window
pub struct CacheSweeper {
    manager: Arc<StatusSubscriptionManager>,
    retention: Duration,
    sweep_interval: Duration,
}

impl CacheSweeper {
    pub fn new(manager: Arc<StatusSubscriptionManager>, retention: Duration, sweep_interval: Duration) -> Self {
        Self {
            manager,
            retention,
            sweep_interval,
        }
    }

    pub fn from_config(manager: Arc<StatusSubscriptionManager>, config: &SubscriptionConfig) -> Self {
        Self::new(manager, config.status_retention, config.sweep_interval)
    }

    /// Run one sweep
    pub fn sweep(&self) -> usize {
        let purged = self.manager.purge_stale_status(self.retention);
        if purged > 0 {
            info!("Purged {} stale status entries", purged);
        } else {
            debug!("Status sweep found nothing to purge");
        }
        purged
    }

    /// Sweep forever on the configured interval
    pub async fn run(&self) {
        let mut ticker = interval(self.sweep_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // First tick completes immediately
        ticker.tick().await;

        loop {
            ticker.tick().await;
            self.sweep();
        }
    }

    /// Spawn `run` as a background task
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move { self.run().await })
    }
}
