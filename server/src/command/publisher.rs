//! Periodic status re-publishing

use std::sync::Arc;

use tokio::time::{interval, Duration};
use tracing::debug;

use super::handler::CommandHandler;
use crate::session::SessionManager;

/// Re-sends each subscribed device's last known status on a fixed cadence
pub struct StatusPublisher {
    handler: Arc<CommandHandler>,
    sessions: Arc<SessionManager>,
    period: Duration,
}

impl StatusPublisher {
    pub fn new(handler: Arc<CommandHandler>, sessions: Arc<SessionManager>, period: Duration) -> Self {
        Self {
            handler,
            sessions,
            period,
        }
    }

    /// Publish once, returning how many devices were reached
    pub async fn publish_all(&self) -> usize {
        let mut reached = 0;
        for device_id in self.sessions.subscribed_devices().await {
            if let Some(status) = self.handler.last_status(&device_id).await {
                if self.sessions.publish(&device_id, status).await {
                    reached += 1;
                }
            }
        }
        reached
    }

    /// Start the re-publish loop
    pub async fn run(&self) {
        let mut ticker = interval(self.period);

        loop {
            ticker.tick().await;

            let reached = self.publish_all().await;
            if reached > 0 {
                debug!("Re-published status to {} devices", reached);
            }
        }
    }
}
