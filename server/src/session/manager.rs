//! Tracks which session carries each device's status feed

use std::collections::HashMap;
use std::sync::Arc;

use fleet_shared::codec::Frame;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use super::connection::SessionHandle;

/// Maps device id -> the session subscribed to its status
pub struct SessionManager {
    feeds: Arc<RwLock<HashMap<String, SessionHandle>>>,
}

impl SessionManager {
    pub fn new() -> Self {
        Self {
            feeds: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Route a device's status to `handle`, replacing any earlier feed
    pub async fn subscribe(&self, device_id: &str, handle: SessionHandle) {
        let mut feeds = self.feeds.write().await;
        if let Some(previous) = feeds.insert(device_id.to_string(), handle) {
            debug!(device_id, "Replacing feed from session {}", previous.session_id);
        }
    }

    pub async fn unsubscribe(&self, device_id: &str) -> bool {
        self.feeds.write().await.remove(device_id).is_some()
    }

    /// Drop every feed carried by a closed session
    pub async fn remove_session(&self, session_id: u64) -> usize {
        let mut feeds = self.feeds.write().await;
        let before = feeds.len();
        feeds.retain(|_, handle| handle.session_id != session_id);
        before - feeds.len()
    }

    /// Push a status frame to the device's subscriber, if any
    ///
    /// A feed whose socket fails is removed.
    pub async fn publish(&self, device_id: &str, payload: serde_json::Value) -> bool {
        let handle = match self.feeds.read().await.get(device_id) {
            Some(handle) => handle.clone(),
            None => return false,
        };

        let frame = Frame::Status {
            device_id: device_id.to_string(),
            payload,
        };
        match handle.send(&frame).await {
            Ok(()) => true,
            Err(e) => {
                warn!(device_id, "Dropping status feed: {}", e);
                self.unsubscribe(device_id).await;
                false
            }
        }
    }

    pub async fn subscribed_devices(&self) -> Vec<String> {
        self.feeds.read().await.keys().cloned().collect()
    }

    pub async fn count(&self) -> usize {
        self.feeds.read().await.len()
    }
}

impl Default for SessionManager {
    fn default() -> Self {
        Self::new()
    }
}
