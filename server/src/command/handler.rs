//! Command acceptance for the simulated endpoint

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use fleet_shared::codec::Frame;
use fleet_shared::CommandRequest;
use serde_json::json;
use tokio::sync::RwLock;
use tracing::{info, warn};
use uuid::Uuid;

use crate::session::SessionManager;

/// Accepts commands and keeps each device's last commanded status
pub struct CommandHandler {
    sessions: Arc<SessionManager>,
    /// Reject every Nth send; 0 never rejects
    reject_every: u64,
    received: AtomicU64,
    last_status: Arc<RwLock<HashMap<String, serde_json::Value>>>,
}

impl CommandHandler {
    pub fn new(sessions: Arc<SessionManager>, reject_every: u64) -> Self {
        Self {
            sessions,
            reject_every,
            received: AtomicU64::new(0),
            last_status: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Handle one `Send`, returning the reply frame
    pub async fn handle_send(&self, request: &CommandRequest, endpoint: &str) -> Frame {
        let n = self.received.fetch_add(1, Ordering::SeqCst) + 1;

        if self.reject_every > 0 && n % self.reject_every == 0 {
            warn!(
                device_id = %request.device_id,
                endpoint,
                "Rejecting command #{} (simulated fault)",
                n
            );
            return Frame::Rejected {
                reason: format!("simulated rejection of command #{}", n),
            };
        }

        let command_id = Uuid::new_v4().to_string();
        info!(
            device_id = %request.device_id,
            region = %request.region,
            endpoint,
            %command_id,
            "Accepted {}",
            request.command_type
        );

        if let Some(status) = request.parameters.as_ref().and_then(|p| p.status) {
            let payload = json!({ "status": status });
            self.last_status
                .write()
                .await
                .insert(request.device_id.clone(), payload.clone());
            self.sessions.publish(&request.device_id, payload).await;
        }

        Frame::Accepted { command_id }
    }

    /// Handle one `QueryStatus`, returning the reply frame
    pub async fn handle_query(&self, device_id: &str, endpoint: &str) -> Frame {
        match self.last_status(device_id).await {
            Some(payload) => {
                info!(device_id, endpoint, "Answered status query");
                Frame::Status {
                    device_id: device_id.to_string(),
                    payload,
                }
            }
            None => {
                warn!(device_id, endpoint, "Status query for unknown device");
                Frame::Rejected {
                    reason: format!("no status known for {}", device_id),
                }
            }
        }
    }

    /// Last status a command set for the device
    pub async fn last_status(&self, device_id: &str) -> Option<serde_json::Value> {
        self.last_status.read().await.get(device_id).cloned()
    }

    pub fn received(&self) -> u64 {
        self.received.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_shared::{CommandParameters, SwitchStatus};

    fn request(status: Option<SwitchStatus>) -> CommandRequest {
        CommandRequest {
            device_id: "watermeter_0001".into(),
            command_type: "SetStatus".into(),
            parameters: Some(CommandParameters {
                value: None,
                status,
            }),
            region: "华东".into(),
        }
    }

    #[tokio::test]
    async fn test_accepts_with_unique_ids() {
        let handler = CommandHandler::new(Arc::new(SessionManager::new()), 0);

        let a = handler.handle_send(&request(None), "endpoint").await;
        let b = handler.handle_send(&request(None), "endpoint").await;

        match (a, b) {
            (Frame::Accepted { command_id: a }, Frame::Accepted { command_id: b }) => assert_ne!(a, b),
            other => panic!("expected two accepts, got {:?}", other),
        }
        assert_eq!(handler.received(), 2);
    }

    #[tokio::test]
    async fn test_reject_every_nth() {
        let handler = CommandHandler::new(Arc::new(SessionManager::new()), 3);

        let mut rejected = Vec::new();
        for i in 1..=6 {
            if let Frame::Rejected { .. } = handler.handle_send(&request(None), "endpoint").await {
                rejected.push(i);
            }
        }
        assert_eq!(rejected, vec![3, 6]);
    }

    #[tokio::test]
    async fn test_status_command_remembered() {
        let handler = CommandHandler::new(Arc::new(SessionManager::new()), 0);

        handler.handle_send(&request(Some(SwitchStatus::Auto)), "endpoint").await;

        assert_eq!(
            handler.last_status("watermeter_0001").await,
            Some(json!({"status": "auto"}))
        );
        assert_eq!(handler.last_status("watermeter_0002").await, None);
    }

    #[tokio::test]
    async fn test_status_query_answers_last_status() {
        let handler = CommandHandler::new(Arc::new(SessionManager::new()), 0);
        handler.handle_send(&request(Some(SwitchStatus::Off)), "endpoint").await;

        assert_eq!(
            handler.handle_query("watermeter_0001", "endpoint").await,
            Frame::Status {
                device_id: "watermeter_0001".into(),
                payload: json!({"status": "off"}),
            }
        );
        assert!(matches!(
            handler.handle_query("watermeter_0009", "endpoint").await,
            Frame::Rejected { .. }
        ));
    }
}
