//! Status event pump
//!
//! Transports push inbound status, and the loss of a live feed, through a
//! `StatusSink`; a single pump task drains the channel into the subscription
//! manager. Delivery into the sink is at-least-once and unordered across
//! devices.

use std::sync::Arc;

use fleet_shared::DeviceStatusEvent;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::manager::StatusSubscriptionManager;

/// What transports report through the sink
#[derive(Debug, Clone, PartialEq)]
pub enum StatusMessage {
    /// Inbound device status
    Status(DeviceStatusEvent),
    /// A confirmed feed ended without a teardown request
    FeedLost { device_id: String, reason: String },
}

/// Sending half handed to transports
#[derive(Debug, Clone)]
pub struct StatusSink {
    tx: mpsc::Sender<StatusMessage>,
}

impl StatusSink {
    /// Publish a status, stamping the local arrival time
    ///
    /// Waits for channel capacity. Returns false once the pump is gone.
    pub async fn publish(&self, device_id: impl Into<String>, payload: serde_json::Value) -> bool {
        let event = DeviceStatusEvent::new(device_id, payload);
        self.tx.send(StatusMessage::Status(event)).await.is_ok()
    }

    /// Publish without waiting; drops the event when the channel is full
    pub fn try_publish(&self, device_id: impl Into<String>, payload: serde_json::Value) -> bool {
        let event = DeviceStatusEvent::new(device_id, payload);
        match self.tx.try_send(StatusMessage::Status(event)) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(StatusMessage::Status(event))) => {
                warn!(device_id = %event.device_id, "Status channel full, dropping event");
                false
            }
            Err(_) => false,
        }
    }

    /// Report that a device's feed ended; waits for channel capacity
    pub async fn feed_lost(&self, device_id: impl Into<String>, reason: impl Into<String>) -> bool {
        let message = StatusMessage::FeedLost {
            device_id: device_id.into(),
            reason: reason.into(),
        };
        self.tx.send(message).await.is_ok()
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Receiving half; drained by `start`
pub struct StatusPump {
    rx: mpsc::Receiver<StatusMessage>,
}

/// Create a bounded status channel
pub fn status_channel(capacity: usize) -> (StatusSink, StatusPump) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (StatusSink { tx }, StatusPump { rx })
}

impl StatusPump {
    #[cfg(test)]
    pub(crate) async fn recv(&mut self) -> Option<StatusMessage> {
        self.rx.recv().await
    }

    /// Spawn the pump; it ends when every sink has been dropped
    pub fn start(mut self, manager: Arc<StatusSubscriptionManager>) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!("Status pump started");
            let mut delivered: u64 = 0;
            let mut feeds_lost: u64 = 0;

            while let Some(message) = self.rx.recv().await {
                match message {
                    StatusMessage::Status(event) => {
                        manager.on_event(event);
                        delivered += 1;
                    }
                    StatusMessage::FeedLost { device_id, reason } => {
                        manager.on_feed_lost(&device_id, &reason);
                        feeds_lost += 1;
                    }
                }
            }

            debug!(delivered, feeds_lost, "Status pump drained");
            info!("Status pump stopped");
        })
    }
}
