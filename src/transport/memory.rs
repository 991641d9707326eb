//! In-process simulated cloud endpoint

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use fleet_shared::CommandRequest;
use serde_json::json;
use tracing::debug;
use uuid::Uuid;

use super::traits::{CommandTransport, SubscriptionTransport, TransportError};
use crate::command::CommandTemplate;
use crate::subscription::StatusSink;

/// A command the simulated endpoint accepted
#[derive(Debug, Clone, PartialEq)]
pub struct DeliveredCommand {
    pub command_id: String,
    pub endpoint: String,
    pub request: CommandRequest,
}

/// Simulated transport with scripted failure injection
///
/// Accepted commands get a random v4 command id. Accepting a command that
/// carries a `status` parameter makes that the device's queryable status
/// and, when a sink is attached, publishes it back the way a real device
/// would report it.
#[derive(Default)]
pub struct InMemoryTransport {
    sink: Option<StatusSink>,
    failing_sends: AtomicU32,
    failing_queries: AtomicU32,
    failing_subscribes: DashSet<String>,
    send_calls: AtomicU32,
    query_calls: AtomicU32,
    subscribe_calls: AtomicU32,
    delivered: Mutex<Vec<DeliveredCommand>>,
    statuses: DashMap<String, serde_json::Value>,
}

impl InMemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach the sink status events are published into
    pub fn with_sink(mut self, sink: StatusSink) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Make the next `n` sends fail as unreachable
    pub fn fail_next_sends(&self, n: u32) {
        self.failing_sends.store(n, Ordering::SeqCst);
    }

    /// Make the next `n` status queries fail as unreachable
    pub fn fail_next_queries(&self, n: u32) {
        self.failing_queries.store(n, Ordering::SeqCst);
    }

    /// Make every subscribe for `device_id` fail until cleared
    pub fn fail_subscribes_for(&self, device_id: impl Into<String>) {
        self.failing_subscribes.insert(device_id.into());
    }

    pub fn clear_subscribe_failures(&self) {
        self.failing_subscribes.clear();
    }

    pub fn send_calls(&self) -> u32 {
        self.send_calls.load(Ordering::SeqCst)
    }

    pub fn query_calls(&self) -> u32 {
        self.query_calls.load(Ordering::SeqCst)
    }

    pub fn subscribe_calls(&self) -> u32 {
        self.subscribe_calls.load(Ordering::SeqCst)
    }

    /// Commands accepted so far, in acceptance order
    pub fn delivered(&self) -> Vec<DeliveredCommand> {
        self.delivered
            .lock()
            .map(|d| d.clone())
            .unwrap_or_default()
    }

    fn take_send_failure(&self) -> bool {
        take_one(&self.failing_sends)
    }

    fn take_query_failure(&self) -> bool {
        take_one(&self.failing_queries)
    }
}

fn take_one(counter: &AtomicU32) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

#[async_trait]
impl CommandTransport for InMemoryTransport {
    async fn send(&self, command: &CommandTemplate, endpoint: &str) -> Result<String, TransportError> {
        self.send_calls.fetch_add(1, Ordering::SeqCst);

        if self.take_send_failure() {
            return Err(TransportError::Unreachable(format!(
                "{} (simulated outage)",
                endpoint
            )));
        }

        let command_id = Uuid::new_v4().to_string();
        debug!(device_id = command.device_id(), %command_id, endpoint, "Simulated accept");

        if let Ok(mut delivered) = self.delivered.lock() {
            delivered.push(DeliveredCommand {
                command_id: command_id.clone(),
                endpoint: endpoint.to_string(),
                request: command.to_request(),
            });
        }

        if let Some(status) = command.parameters().and_then(|p| p.status) {
            let payload = json!({ "status": status });
            self.statuses
                .insert(command.device_id().to_string(), payload.clone());
            // Never block an accepted send on a full status channel
            if let Some(sink) = &self.sink {
                sink.try_publish(command.device_id(), payload);
            }
        }

        Ok(command_id)
    }

    async fn query_status(
        &self,
        device_id: &str,
        endpoint: &str,
    ) -> Result<serde_json::Value, TransportError> {
        self.query_calls.fetch_add(1, Ordering::SeqCst);

        if self.take_query_failure() {
            return Err(TransportError::Unreachable(format!(
                "{} (simulated outage)",
                endpoint
            )));
        }

        self.statuses
            .get(device_id)
            .map(|status| status.value().clone())
            .ok_or_else(|| TransportError::Rejected(format!("no status known for {}", device_id)))
    }

    fn name(&self) -> &'static str {
        "in-memory"
    }
}

#[async_trait]
impl SubscriptionTransport for InMemoryTransport {
    async fn subscribe(&self, device_id: &str) -> Result<(), TransportError> {
        self.subscribe_calls.fetch_add(1, Ordering::SeqCst);

        if self.failing_subscribes.contains(device_id) {
            return Err(TransportError::Unreachable("status broker (simulated outage)".into()));
        }
        debug!(device_id, topic = %fleet_shared::status_topic(device_id), "Simulated subscribe");
        Ok(())
    }
}
