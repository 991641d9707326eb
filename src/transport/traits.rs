//! Transport trait abstraction for pluggable cloud backends

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::command::CommandTemplate;

/// Network or service level failure; always retryable
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("endpoint unreachable: {0}")]
    Unreachable(String),

    #[error("rejected by endpoint: {0}")]
    Rejected(String),

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("transport closed")]
    Closed,
}

/// Delivers a normalized command to a regional endpoint
///
/// One call is one attempt; retrying is the dispatcher's job.
#[async_trait]
pub trait CommandTransport: Send + Sync {
    /// Send a command, returning the endpoint's command id on acceptance
    async fn send(&self, command: &CommandTemplate, endpoint: &str) -> Result<String, TransportError>;

    /// Ask the endpoint for a device's current status
    ///
    /// Backends without a query API report it as a rejection.
    async fn query_status(
        &self,
        device_id: &str,
        _endpoint: &str,
    ) -> Result<serde_json::Value, TransportError> {
        Err(TransportError::Rejected(format!(
            "{} transport cannot query status of {}",
            self.name(),
            device_id
        )))
    }

    /// Human-readable name for this transport
    fn name(&self) -> &'static str;
}

/// Opens per-device status feeds on a pub/sub backend
///
/// Inbound status is not returned from these calls; implementations push it
/// into the `StatusSink` they were built with.
#[async_trait]
pub trait SubscriptionTransport: Send + Sync {
    async fn subscribe(&self, device_id: &str) -> Result<(), TransportError>;

    /// Teardown hook; backends without explicit unsubscribe can ignore it
    async fn unsubscribe(&self, _device_id: &str) -> Result<(), TransportError> {
        Ok(())
    }
}
