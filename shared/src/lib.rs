//! Fleet Shared Protocol Types
//!
//! This crate provides the wire-level types, frame codec and subscription
//! state machine shared by the control plane and regional endpoints.

pub mod codec;
pub mod state_machine;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Get current timestamp in milliseconds since Unix epoch
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Pub/sub topic carrying status changes for a device
pub fn status_topic(device_id: &str) -> String {
    format!("$hw/events/device/status/{}", device_id)
}

/// Default policy values for the control plane
pub mod defaults {
    /// Maximum dispatch attempts per command (first attempt included)
    pub const RETRY_MAX_ATTEMPTS: u32 = 3;

    /// Fixed backoff between dispatch attempts
    pub const RETRY_INTERVAL_MS: u64 = 2000;

    /// Upper bound for a single dispatch attempt
    pub const ATTEMPT_TIMEOUT_MS: u64 = 1500;

    /// Upper bound for a single subscribe call
    pub const SUBSCRIBE_TIMEOUT_MS: u64 = 5000;

    /// Status cache entries older than this are purged by the sweeper
    pub const STATUS_RETENTION_MS: u64 = 60 * 60 * 1000;

    /// How often the sweeper runs
    pub const CACHE_SWEEP_INTERVAL_MS: u64 = 60 * 1000;

    /// Capacity of the inbound status event channel
    pub const EVENT_CHANNEL_CAPACITY: usize = 1024;

    /// Concurrent dispatches allowed during a batch
    pub const DISPATCH_WORKERS: usize = 16;

    /// Identity verification results are reused for this long
    pub const IDENTITY_CACHE_TTL_MS: u64 = 60 * 60 * 1000;

    pub const DEVICE_ID_MIN_LEN: usize = 8;
    pub const DEVICE_ID_MAX_LEN: usize = 32;

    pub const PARAMETER_VALUE_MIN: f64 = 0.0;
    pub const PARAMETER_VALUE_MAX: f64 = 100.0;
}

/// Switch position carried in the `status` parameter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SwitchStatus {
    On,
    Off,
    Auto,
}

impl SwitchStatus {
    /// Parse the exact lowercase wire form
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "on" => Some(SwitchStatus::On),
            "off" => Some(SwitchStatus::Off),
            "auto" => Some(SwitchStatus::Auto),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SwitchStatus::On => "on",
            SwitchStatus::Off => "off",
            SwitchStatus::Auto => "auto",
        }
    }
}

impl fmt::Display for SwitchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Typed command parameters
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CommandParameters {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<SwitchStatus>,
}

/// A normalized command as delivered to a regional endpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandRequest {
    pub device_id: String,
    pub command_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<CommandParameters>,
    /// Canonical region name
    pub region: String,
}

/// Where a device's commands are routed
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ShardAssignment {
    pub region: String,
    pub shard_index: u32,
    pub endpoint: String,
}

impl ShardAssignment {
    /// Grouping key used for affinity batching, e.g. `华东_2`
    pub fn shard_key(&self) -> String {
        format!("{}_{}", self.region, self.shard_index)
    }
}

/// Terminal outcome of a logical command
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandStatus {
    Accepted,
    Failed,
}

/// Result of dispatching one logical command (all attempts included)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandResult {
    pub device_id: String,
    /// Present only when the endpoint accepted the command
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command_id: Option<String>,
    pub status: CommandStatus,
    pub region: String,
    pub timestamp_ms: u64,
    /// Transport attempts made before this result was produced
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_detail: Option<String>,
}

impl CommandResult {
    /// Create a result for an accepted command
    pub fn accepted(
        device_id: impl Into<String>,
        command_id: impl Into<String>,
        region: impl Into<String>,
        attempts: u32,
    ) -> Self {
        Self {
            device_id: device_id.into(),
            command_id: Some(command_id.into()),
            status: CommandStatus::Accepted,
            region: region.into(),
            timestamp_ms: now_ms(),
            attempts,
            error_detail: None,
        }
    }

    /// Create a terminal failure result
    pub fn failed(
        device_id: impl Into<String>,
        region: impl Into<String>,
        attempts: u32,
        detail: impl Into<String>,
    ) -> Self {
        Self {
            device_id: device_id.into(),
            command_id: None,
            status: CommandStatus::Failed,
            region: region.into(),
            timestamp_ms: now_ms(),
            attempts,
            error_detail: Some(detail.into()),
        }
    }

    pub fn is_accepted(&self) -> bool {
        self.status == CommandStatus::Accepted
    }
}

/// An inbound status change reported by a device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceStatusEvent {
    pub device_id: String,
    /// Opaque payload as published by the device
    pub status: serde_json::Value,
    /// Arrival time at the control plane, not the device clock
    pub received_at_ms: u64,
}

impl DeviceStatusEvent {
    /// Create an event stamped with the current arrival time
    pub fn new(device_id: impl Into<String>, status: serde_json::Value) -> Self {
        Self {
            device_id: device_id.into(),
            status,
            received_at_ms: now_ms(),
        }
    }

    /// Age of this event relative to `now_ms`
    pub fn age_ms(&self, now_ms: u64) -> u64 {
        now_ms.saturating_sub(self.received_at_ms)
    }

    /// Check whether this event is older than `max_age`
    pub fn is_stale(&self, max_age: Duration, now_ms: u64) -> bool {
        self.age_ms(now_ms) > max_age.as_millis() as u64
    }
}
