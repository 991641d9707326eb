//! Last-known status per device

use std::time::Duration;

use dashmap::DashMap;
use fleet_shared::{now_ms, DeviceStatusEvent};

/// A cached status with its freshness judged against a caller threshold
#[derive(Debug, Clone, PartialEq)]
pub struct StatusReading {
    pub event: DeviceStatusEvent,
    pub age_ms: u64,
    pub stale: bool,
}

/// Concurrent last-write-wins status cache
///
/// Writes are ordered by arrival, not by any device timestamp. Each device
/// key is locked independently.
#[derive(Debug, Default)]
pub(crate) struct StatusCache {
    entries: DashMap<String, DeviceStatusEvent>,
}

impl StatusCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store an event, returning the one it replaced
    pub fn record(&self, event: DeviceStatusEvent) -> Option<DeviceStatusEvent> {
        self.entries.insert(event.device_id.clone(), event)
    }

    pub fn get(&self, device_id: &str) -> Option<DeviceStatusEvent> {
        self.entries.get(device_id).map(|e| e.value().clone())
    }

    /// Read a status and mark it stale if older than `max_age`
    pub fn reading(&self, device_id: &str, max_age: Duration) -> Option<StatusReading> {
        let event = self.get(device_id)?;
        let now = now_ms();
        Some(StatusReading {
            age_ms: event.age_ms(now),
            stale: event.is_stale(max_age, now),
            event,
        })
    }

    /// Drop entries older than `max_age`, returning how many were removed
    pub fn purge_older_than(&self, max_age: Duration, now_ms: u64) -> usize {
        let before = self.entries.len();
        self.entries
            .retain(|_, event| !event.is_stale(max_age, now_ms));
        before.saturating_sub(self.entries.len())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}
