//! Subscription manager for tracking per-device status feeds

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use fleet_shared::state_machine::{
    SubscriptionEvent, SubscriptionState, SubscriptionStateMachine, TransitionResult,
};
use fleet_shared::{defaults, now_ms, DeviceStatusEvent};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use thiserror::Error;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use super::cache::{StatusCache, StatusReading};
use crate::transport::{SubscriptionTransport, TransportError};

/// Concurrent subscribe calls issued by one batch
const SUBSCRIBE_FANOUT: usize = 32;

/// Subscription failure; never fatal to command dispatch
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SubscriptionError {
    #[error("subscribe failed for {device_id}: {source}")]
    Transport {
        device_id: String,
        #[source]
        source: TransportError,
    },

    #[error("subscribe for {device_id} timed out after {timeout:?}")]
    Timeout { device_id: String, timeout: Duration },
}

/// Counts by subscription state, plus cached statuses
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SubscriptionStats {
    pub active: usize,
    pub subscribing: usize,
    pub failed: usize,
    pub cached: usize,
}

/// Owns one subscription record per device and the last-known status cache
///
/// Records and cache are concurrent maps locked per key, so inbound events
/// and orchestration calls for different devices never contend.
pub struct StatusSubscriptionManager {
    transport: Arc<dyn SubscriptionTransport>,
    records: DashMap<String, SubscriptionStateMachine>,
    cache: StatusCache,
    subscribe_timeout: Duration,
}

impl StatusSubscriptionManager {
    /// Create a new subscription manager
    pub fn new(transport: Arc<dyn SubscriptionTransport>, subscribe_timeout: Duration) -> Self {
        Self {
            transport,
            records: DashMap::new(),
            cache: StatusCache::new(),
            subscribe_timeout,
        }
    }

    /// Manager with the default subscribe timeout
    pub fn with_default_timeout(transport: Arc<dyn SubscriptionTransport>) -> Self {
        Self::new(transport, Duration::from_millis(defaults::SUBSCRIBE_TIMEOUT_MS))
    }

    /// Make sure a device has a live or in-flight subscription
    ///
    /// Idempotent: a device already `active` or `subscribing` is left alone
    /// and the transport is not called again. A `failed` device is retried.
    pub async fn ensure_subscribed(&self, device_id: &str) -> Result<SubscriptionState, SubscriptionError> {
        // Claim the transition, releasing the entry lock before any await
        {
            let mut record = self.records.entry(device_id.to_string()).or_default();
            match record.process_event(SubscriptionEvent::Requested) {
                TransitionResult::Changed(_) => {}
                TransitionResult::Unchanged(state) => {
                    debug!(device_id, "Subscription already {}", state);
                    return Ok(state);
                }
                TransitionResult::Invalid { from, .. } => return Ok(from),
            }
        }

        let outcome = match timeout(self.subscribe_timeout, self.transport.subscribe(device_id)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(source)) => Err(SubscriptionError::Transport {
                device_id: device_id.to_string(),
                source,
            }),
            Err(_) => Err(SubscriptionError::Timeout {
                device_id: device_id.to_string(),
                timeout: self.subscribe_timeout,
            }),
        };

        let event = match &outcome {
            Ok(()) => SubscriptionEvent::Confirmed,
            Err(e) => SubscriptionEvent::TransportFailed {
                reason: e.to_string(),
            },
        };

        match self.records.get_mut(device_id) {
            Some(mut record) => {
                record.process_event(event);
            }
            None => {
                // Torn down while the subscribe call was in flight
                debug!(device_id, "Subscription record removed before completion");
            }
        }

        match outcome {
            Ok(()) => {
                info!(device_id, "Subscribed to {}", fleet_shared::status_topic(device_id));
                Ok(SubscriptionState::Active)
            }
            Err(e) => {
                warn!(device_id, "Subscription failed: {}", e);
                Err(e)
            }
        }
    }

    /// Subscribe many devices; one failure never affects another
    ///
    /// Outcomes are returned in input order.
    pub async fn ensure_subscribed_batch<S>(
        &self,
        device_ids: &[S],
    ) -> Vec<(String, Result<SubscriptionState, SubscriptionError>)>
    where
        S: AsRef<str>,
    {
        stream::iter(device_ids.iter().map(|id| id.as_ref().to_string()))
            .map(|device_id| async move {
                let outcome = self.ensure_subscribed(&device_id).await;
                (device_id, outcome)
            })
            .buffered(SUBSCRIBE_FANOUT)
            .collect()
            .await
    }

    /// Apply an inbound status event
    ///
    /// Always updates the cache, including for devices with no subscription
    /// record (e.g. an event arriving after teardown).
    pub fn on_event(&self, event: DeviceStatusEvent) {
        if !self.records.contains_key(&event.device_id) {
            debug!(device_id = %event.device_id, "Status for unsubscribed device");
        }
        debug!(device_id = %event.device_id, status = %event.status, "Status received");
        self.cache.record(event);
    }

    /// Last known status, regardless of age
    pub fn get_last_status(&self, device_id: &str) -> Option<DeviceStatusEvent> {
        self.cache.get(device_id)
    }

    /// Last known status, flagged stale when older than `max_age`
    pub fn last_status_within(&self, device_id: &str, max_age: Duration) -> Option<StatusReading> {
        self.cache.reading(device_id, max_age)
    }

    /// Current subscription state of a device
    pub fn state(&self, device_id: &str) -> SubscriptionState {
        self.records
            .get(device_id)
            .map(|r| r.state())
            .unwrap_or(SubscriptionState::Unsubscribed)
    }

    /// Mark a device's live feed as lost
    ///
    /// An `active` record moves to `failed`, so the next `ensure_subscribed`
    /// opens a new feed. Records in any other state are left alone.
    pub fn on_feed_lost(&self, device_id: &str, reason: &str) -> SubscriptionState {
        let Some(mut record) = self.records.get_mut(device_id) else {
            debug!(device_id, "Feed lost for device without subscription record");
            return SubscriptionState::Unsubscribed;
        };

        let event = SubscriptionEvent::TransportFailed {
            reason: reason.to_string(),
        };
        match record.process_event(event) {
            TransitionResult::Changed(state) => {
                warn!(device_id, "Status feed lost: {}", reason);
                state
            }
            TransitionResult::Unchanged(state) => state,
            TransitionResult::Invalid { from, .. } => {
                debug!(device_id, "Ignoring feed loss while {}", from);
                from
            }
        }
    }

    /// Tear down a device subscription
    ///
    /// The record is dropped only once the transport has closed the feed;
    /// on error it is kept as it was. The cached status is kept either way.
    pub async fn unsubscribe(&self, device_id: &str) -> Result<(), SubscriptionError> {
        if !self.records.contains_key(device_id) {
            return Ok(());
        }

        self.transport
            .unsubscribe(device_id)
            .await
            .map_err(|source| SubscriptionError::Transport {
                device_id: device_id.to_string(),
                source,
            })?;

        self.records.remove(device_id);
        info!(device_id, "Unsubscribed");
        Ok(())
    }

    /// Purge cached statuses older than `retention`
    pub fn purge_stale_status(&self, retention: Duration) -> usize {
        self.cache.purge_older_than(retention, now_ms())
    }

    pub fn stats(&self) -> SubscriptionStats {
        let mut stats = SubscriptionStats {
            cached: self.cache.len(),
            ..Default::default()
        };
        for record in self.records.iter() {
            match record.state() {
                SubscriptionState::Active => stats.active += 1,
                SubscriptionState::Subscribing => stats.subscribing += 1,
                SubscriptionState::Failed => stats.failed += 1,
                SubscriptionState::Unsubscribed => {}
            }
        }
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    struct CountingTransport {
        subscribes: AtomicU32,
        unsubscribes: AtomicU32,
        failing: Mutex<HashSet<String>>,
        delay: Option<Duration>,
        refuse_unsubscribe: bool,
    }

    #[async_trait]
    impl SubscriptionTransport for CountingTransport {
        async fn subscribe(&self, device_id: &str) -> Result<(), TransportError> {
            self.subscribes.fetch_add(1, Ordering::SeqCst);
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            if self.failing.lock().unwrap().contains(device_id) {
                return Err(TransportError::Unreachable("broker down".into()));
            }
            Ok(())
        }

        async fn unsubscribe(&self, _device_id: &str) -> Result<(), TransportError> {
            self.unsubscribes.fetch_add(1, Ordering::SeqCst);
            if self.refuse_unsubscribe {
                return Err(TransportError::Unreachable("broker down".into()));
            }
            Ok(())
        }
    }

    fn manager(transport: Arc<CountingTransport>) -> StatusSubscriptionManager {
        StatusSubscriptionManager::new(transport, Duration::from_secs(1))
    }

    #[tokio::test]
    async fn test_ensure_subscribed_is_idempotent() {
        let transport = Arc::new(CountingTransport::default());
        let manager = manager(transport.clone());

        assert_eq!(
            manager.ensure_subscribed("watermeter_0001").await,
            Ok(SubscriptionState::Active)
        );
        assert_eq!(
            manager.ensure_subscribed("watermeter_0001").await,
            Ok(SubscriptionState::Active)
        );
        assert_eq!(transport.subscribes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_concurrent_requests_subscribe_once() {
        let transport = Arc::new(CountingTransport {
            delay: Some(Duration::from_millis(50)),
            ..Default::default()
        });
        let manager = manager(transport.clone());

        let (a, b) = tokio::join!(
            manager.ensure_subscribed("watermeter_0001"),
            manager.ensure_subscribed("watermeter_0001")
        );

        let mut states = vec![a.unwrap(), b.unwrap()];
        states.sort_by_key(|s| s.to_string());
        assert_eq!(
            states,
            vec![SubscriptionState::Active, SubscriptionState::Subscribing]
        );
        assert_eq!(transport.subscribes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failed_subscription_can_retry() {
        let transport = Arc::new(CountingTransport::default());
        transport
            .failing
            .lock()
            .unwrap()
            .insert("watermeter_0001".into());
        let manager = manager(transport.clone());

        let err = manager.ensure_subscribed("watermeter_0001").await.unwrap_err();
        assert!(matches!(err, SubscriptionError::Transport { .. }));
        assert_eq!(manager.state("watermeter_0001"), SubscriptionState::Failed);

        transport.failing.lock().unwrap().clear();
        assert_eq!(
            manager.ensure_subscribed("watermeter_0001").await,
            Ok(SubscriptionState::Active)
        );
        assert_eq!(transport.subscribes.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_subscribe_timeout() {
        let transport = Arc::new(CountingTransport {
            delay: Some(Duration::from_secs(30)),
            ..Default::default()
        });
        let manager = manager(transport);

        let err = manager.ensure_subscribed("slow_device_01").await.unwrap_err();
        assert!(matches!(err, SubscriptionError::Timeout { .. }));
        assert_eq!(manager.state("slow_device_01"), SubscriptionState::Failed);
    }

    #[tokio::test]
    async fn test_batch_isolates_failures() {
        let transport = Arc::new(CountingTransport::default());
        transport
            .failing
            .lock()
            .unwrap()
            .insert("broken_meter_02".into());
        let manager = manager(transport.clone());

        let outcomes = manager
            .ensure_subscribed_batch(&["meter_0001", "broken_meter_02", "meter_0003"])
            .await;

        assert_eq!(outcomes.len(), 3);
        assert_eq!(outcomes[0].0, "meter_0001");
        assert!(outcomes[0].1.is_ok());
        assert!(outcomes[1].1.is_err());
        assert!(outcomes[2].1.is_ok());

        let stats = manager.stats();
        assert_eq!(stats.active, 2);
        assert_eq!(stats.failed, 1);
    }

    #[tokio::test]
    async fn test_events_update_cache() {
        let manager = manager(Arc::new(CountingTransport::default()));
        manager.ensure_subscribed("watermeter_0001").await.unwrap();

        manager.on_event(DeviceStatusEvent::new("watermeter_0001", json!({"status": "on"})));
        manager.on_event(DeviceStatusEvent::new("watermeter_0001", json!({"status": "off"})));

        let last = manager.get_last_status("watermeter_0001").unwrap();
        assert_eq!(last.status["status"], "off");

        let reading = manager
            .last_status_within("watermeter_0001", Duration::from_secs(60))
            .unwrap();
        assert!(!reading.stale);
    }

    #[tokio::test]
    async fn test_event_without_subscription_is_tolerated() {
        let manager = manager(Arc::new(CountingTransport::default()));

        manager.on_event(DeviceStatusEvent::new("stranger_0001", json!("online")));

        assert_eq!(manager.state("stranger_0001"), SubscriptionState::Unsubscribed);
        assert!(manager.get_last_status("stranger_0001").is_some());
    }

    #[tokio::test]
    async fn test_unsubscribe_keeps_cache() {
        let transport = Arc::new(CountingTransport::default());
        let manager = manager(transport.clone());
        manager.ensure_subscribed("watermeter_0001").await.unwrap();
        manager.on_event(DeviceStatusEvent::new("watermeter_0001", json!("on")));

        manager.unsubscribe("watermeter_0001").await.unwrap();
        // Second teardown is a no-op
        manager.unsubscribe("watermeter_0001").await.unwrap();

        assert_eq!(manager.state("watermeter_0001"), SubscriptionState::Unsubscribed);
        assert_eq!(transport.unsubscribes.load(Ordering::SeqCst), 1);
        assert!(manager.get_last_status("watermeter_0001").is_some());

        // A fresh request subscribes again
        manager.ensure_subscribed("watermeter_0001").await.unwrap();
        assert_eq!(transport.subscribes.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_failed_unsubscribe_keeps_record() {
        let transport = Arc::new(CountingTransport {
            refuse_unsubscribe: true,
            ..Default::default()
        });
        let manager = manager(transport.clone());
        manager.ensure_subscribed("watermeter_0001").await.unwrap();

        let err = manager.unsubscribe("watermeter_0001").await.unwrap_err();
        assert!(matches!(err, SubscriptionError::Transport { .. }));
        assert_eq!(manager.state("watermeter_0001"), SubscriptionState::Active);

        // Still tracked, so another teardown reaches the transport again
        manager.unsubscribe("watermeter_0001").await.unwrap_err();
        assert_eq!(transport.unsubscribes.load(Ordering::SeqCst), 2);
        assert_eq!(transport.subscribes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_feed_lost_marks_failed_then_resubscribes() {
        let transport = Arc::new(CountingTransport::default());
        let manager = manager(transport.clone());
        manager.ensure_subscribed("watermeter_0001").await.unwrap();

        assert_eq!(
            manager.on_feed_lost("watermeter_0001", "status feed closed by endpoint"),
            SubscriptionState::Failed
        );
        assert_eq!(manager.stats().failed, 1);

        assert_eq!(
            manager.ensure_subscribed("watermeter_0001").await,
            Ok(SubscriptionState::Active)
        );
        assert_eq!(transport.subscribes.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_feed_lost_without_record_is_ignored() {
        let manager = manager(Arc::new(CountingTransport::default()));

        assert_eq!(
            manager.on_feed_lost("stranger_0001", "closed"),
            SubscriptionState::Unsubscribed
        );
        assert_eq!(manager.stats(), SubscriptionStats::default());
    }
}
