//! Device identity gating
//!
//! Credential parsing and cryptography live behind `IdentityVerifier`; this
//! module only adds caching and batch verification on top.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use fleet_shared::now_ms;
use futures::future::join_all;
use tracing::{debug, info, warn};

/// Accepts or rejects a device credential
#[async_trait]
pub trait IdentityVerifier: Send + Sync {
    async fn verify(&self, device_id: &str, credential: &[u8]) -> bool;
}

/// Caches accepted verifications per device for a fixed TTL
///
/// Rejections are never cached, so a device can retry with a corrected
/// credential immediately.
pub struct CachedVerifier {
    inner: Arc<dyn IdentityVerifier>,
    ttl: Duration,
    /// device id -> accepted at (ms)
    accepted: DashMap<String, u64>,
}

impl CachedVerifier {
    pub fn new(inner: Arc<dyn IdentityVerifier>, ttl: Duration) -> Self {
        Self {
            inner,
            ttl,
            accepted: DashMap::new(),
        }
    }

    fn cached(&self, device_id: &str, now: u64) -> bool {
        let ttl_ms = self.ttl.as_millis() as u64;
        match self.accepted.get(device_id).map(|at| *at) {
            Some(at) if now.saturating_sub(at) <= ttl_ms => true,
            Some(_) => {
                self.accepted.remove(device_id);
                false
            }
            None => false,
        }
    }

    /// Drop expired entries, returning how many were removed
    pub fn clean_expired(&self) -> usize {
        let ttl_ms = self.ttl.as_millis() as u64;
        let now = now_ms();
        let before = self.accepted.len();
        self.accepted.retain(|_, at| now.saturating_sub(*at) <= ttl_ms);
        before.saturating_sub(self.accepted.len())
    }

    pub fn cached_count(&self) -> usize {
        self.accepted.len()
    }
}

#[async_trait]
impl IdentityVerifier for CachedVerifier {
    async fn verify(&self, device_id: &str, credential: &[u8]) -> bool {
        if self.cached(device_id, now_ms()) {
            debug!(device_id, "Using cached identity verification");
            return true;
        }

        let accepted = self.inner.verify(device_id, credential).await;
        if accepted {
            self.accepted.insert(device_id.to_string(), now_ms());
            info!(device_id, "Identity verified");
        } else {
            warn!(device_id, "Identity rejected");
        }
        accepted
    }
}

/// Verify many devices concurrently, preserving input order
pub async fn verify_batch(
    verifier: &dyn IdentityVerifier,
    credentials: &[(String, Vec<u8>)],
) -> Vec<(String, bool)> {
    info!("Verifying {} device identities", credentials.len());

    let outcomes = join_all(
        credentials
            .iter()
            .map(|(device_id, credential)| verifier.verify(device_id, credential)),
    )
    .await;

    let results: Vec<(String, bool)> = credentials
        .iter()
        .map(|(device_id, _)| device_id.clone())
        .zip(outcomes)
        .collect();

    let accepted = results.iter().filter(|(_, ok)| *ok).count();
    info!(
        "Identity batch complete: {} accepted, {} rejected",
        accepted,
        results.len() - accepted
    );
    results
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Accepts credentials equal to the device id bytes
    #[derive(Default)]
    struct EchoVerifier {
        calls: AtomicU32,
    }

    #[async_trait]
    impl IdentityVerifier for EchoVerifier {
        async fn verify(&self, device_id: &str, credential: &[u8]) -> bool {
            self.calls.fetch_add(1, Ordering::SeqCst);
            device_id.as_bytes() == credential
        }
    }

    #[tokio::test]
    async fn test_cached_accept_skips_inner() {
        let inner = Arc::new(EchoVerifier::default());
        let verifier = CachedVerifier::new(inner.clone(), Duration::from_secs(3600));

        assert!(verifier.verify("watermeter_0001", b"watermeter_0001").await);
        // Cached, so even a bad credential passes inside the TTL
        assert!(verifier.verify("watermeter_0001", b"anything").await);
        assert_eq!(inner.calls.load(Ordering::SeqCst), 1);
        assert_eq!(verifier.cached_count(), 1);
    }

    #[tokio::test]
    async fn test_rejection_not_cached() {
        let inner = Arc::new(EchoVerifier::default());
        let verifier = CachedVerifier::new(inner.clone(), Duration::from_secs(3600));

        assert!(!verifier.verify("watermeter_0001", b"wrong").await);
        assert!(verifier.verify("watermeter_0001", b"watermeter_0001").await);
        assert_eq!(inner.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_expired_entries_cleaned() {
        let inner = Arc::new(EchoVerifier::default());
        let verifier = CachedVerifier::new(inner.clone(), Duration::ZERO);
        verifier.accepted.insert("watermeter_0001".into(), now_ms() - 5_000);

        assert_eq!(verifier.clean_expired(), 1);
        assert_eq!(verifier.cached_count(), 0);
    }

    #[tokio::test]
    async fn test_verify_batch_keeps_order() {
        let verifier = EchoVerifier::default();
        let credentials = vec![
            ("watermeter_0001".to_string(), b"watermeter_0001".to_vec()),
            ("watermeter_0002".to_string(), b"forged".to_vec()),
            ("watermeter_0003".to_string(), b"watermeter_0003".to_vec()),
        ];

        let results = verify_batch(&verifier, &credentials).await;
        assert_eq!(
            results,
            vec![
                ("watermeter_0001".to_string(), true),
                ("watermeter_0002".to_string(), false),
                ("watermeter_0003".to_string(), true),
            ]
        );
    }
}
