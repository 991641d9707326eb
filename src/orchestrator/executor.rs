//! Single-command execution

use std::sync::Arc;

use fleet_shared::{CommandResult, DeviceStatusEvent};
use tokio::sync::Semaphore;
use tracing::{info, warn};

use super::OrchestratorError;
use crate::command::{CommandTemplate, CommandValidator};
use crate::config::Config;
use crate::dispatch::{RetryPolicy, RetryingDispatcher};
use crate::identity::{CachedVerifier, IdentityVerifier};
use crate::routing::RegionShardAssigner;
use crate::subscription::StatusSubscriptionManager;
use crate::transport::{CommandTransport, SubscriptionTransport};

/// Composes validation, subscription, assignment and dispatch
pub struct CommandOrchestrator {
    pub(super) validator: CommandValidator,
    pub(super) assigner: RegionShardAssigner,
    pub(super) dispatcher: Arc<RetryingDispatcher>,
    pub(super) subscriptions: Arc<StatusSubscriptionManager>,
    /// Bounds concurrent dispatches across all callers
    pub(super) workers: Arc<Semaphore>,
    verifier: Option<Arc<dyn IdentityVerifier>>,
}

impl CommandOrchestrator {
    pub fn new(
        validator: CommandValidator,
        assigner: RegionShardAssigner,
        dispatcher: Arc<RetryingDispatcher>,
        subscriptions: Arc<StatusSubscriptionManager>,
        workers: usize,
    ) -> Self {
        Self {
            validator,
            assigner,
            dispatcher,
            subscriptions,
            workers: Arc::new(Semaphore::new(workers.max(1))),
            verifier: None,
        }
    }

    /// Wire every component from configuration
    pub fn from_config(
        config: &Config,
        commands: Arc<dyn CommandTransport>,
        subscriptions: Arc<dyn SubscriptionTransport>,
    ) -> crate::Result<Self> {
        config.validate()?;
        let regions = Arc::new(config.region_table()?);

        let dispatcher = RetryingDispatcher::new(commands, RetryPolicy::from(&config.retry));
        let manager = StatusSubscriptionManager::new(subscriptions, config.subscription.subscribe_timeout);

        Ok(Self::new(
            CommandValidator::new(regions.clone()),
            RegionShardAssigner::new(regions),
            Arc::new(dispatcher),
            Arc::new(manager),
            config.dispatch.workers,
        ))
    }

    /// Gate `execute_authenticated` on a verifier
    pub fn with_verifier(mut self, verifier: Arc<dyn IdentityVerifier>) -> Self {
        self.verifier = Some(verifier);
        self
    }

    /// Gate on a verifier wrapped in a TTL cache from configuration
    pub fn with_cached_verifier(self, verifier: Arc<dyn IdentityVerifier>, config: &Config) -> Self {
        self.with_verifier(Arc::new(CachedVerifier::new(verifier, config.identity.cache_ttl)))
    }

    pub fn subscriptions(&self) -> &Arc<StatusSubscriptionManager> {
        &self.subscriptions
    }

    pub fn assigner(&self) -> &RegionShardAssigner {
        &self.assigner
    }

    pub fn validator(&self) -> &CommandValidator {
        &self.validator
    }

    /// Execute one raw command
    ///
    /// Only validation and assignment fail with an error; dispatch failures
    /// come back as a failed `CommandResult`.
    pub async fn execute_command(&self, raw: &str) -> Result<CommandResult, OrchestratorError> {
        let template = self.validator.validate(raw)?;
        self.run(template).await
    }

    /// Execute one raw command after verifying the device credential
    ///
    /// Without a configured verifier this behaves like `execute_command`.
    pub async fn execute_authenticated(
        &self,
        raw: &str,
        credential: &[u8],
    ) -> Result<CommandResult, OrchestratorError> {
        let template = self.validator.validate(raw)?;

        if let Some(verifier) = &self.verifier {
            if !verifier.verify(template.device_id(), credential).await {
                warn!(device_id = template.device_id(), "Refusing dispatch, identity rejected");
                return Err(OrchestratorError::IdentityRejected(template.device_id().to_string()));
            }
        }

        self.run(template).await
    }

    /// Subscribe, assign and dispatch a validated command
    pub async fn run(&self, template: CommandTemplate) -> Result<CommandResult, OrchestratorError> {
        let device_id = template.device_id();

        if let Err(e) = self.subscriptions.ensure_subscribed(device_id).await {
            warn!(device_id, "Continuing without status subscription: {}", e);
        }

        let shard = self.assigner.assign(device_id, template.region())?;
        info!(
            device_id,
            region = %shard.region,
            shard = shard.shard_index,
            "Executing {}",
            template.command_type()
        );

        // The semaphore is never closed
        let _permit = self.workers.acquire().await.ok();
        Ok(self.dispatcher.dispatch(&template, &shard).await)
    }

    /// Ask the device's shard endpoint for its current status
    ///
    /// Routed and retried like a command. An answer also refreshes the
    /// last-known status cache.
    pub async fn query_status(
        &self,
        device_id: &str,
        region: &str,
    ) -> Result<DeviceStatusEvent, OrchestratorError> {
        let shard = self.assigner.assign(device_id, region)?;
        info!(
            device_id,
            region = %shard.region,
            shard = shard.shard_index,
            "Querying device status"
        );

        // The semaphore is never closed
        let _permit = self.workers.acquire().await.ok();
        let event = self
            .dispatcher
            .query_status(device_id, &shard)
            .await
            .map_err(|exhausted| OrchestratorError::StatusQueryFailed {
                device_id: device_id.to_string(),
                attempts: exhausted.attempts,
                source: exhausted.last_error,
            })?;

        self.subscriptions.on_event(event.clone());
        Ok(event)
    }
}
