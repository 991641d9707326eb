//! Retrying dispatcher for commands and status queries to regional endpoints

use std::future::Future;
use std::sync::Arc;

use fleet_shared::{CommandResult, CommandStatus, DeviceStatusEvent, ShardAssignment};
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, warn};

use super::policy::{default_recovery, RecoveryCallback, RetryExhausted, RetryPolicy};
use crate::command::CommandTemplate;
use crate::transport::{CommandTransport, TransportError};

/// Wraps a command transport with bounded, fixed-interval retries
///
/// Delivery is at-least-once: an attempt that timed out may still have
/// reached the endpoint, so a retry can duplicate the command. Commands that
/// must not be applied twice need idempotent handling on the device side.
pub struct RetryingDispatcher {
    transport: Arc<dyn CommandTransport>,
    policy: RetryPolicy,
    recovery: RecoveryCallback,
}

impl RetryingDispatcher {
    /// Create a dispatcher using the default recovery callback
    pub fn new(transport: Arc<dyn CommandTransport>, policy: RetryPolicy) -> Self {
        Self {
            transport,
            policy,
            recovery: Arc::new(default_recovery),
        }
    }

    /// Replace the callback that builds the terminal result on exhaustion
    pub fn with_recovery(mut self, recovery: RecoveryCallback) -> Self {
        self.recovery = recovery;
        self
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Dispatch a command, retrying transport failures
    ///
    /// Always produces a `CommandResult`; transport errors never escape.
    pub async fn dispatch(&self, command: &CommandTemplate, shard: &ShardAssignment) -> CommandResult {
        let device_id = command.device_id();
        let outcome = self
            .with_retries(device_id, shard, "command", move || {
                self.transport.send(command, &shard.endpoint)
            })
            .await;

        let exhausted = match outcome {
            Ok((command_id, attempt)) => {
                info!(
                    device_id,
                    command_id = %command_id,
                    "Command accepted on attempt {}",
                    attempt
                );
                return CommandResult::accepted(device_id, command_id, &shard.region, attempt);
            }
            Err(exhausted) => exhausted,
        };
        error!(
            device_id,
            "Command failed after {} attempts: {}",
            exhausted.attempts,
            exhausted.last_error
        );

        let mut result = (self.recovery)(command, shard, &exhausted);
        if result.status != CommandStatus::Failed {
            warn!(
                device_id,
                "Recovery callback returned a non-terminal status, forcing failed"
            );
            result.status = CommandStatus::Failed;
            result.command_id = None;
        }
        result
    }

    /// Query a device's current status at its shard endpoint
    ///
    /// Uses the same attempt limit, interval and per-attempt timeout as
    /// command dispatch. The recovery callback does not apply.
    pub async fn query_status(
        &self,
        device_id: &str,
        shard: &ShardAssignment,
    ) -> Result<DeviceStatusEvent, RetryExhausted> {
        match self
            .with_retries(device_id, shard, "status query", move || {
                self.transport.query_status(device_id, &shard.endpoint)
            })
            .await
        {
            Ok((payload, attempt)) => {
                debug!(device_id, "Status query answered on attempt {}", attempt);
                Ok(DeviceStatusEvent::new(device_id, payload))
            }
            Err(exhausted) => {
                error!(
                    device_id,
                    "Status query failed after {} attempts: {}",
                    exhausted.attempts,
                    exhausted.last_error
                );
                Err(exhausted)
            }
        }
    }

    /// Run `attempt` until it succeeds or the policy is exhausted
    ///
    /// Returns the value together with the attempt number that produced it.
    async fn with_retries<T, F, Fut>(
        &self,
        device_id: &str,
        shard: &ShardAssignment,
        operation: &str,
        mut attempt_once: F,
    ) -> Result<(T, u32), RetryExhausted>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, TransportError>>,
    {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut last_error = TransportError::Closed;

        for attempt in 1..=max_attempts {
            info!(
                device_id,
                endpoint = %shard.endpoint,
                shard = shard.shard_index,
                "Sending {}, attempt {}/{} via {}",
                operation,
                attempt,
                max_attempts,
                self.transport.name()
            );

            let outcome = match timeout(self.policy.attempt_timeout, attempt_once()).await {
                Ok(outcome) => outcome,
                Err(_) => Err(TransportError::Timeout(self.policy.attempt_timeout)),
            };

            match outcome {
                Ok(value) => return Ok((value, attempt)),
                Err(e) => {
                    warn!(
                        device_id,
                        "{} attempt {}/{} failed: {}",
                        operation,
                        attempt,
                        max_attempts,
                        e
                    );
                    last_error = e;
                }
            }

            if attempt < max_attempts {
                sleep(self.policy.interval).await;
            }
        }

        Err(RetryExhausted {
            attempts: max_attempts,
            last_error,
        })
    }
}
