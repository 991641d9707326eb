//! Retry policy and exhaustion handling

use std::sync::Arc;
use std::time::Duration;

use fleet_shared::{defaults, CommandResult, ShardAssignment};

use crate::command::CommandTemplate;
use crate::config::RetryConfig;
use crate::transport::TransportError;

/// Fixed-interval retry policy
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, first one included
    pub max_attempts: u32,
    /// Delay between attempts
    pub interval: Duration,
    /// Upper bound for one attempt; a timeout counts as a failed attempt
    pub attempt_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: defaults::RETRY_MAX_ATTEMPTS,
            interval: Duration::from_millis(defaults::RETRY_INTERVAL_MS),
            attempt_timeout: Duration::from_millis(defaults::ATTEMPT_TIMEOUT_MS),
        }
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            interval: config.interval,
            attempt_timeout: config.attempt_timeout,
        }
    }
}

impl RetryPolicy {
    /// Worst-case wall time for one logical command
    pub fn budget(&self) -> Duration {
        let attempts = self.max_attempts.max(1);
        self.attempt_timeout * attempts + self.interval * (attempts - 1)
    }
}

/// Handed to the recovery callback once every attempt failed
#[derive(Debug, Clone, PartialEq)]
pub struct RetryExhausted {
    pub attempts: u32,
    pub last_error: TransportError,
}

/// Synthesizes the terminal result after retries are exhausted
pub type RecoveryCallback =
    Arc<dyn Fn(&CommandTemplate, &ShardAssignment, &RetryExhausted) -> CommandResult + Send + Sync>;

/// Default recovery: a failed result carrying the last transport error
pub fn default_recovery(
    command: &CommandTemplate,
    shard: &ShardAssignment,
    exhausted: &RetryExhausted,
) -> CommandResult {
    CommandResult::failed(
        command.device_id(),
        &shard.region,
        exhausted.attempts,
        format!(
            "retries exhausted after {} attempts: {}",
            exhausted.attempts, exhausted.last_error
        ),
    )
}
