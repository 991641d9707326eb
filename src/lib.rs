//! Fleet control plane
//!
//! Validates device commands, routes them to regional shards, delivers them
//! with bounded retries and tracks device status reported over pub/sub.

pub mod command;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod identity;
pub mod orchestrator;
pub mod routing;
pub mod subscription;
pub mod transport;

#[cfg(test)]
mod test_support;

pub use command::{CommandTemplate, CommandValidator, FieldViolation, ValidationError};
pub use config::Config;
pub use dispatch::{RetryExhausted, RetryPolicy, RetryingDispatcher};
pub use error::{Error, Result};
pub use identity::{verify_batch, CachedVerifier, IdentityVerifier};
pub use orchestrator::{BatchItem, BatchResult, CommandOrchestrator, OrchestratorError};
pub use routing::{group_by_shard, AssignError, RegionShardAssigner, RegionTable};
pub use subscription::{
    status_channel, CacheSweeper, StatusMessage, StatusPump, StatusReading, StatusSink,
    StatusSubscriptionManager, SubscriptionError, SubscriptionStats,
};
pub use transport::{CommandTransport, InMemoryTransport, SubscriptionTransport, TcpTransport, TransportError};
