//! Device status subscriptions
//!
//! This module handles:
//! - Idempotent per-device subscription with a bounded subscribe timeout
//! - The inbound status channel from transports, including lost feeds
//! - Last-known status caching with staleness checks
//! - Periodic purge of old statuses

mod cache;
mod manager;
mod pump;
mod sweeper;

pub use cache::StatusReading;
pub use manager::{StatusSubscriptionManager, SubscriptionError, SubscriptionStats};
pub use pump::{status_channel, StatusMessage, StatusPump, StatusSink};
pub use sweeper::CacheSweeper;
