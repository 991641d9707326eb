//! Region normalization and shard routing
//!
//! This module handles:
//! - Resolving region aliases to one canonical region
//! - Hashing devices onto a fixed number of shards per region
//! - Looking up the endpoint serving a (region, shard) pair

mod assigner;
mod region;

pub use assigner::{device_hash, group_by_shard, shard_index, AssignError, RegionShardAssigner};
pub use region::{Region, RegionTable};
