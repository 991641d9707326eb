//! Deterministic device -> (region, shard, endpoint) assignment

use std::collections::BTreeMap;
use std::sync::Arc;

use fleet_shared::ShardAssignment;
use thiserror::Error;

use super::RegionTable;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AssignError {
    #[error("unsupported region: {0}")]
    UnsupportedRegion(String),
}

/// Stable 32-bit polynomial string hash over UTF-16 code units
///
/// Matches the hash existing producers shard on, so both sides agree on
/// which shard owns a device.
pub fn device_hash(device_id: &str) -> i32 {
    device_id
        .encode_utf16()
        .fold(0i32, |h, unit| h.wrapping_mul(31).wrapping_add(unit as i32))
}

/// Shard index in `[0, shard_count)`; negative hashes are folded by absolute value
pub fn shard_index(device_id: &str, shard_count: u32) -> u32 {
    device_hash(device_id).unsigned_abs() % shard_count
}

/// Maps devices onto regional shards
///
/// Pure and cheap: no I/O, no caching.
#[derive(Debug, Clone)]
pub struct RegionShardAssigner {
    table: Arc<RegionTable>,
}

impl RegionShardAssigner {
    pub fn new(table: Arc<RegionTable>) -> Self {
        Self { table }
    }

    pub fn table(&self) -> &RegionTable {
        &self.table
    }

    /// Assign a device to a shard of the given region
    pub fn assign(&self, device_id: &str, region: &str) -> Result<ShardAssignment, AssignError> {
        let region = self
            .table
            .normalize(region)
            .ok_or_else(|| AssignError::UnsupportedRegion(region.to_string()))?;

        let index = shard_index(device_id, region.shard_count());

        Ok(ShardAssignment {
            region: region.name().to_string(),
            shard_index: index,
            endpoint: region.endpoint_for(index).to_string(),
        })
    }
}

/// Bucket positions by shard key (`region_shardIndex`)
pub fn group_by_shard<'a, I>(assignments: I) -> BTreeMap<String, Vec<usize>>
where
    I: IntoIterator<Item = (usize, &'a ShardAssignment)>,
{
    let mut groups: BTreeMap<String, Vec<usize>> = BTreeMap::new();
    for (idx, shard) in assignments {
        groups.entry(shard.shard_key()).or_default().push(idx);
    }
    groups
}
