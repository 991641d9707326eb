//! Region table: canonical names, aliases, shard counts and endpoints
//!
//! Built once from configuration and shared read-only for the lifetime of
//! the process.

use std::collections::HashMap;

use crate::config::RegionConfig;
use crate::{Error, Result};

/// A supported region after normalization
#[derive(Debug, Clone, PartialEq)]
pub struct Region {
    name: String,
    shard_count: u32,
    endpoint: String,
    shard_endpoints: Vec<String>,
}

impl Region {
    /// Canonical region name
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn shard_count(&self) -> u32 {
        self.shard_count
    }

    /// Endpoint serving one shard of this region
    ///
    /// Falls back to the region endpoint when no per-shard override exists.
    pub fn endpoint_for(&self, shard_index: u32) -> &str {
        self.shard_endpoints
            .get(shard_index as usize)
            .map(String::as_str)
            .unwrap_or(&self.endpoint)
    }
}

/// Immutable lookup from any alias to its canonical region
#[derive(Debug, Clone)]
pub struct RegionTable {
    regions: Vec<Region>,
    /// Lowercased alias -> index into `regions`
    by_alias: HashMap<String, usize>,
}

impl RegionTable {
    /// Build the table, rejecting ambiguous or unusable region definitions
    pub fn new(configs: &[RegionConfig]) -> Result<Self> {
        if configs.is_empty() {
            return Err(Error::Config("at least one region must be configured".into()));
        }

        let mut regions = Vec::with_capacity(configs.len());
        let mut by_alias: HashMap<String, usize> = HashMap::new();

        for (idx, rc) in configs.iter().enumerate() {
            if rc.name.trim().is_empty() {
                return Err(Error::Config("region name must not be blank".into()));
            }
            if rc.shard_count == 0 {
                return Err(Error::Config(format!(
                    "region {} must have at least one shard",
                    rc.name
                )));
            }
            if !rc.shard_endpoints.is_empty() && rc.shard_endpoints.len() != rc.shard_count as usize
            {
                return Err(Error::Config(format!(
                    "region {} lists {} shard endpoints for {} shards",
                    rc.name,
                    rc.shard_endpoints.len(),
                    rc.shard_count
                )));
            }

            for alias in std::iter::once(&rc.name).chain(rc.aliases.iter()) {
                let key = alias.to_lowercase();
                match by_alias.get(&key) {
                    Some(&existing) if existing != idx => {
                        return Err(Error::Config(format!(
                            "alias {} is claimed by both {} and {}",
                            alias, configs[existing].name, rc.name
                        )));
                    }
                    _ => {
                        by_alias.insert(key, idx);
                    }
                }
            }

            regions.push(Region {
                name: rc.name.clone(),
                shard_count: rc.shard_count,
                endpoint: rc.endpoint.clone(),
                shard_endpoints: rc.shard_endpoints.clone(),
            });
        }

        Ok(Self { regions, by_alias })
    }

    /// Resolve a region name or alias, case-insensitively
    pub fn normalize(&self, raw: &str) -> Option<&Region> {
        self.by_alias
            .get(&raw.to_lowercase())
            .map(|&idx| &self.regions[idx])
    }

    /// All canonical region names, in configuration order
    pub fn canonical_names(&self) -> impl Iterator<Item = &str> {
        self.regions.iter().map(|r| r.name.as_str())
    }

    pub fn len(&self) -> usize {
        self.regions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }
}
