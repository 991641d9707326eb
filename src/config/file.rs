//! TOML configuration file loading
//!
//! All fields are optional; the file is a partial overlay on top of defaults.
//! A `[[regions]]` list, when present, replaces the default region table.

use std::path::Path;

use serde::Deserialize;

use crate::Result;

/// Top-level TOML configuration file schema
#[derive(Debug, Default, Deserialize)]
pub struct FleetConfigFile {
    #[serde(default)]
    pub retry: RetryFileConfig,

    #[serde(default)]
    pub subscription: SubscriptionFileConfig,

    #[serde(default)]
    pub dispatch: DispatchFileConfig,

    #[serde(default)]
    pub identity: IdentityFileConfig,

    /// Full region table
    #[serde(default)]
    pub regions: Option<Vec<RegionFileConfig>>,
}

/// Dispatch retry policy
#[derive(Debug, Default, Deserialize)]
pub struct RetryFileConfig {
    pub max_attempts: Option<u32>,
    pub interval_ms: Option<u64>,
    pub attempt_timeout_ms: Option<u64>,
}

/// Subscription and status cache settings
#[derive(Debug, Default, Deserialize)]
pub struct SubscriptionFileConfig {
    pub subscribe_timeout_ms: Option<u64>,
    pub status_retention_ms: Option<u64>,
    pub sweep_interval_ms: Option<u64>,
    pub channel_capacity: Option<usize>,
}

/// Batch dispatch settings
#[derive(Debug, Default, Deserialize)]
pub struct DispatchFileConfig {
    /// Maximum concurrent dispatches
    pub workers: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
pub struct IdentityFileConfig {
    pub cache_ttl_ms: Option<u64>,
}

/// One region entry
#[derive(Debug, Deserialize)]
pub struct RegionFileConfig {
    /// Canonical region name (e.g. "华北")
    pub name: String,
    #[serde(default)]
    pub aliases: Vec<String>,
    pub shard_count: u32,
    pub endpoint: String,
    /// Optional endpoint per shard index
    #[serde(default)]
    pub shard_endpoints: Vec<String>,
}

/// Parse a configuration file from disk
///
/// Unlike implicit lookups, an explicitly named file that can't be read or
/// parsed is an error.
pub fn load_config_file(path: &Path) -> Result<FleetConfigFile> {
    let content = std::fs::read_to_string(path)?;
    let config = parse_config(&content)?;
    tracing::info!(path = %path.display(), "loaded config file");
    Ok(config)
}

/// Parse configuration from TOML text
pub fn parse_config(content: &str) -> Result<FleetConfigFile> {
    Ok(toml::from_str(content)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_file() {
        let config = parse_config("").unwrap();
        assert!(config.retry.max_attempts.is_none());
        assert!(config.regions.is_none());
    }

    #[test]
    fn test_partial_overlay() {
        let config = parse_config(
            r#"
            [retry]
            max_attempts = 5

            [dispatch]
            workers = 4
            "#,
        )
        .unwrap();
        assert_eq!(config.retry.max_attempts, Some(5));
        assert!(config.retry.interval_ms.is_none());
        assert_eq!(config.dispatch.workers, Some(4));
    }

    #[test]
    fn test_regions() {
        let config = parse_config(
            r#"
            [[regions]]
            name = "华南"
            aliases = ["SOUTH_CHINA"]
            shard_count = 2
            endpoint = "iotda.cn-south-1.myhuaweicloud.com"
            "#,
        )
        .unwrap();
        let regions = config.regions.unwrap();
        assert_eq!(regions.len(), 1);
        assert_eq!(regions[0].shard_count, 2);
        assert!(regions[0].shard_endpoints.is_empty());
    }

    #[test]
    fn test_invalid_toml() {
        assert!(parse_config("[retry\nmax_attempts = ").is_err());
    }
}
