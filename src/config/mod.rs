//! Configuration management for the control plane

pub mod file;

use std::path::Path;
use std::time::Duration;

use fleet_shared::defaults;

use crate::routing::RegionTable;
use crate::{Error, Result};
use file::FleetConfigFile;

/// Control plane configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Supported regions, their aliases, shard counts and endpoints
    pub regions: Vec<RegionConfig>,
    /// Dispatch retry policy
    pub retry: RetryConfig,
    /// Subscription and status cache settings
    pub subscription: SubscriptionConfig,
    /// Batch dispatch settings
    pub dispatch: DispatchConfig,
    /// Identity verification settings
    pub identity: IdentityConfig,
}

/// A supported region
#[derive(Debug, Clone, PartialEq)]
pub struct RegionConfig {
    /// Canonical name every alias resolves to
    pub name: String,
    /// Alternative spellings, matched case-insensitively
    pub aliases: Vec<String>,
    pub shard_count: u32,
    /// Default endpoint for every shard of this region
    pub endpoint: String,
    /// Per-shard endpoint overrides, indexed by shard
    pub shard_endpoints: Vec<String>,
}

/// Dispatch retry policy settings
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Total attempts, first one included
    pub max_attempts: u32,
    /// Fixed delay between attempts
    pub interval: Duration,
    /// Upper bound for one attempt
    pub attempt_timeout: Duration,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SubscriptionConfig {
    /// Upper bound for one subscribe call
    pub subscribe_timeout: Duration,
    /// Cached status older than this is purged
    pub status_retention: Duration,
    pub sweep_interval: Duration,
    /// Capacity of the inbound status channel
    pub channel_capacity: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DispatchConfig {
    /// Maximum concurrent dispatches in a batch
    pub workers: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct IdentityConfig {
    /// How long an accepted verification is reused
    pub cache_ttl: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: defaults::RETRY_MAX_ATTEMPTS,
            interval: Duration::from_millis(defaults::RETRY_INTERVAL_MS),
            attempt_timeout: Duration::from_millis(defaults::ATTEMPT_TIMEOUT_MS),
        }
    }
}

impl Default for SubscriptionConfig {
    fn default() -> Self {
        Self {
            subscribe_timeout: Duration::from_millis(defaults::SUBSCRIBE_TIMEOUT_MS),
            status_retention: Duration::from_millis(defaults::STATUS_RETENTION_MS),
            sweep_interval: Duration::from_millis(defaults::CACHE_SWEEP_INTERVAL_MS),
            channel_capacity: defaults::EVENT_CHANNEL_CAPACITY,
        }
    }
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            workers: defaults::DISPATCH_WORKERS,
        }
    }
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            cache_ttl: Duration::from_millis(defaults::IDENTITY_CACHE_TTL_MS),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            regions: default_regions(),
            retry: RetryConfig::default(),
            subscription: SubscriptionConfig::default(),
            dispatch: DispatchConfig::default(),
            identity: IdentityConfig::default(),
        }
    }
}

/// The two regions served by the reference deployment
pub fn default_regions() -> Vec<RegionConfig> {
    vec![
        RegionConfig {
            name: "华北".into(),
            aliases: vec!["NORTH_CHINA".into(), "cn-north-4".into()],
            shard_count: 3,
            endpoint: "iotda.cn-north-4.myhuaweicloud.com".into(),
            shard_endpoints: Vec::new(),
        },
        RegionConfig {
            name: "华东".into(),
            aliases: vec!["EAST_CHINA".into(), "cn-east-3".into()],
            shard_count: 4,
            endpoint: "iotda.cn-east-3.myhuaweicloud.com".into(),
            shard_endpoints: Vec::new(),
        },
    ]
}

impl Config {
    /// Load configuration, overlaying the given TOML file on defaults
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config = match path {
            Some(path) => Self::from_file(file::load_config_file(path)?),
            None => Self::default(),
        };
        config.validate()?;
        Ok(config)
    }

    /// Apply a parsed file on top of defaults
    pub fn from_file(fc: FleetConfigFile) -> Self {
        let mut config = Self::default();

        if let Some(v) = fc.retry.max_attempts {
            config.retry.max_attempts = v;
        }
        if let Some(v) = fc.retry.interval_ms {
            config.retry.interval = Duration::from_millis(v);
        }
        if let Some(v) = fc.retry.attempt_timeout_ms {
            config.retry.attempt_timeout = Duration::from_millis(v);
        }

        if let Some(v) = fc.subscription.subscribe_timeout_ms {
            config.subscription.subscribe_timeout = Duration::from_millis(v);
        }
        if let Some(v) = fc.subscription.status_retention_ms {
            config.subscription.status_retention = Duration::from_millis(v);
        }
        if let Some(v) = fc.subscription.sweep_interval_ms {
            config.subscription.sweep_interval = Duration::from_millis(v);
        }
        if let Some(v) = fc.subscription.channel_capacity {
            config.subscription.channel_capacity = v;
        }

        if let Some(v) = fc.dispatch.workers {
            config.dispatch.workers = v;
        }
        if let Some(v) = fc.identity.cache_ttl_ms {
            config.identity.cache_ttl = Duration::from_millis(v);
        }

        if let Some(regions) = fc.regions {
            config.regions = regions
                .into_iter()
                .map(|r| RegionConfig {
                    name: r.name,
                    aliases: r.aliases,
                    shard_count: r.shard_count,
                    endpoint: r.endpoint,
                    shard_endpoints: r.shard_endpoints,
                })
                .collect();
        }

        config
    }

    /// Reject configurations the control plane can't run with
    pub fn validate(&self) -> Result<()> {
        if self.retry.max_attempts == 0 {
            return Err(Error::Config("retry.max_attempts must be at least 1".into()));
        }
        if self.retry.attempt_timeout.is_zero() {
            return Err(Error::Config("retry.attempt_timeout_ms must be non-zero".into()));
        }
        if self.subscription.subscribe_timeout.is_zero() {
            return Err(Error::Config(
                "subscription.subscribe_timeout_ms must be non-zero".into(),
            ));
        }
        if self.subscription.sweep_interval.is_zero() {
            return Err(Error::Config("subscription.sweep_interval_ms must be non-zero".into()));
        }
        if self.subscription.channel_capacity == 0 {
            return Err(Error::Config("subscription.channel_capacity must be at least 1".into()));
        }
        if self.dispatch.workers == 0 {
            return Err(Error::Config("dispatch.workers must be at least 1".into()));
        }

        // Region rules live with the table itself
        RegionTable::new(&self.regions)?;
        Ok(())
    }

    /// Build the immutable region table
    pub fn region_table(&self) -> Result<RegionTable> {
        RegionTable::new(&self.regions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.retry.interval, Duration::from_secs(2));
        assert_eq!(config.regions.len(), 2);
    }

    #[test]
    fn test_overlay_keeps_unset_defaults() {
        let fc = file::parse_config(
            r#"
            [retry]
            interval_ms = 10
            "#,
        )
        .unwrap();
        let config = Config::from_file(fc);
        assert_eq!(config.retry.interval, Duration::from_millis(10));
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.regions, default_regions());
    }

    #[test]
    fn test_zero_attempts_rejected() {
        let mut config = Config::default();
        config.retry.max_attempts = 0;
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_duplicate_alias_rejected() {
        let mut config = Config::default();
        config.regions[1].aliases.push("north_china".into());
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_missing_file_is_error() {
        let result = Config::load(Some(Path::new("/nonexistent/fleet.toml")));
        assert!(matches!(result, Err(Error::Io(_))));
    }
}
