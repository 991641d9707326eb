//! Error types for the fleet control plane

use thiserror::Error;

/// Result type alias for configuration and setup operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised while building the control plane
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// TOML parsing error
    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
