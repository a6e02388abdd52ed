//! Configuration error types.

use thiserror::Error;

/// Errors from loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A source failed to load or deserialize.
    #[error("failed to load configuration: {0}")]
    Load(#[from] figment::Error),

    /// The merged configuration is invalid.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Result type for configuration operations.
pub type ConfigResult<T> = Result<T, ConfigError>;
