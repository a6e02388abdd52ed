//! Runtime error types.

use thiserror::Error;

use crate::config::ConfigError;
use tether_gateway::ConnectError;

/// Errors surfaced by the client orchestrator.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Configuration failed to load or validate.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// A fatal, non-retryable connect failure.
    #[error(transparent)]
    Connect(#[from] ConnectError),

    /// A required transport implementation was neither compiled in nor
    /// injected.
    #[error("transport '{0}' not available: enable the feature or inject an implementation")]
    TransportUnavailable(&'static str),
}

/// Result type for client operations.
pub type ClientResult<T> = Result<T, ClientError>;
