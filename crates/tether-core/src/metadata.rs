//! Bootstrap connection metadata.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Session-start budget advertised by the gateway.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionStartLimit {
    /// Total session starts allowed in the current window.
    pub total: u32,
    /// Remaining session starts in the current window.
    pub remaining: u32,
    /// Time until the window resets.
    #[serde(with = "crate::serde_duration")]
    pub reset_after: Duration,
    /// How many shards may identify concurrently.
    pub max_concurrency: u32,
}

impl Default for SessionStartLimit {
    fn default() -> Self {
        Self {
            total: 1000,
            remaining: 1000,
            reset_after: Duration::ZERO,
            max_concurrency: 1,
        }
    }
}

/// Connection metadata obtained from the external API (or its cache).
///
/// Immutable once obtained; consumed once per connect attempt. Freshness of a
/// cached copy is owned by the cache collaborator, not by this type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionMetadata {
    /// Gateway URL to open transports against.
    pub url: String,
    /// Shard count recommended by the service. Always at least 1.
    #[serde(default = "default_shard_count")]
    pub recommended_shard_count: u32,
    /// Session-start rate limits.
    #[serde(default)]
    pub session_start_limit: SessionStartLimit,
}

fn default_shard_count() -> u32 {
    1
}

impl ConnectionMetadata {
    /// Creates metadata for a single-shard deployment with no special limits.
    pub fn single_shard(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            recommended_shard_count: 1,
            session_start_limit: SessionStartLimit::default(),
        }
    }

    /// Maximum number of shards that may identify concurrently.
    ///
    /// Guarded so a malformed payload can never yield a zero divisor.
    pub fn max_concurrency(&self) -> u32 {
        self.session_start_limit.max_concurrency.max(1)
    }
}
