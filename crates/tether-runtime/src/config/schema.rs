//! Configuration schema.
//!
//! Everything here deserializes with serde defaults so a minimal file (or no
//! file at all, for fully programmatic setups) still yields a usable
//! configuration.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use tether_core::BackoffPolicy;
use tether_gateway::ManagerConfig;

/// Top-level Tether configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TetherConfig {
    /// Identify credentials.
    pub credentials: CredentialsConfig,
    /// Gateway session tuning.
    pub gateway: GatewayConfig,
    /// Bootstrap metadata API.
    pub api: ApiConfig,
    /// Logging setup.
    pub logging: LoggingConfig,
}

impl TetherConfig {
    /// Validates cross-field constraints the schema cannot express.
    pub fn validate(&self) -> Result<(), String> {
        if self.credentials.token.is_empty() {
            return Err("credentials.token must not be empty".to_string());
        }
        if self.gateway.event_buffer == 0 {
            return Err("gateway.event_buffer must be at least 1".to_string());
        }
        if let Some(0) = self.gateway.shard_count {
            return Err("gateway.shard_count must be at least 1".to_string());
        }
        Ok(())
    }
}

/// Identify credentials.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CredentialsConfig {
    /// Application token.
    pub token: String,
    /// Event intents bitfield.
    pub intents: u64,
}

/// Gateway session tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Fixed shard count. Absent means follow the service recommendation.
    pub shard_count: Option<u32>,
    /// Backoff between whole connect-sequence retries.
    pub bootstrap_backoff: BackoffPolicy,
    /// Backoff between a shard's reconnect attempts.
    pub reconnect_backoff: BackoffPolicy,
    /// TTL for cached connection metadata.
    #[serde(with = "tether_core::serde_duration")]
    pub metadata_ttl: Duration,
    /// Gap between identify waves.
    #[serde(with = "tether_core::serde_duration")]
    pub identify_wave_interval: Duration,
    /// Per-shard event channel capacity.
    pub event_buffer: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        let defaults = ManagerConfig::default();
        Self {
            shard_count: defaults.shard_count,
            bootstrap_backoff: defaults.bootstrap_backoff,
            reconnect_backoff: defaults.reconnect_backoff,
            metadata_ttl: defaults.metadata_ttl,
            identify_wave_interval: defaults.identify_wave_interval,
            event_buffer: defaults.event_buffer,
        }
    }
}

impl GatewayConfig {
    /// Converts to the session manager's configuration.
    pub fn to_manager_config(&self) -> ManagerConfig {
        ManagerConfig {
            shard_count: self.shard_count,
            bootstrap_backoff: self.bootstrap_backoff.clone(),
            reconnect_backoff: self.reconnect_backoff.clone(),
            metadata_ttl: self.metadata_ttl,
            identify_wave_interval: self.identify_wave_interval,
            event_buffer: self.event_buffer,
        }
    }
}

/// Bootstrap metadata API settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    /// Bootstrap endpoint URL.
    pub endpoint: String,
    /// Request timeout.
    #[serde(with = "tether_core::serde_duration")]
    pub timeout: Duration,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            timeout: Duration::from_secs(30),
        }
    }
}

// =============================================================================
// Logging
// =============================================================================

/// Log severity level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl LogLevel {
    /// The equivalent tracing level.
    pub fn to_tracing_level(self) -> tracing::Level {
        match self {
            Self::Trace => tracing::Level::TRACE,
            Self::Debug => tracing::Level::DEBUG,
            Self::Info => tracing::Level::INFO,
            Self::Warn => tracing::Level::WARN,
            Self::Error => tracing::Level::ERROR,
        }
    }

    /// The filter-directive form.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Trace => "trace",
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Compact,
    Full,
    Pretty,
    #[cfg(feature = "json-log")]
    Json,
}

/// Log output destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogOutput {
    #[default]
    Stdout,
    Stderr,
    File,
}

/// Logging configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Base severity level.
    pub level: LogLevel,
    /// Output format.
    pub format: LogFormat,
    /// Output destination.
    pub output: LogOutput,
    /// Log file path, for `output = "file"`.
    pub file_path: Option<PathBuf>,
    /// Per-module level overrides.
    pub filters: HashMap<String, LogLevel>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_usable_except_for_the_token() {
        let config = TetherConfig::default();
        assert!(config.validate().is_err(), "empty token must not validate");

        let mut config = TetherConfig::default();
        config.credentials.token = "secret".to_string();
        assert!(config.validate().is_ok());
        assert_eq!(config.gateway.shard_count, None);
        assert_eq!(config.gateway.identify_wave_interval, Duration::from_secs(5));
    }

    #[test]
    fn zero_shard_count_is_rejected() {
        let mut config = TetherConfig::default();
        config.credentials.token = "secret".to_string();
        config.gateway.shard_count = Some(0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn gateway_config_round_trips_through_json() {
        let config = GatewayConfig {
            shard_count: Some(4),
            metadata_ttl: Duration::from_secs(120),
            ..GatewayConfig::default()
        };
        let json = serde_json::to_string(&config).unwrap();
        let back: GatewayConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.shard_count, Some(4));
        assert_eq!(back.metadata_ttl, Duration::from_secs(120));
    }
}
