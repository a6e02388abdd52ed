//! Configuration loading and schema.

mod error;
mod loader;
mod schema;

pub use error::{ConfigError, ConfigResult};
pub use loader::ConfigLoader;
pub use schema::{
    ApiConfig, CredentialsConfig, GatewayConfig, LogFormat, LogLevel, LogOutput, LoggingConfig,
    TetherConfig,
};
