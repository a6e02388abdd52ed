//! # Tether Runtime
//!
//! Runtime orchestration for the Tether gateway client: configuration
//! loading (figment), logging setup (tracing-subscriber), and the [`Client`]
//! facade that wires the session manager, transports, cache, and handler
//! registry together.
//!
//! ```rust,ignore
//! use tether_runtime::Client;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = Client::builder().build()?;
//!     client.run().await?;
//!     Ok(())
//! }
//! ```

pub mod client;
pub mod config;
pub mod error;
pub mod logging;

pub use client::{Client, ClientBuilder};
pub use config::{ConfigError, ConfigLoader, ConfigResult, LoggingConfig, TetherConfig};
pub use error::{ClientError, ClientResult};
pub use logging::LoggingBuilder;
