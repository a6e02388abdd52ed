//! # Tether
//!
//! A resilient client for message-oriented control-plane services ("the
//! gateway"): it maintains persistent, sharded sessions and turns the inbound
//! event stream into typed, cached, dispatched application events.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────┐   cache / API   ┌─────────────────────┐
//! │ Client │───────────────▶ │ GatewaySessionMgr   │
//! └────────┘                 └──────────┬──────────┘
//!                        supervise │ backoff │ retry
//!                         ┌────────┴───┬────┴─────┐
//!                     ┌───▼───┐    ┌───▼───┐  ┌───▼───┐
//!                     │Shard 0│    │Shard 1│  │Shard n│
//!                     └───┬───┘    └───┬───┘  └───┬───┘
//!                         ▼            ▼          ▼
//!                      pipeline     pipeline   pipeline
//!                   (cache stage → business stage per event)
//! ```
//!
//! - **Client**: root object wiring the component graph; `connect()` resolves
//!   once every shard is ready, `shutdown()` drains deterministically
//! - **Session manager**: bootstrap metadata (cache first, API fallback),
//!   shard supervision, centralized backoff and retry cancellation
//! - **Shards**: identify/resume handshake, heartbeats with zombie
//!   detection, per-shard event ordering
//! - **Pipeline**: per event type, an ordered pair of cache and business
//!   stages with failure isolation
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use tether::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = Client::builder().config_file("tether.toml").build()?;
//!
//!     client.on(
//!         "MESSAGE_CREATE",
//!         EventStages::new()
//!             .cache(|payload| async move { /* keep local state consistent */ Ok(()) })
//!             .business(|payload| async move { /* application logic */ Ok(()) }),
//!     );
//!
//!     client.run().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Features
//!
//! - `ws-client`: WebSocket gateway transport (default)
//! - `http-client`: REST bootstrap metadata client (default)
//! - `toml-config`: TOML configuration files (default)
//! - `json-log`: JSON log output

pub use tether_core as core;
pub use tether_gateway as gateway;
pub use tether_runtime as runtime;
pub use tether_transport as transport;

/// Prelude module for convenient imports.
///
/// ```rust,ignore
/// use tether::prelude::*;
/// ```
pub mod prelude {
    // Client - main entry point
    pub use tether_runtime::{Client, ClientBuilder, ClientError, TetherConfig};

    // Handler registration
    pub use tether_core::{EventEnvelope, EventRegistry, EventStages, HandlerError};

    // Session observation and tuning
    pub use tether_core::{BackoffPolicy, ConnectionMetadata, SessionState};
    pub use tether_gateway::{ConnectError, IdentifyCredentials, ManagerConfig};

    // Collaborator seams for custom implementations
    pub use tether_core::{GatewayConnector, MetadataApi, SessionCache};
}
