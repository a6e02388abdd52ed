//! # Tether Core
//!
//! Foundation types for the Tether gateway client.
//!
//! This crate provides the building blocks shared by the session machinery
//! and the runtime:
//!
//! - **Backoff**: deterministic retry/delay decisions ([`BackoffPolicy`])
//! - **Collaborator seams**: session cache ([`SessionCache`]) and bootstrap
//!   metadata API ([`MetadataApi`]) traits
//! - **Transport abstraction**: one duplex message channel per shard
//!   ([`GatewayConnector`], [`Connection`])
//! - **Dispatch pipeline**: two-stage (cache, then business) handler registry
//!   with failure isolation ([`EventRegistry`], [`EventPipeline`])
//! - **Error taxonomy**: transport/handshake/API/handler/cache errors
//!
//! Events flow from each shard's transport into the pipeline in delivery
//! order:
//!
//! ```text
//! ┌───────────┐     ┌──────────────┐     ┌─────────────┐
//! │   Shard   │────▶│   Pipeline   │────▶│ cache stage │
//! │ (gateway) │     │ (per shard)  │     ├─────────────┤
//! └───────────┘     └──────────────┘     │ biz stage   │
//!                                        └─────────────┘
//! ```

pub mod api;
pub mod backoff;
pub mod cache;
pub mod dispatch;
pub mod envelope;
pub mod error;
pub mod metadata;
pub mod serde_duration;
pub mod session;
pub mod transport;

pub use api::MetadataApi;
pub use backoff::{BackoffDecision, BackoffPolicy, Delay};
pub use cache::{MemorySessionCache, SessionCache};
pub use dispatch::{EventPipeline, EventRegistry, EventStages, StageFn};
pub use envelope::EventEnvelope;
pub use error::{
    ApiError, ApiResult, CacheError, CacheResult, HandlerError, HandlerResult, HandshakeError,
    HandshakeResult, TransportError, TransportResult,
};
pub use metadata::{ConnectionMetadata, SessionStartLimit};
pub use session::{HeartbeatState, ResumeToken, SessionState, ShardId};
pub use transport::{CloseReason, Connection, GatewayConnector, Inbound, resumable_close_code};
