//! # Tether Transport
//!
//! Network transport implementations for the Tether gateway client.
//!
//! Each transport is feature-gated so embedders only compile what they use:
//!
//! - `ws-client`: WebSocket gateway connector ([`WsConnector`])
//! - `http-client`: REST bootstrap metadata client ([`RestClient`])
//!
//! The traits these types implement live in `tether-core`; the session
//! machinery never depends on this crate directly, which is what keeps the
//! shard and manager testable against scripted mock connections.

#[cfg(feature = "http-client")]
pub mod http;
#[cfg(feature = "ws-client")]
pub mod websocket;

#[cfg(feature = "http-client")]
pub use http::RestClient;
#[cfg(feature = "ws-client")]
pub use websocket::{WsConnection, WsConnector};
