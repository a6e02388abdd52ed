//! Connection transport abstractions.
//!
//! One transport = one network session to the gateway for one shard. The
//! concrete WebSocket implementation lives in `tether-transport`; the traits
//! here are what the shard state machine (and the test mocks) program
//! against.

use async_trait::async_trait;
use serde_json::Value;

use crate::error::TransportResult;

/// Opens transports to the gateway.
#[async_trait]
pub trait GatewayConnector: Send + Sync {
    /// Opens a new connection to the given URL.
    async fn open(&self, url: &str) -> TransportResult<Box<dyn Connection>>;
}

/// One open duplex message channel to the gateway.
#[async_trait]
pub trait Connection: Send {
    /// Sends one framed message.
    async fn send(&mut self, message: Value) -> TransportResult<()>;

    /// Receives the next inbound item.
    ///
    /// The stream is lazy: messages arrive in order, terminated by exactly
    /// one [`Inbound::Closed`]. Calls after the close observe the same close
    /// reason again.
    async fn recv(&mut self) -> Inbound;

    /// Closes the connection. Idempotent; safe to call in any state.
    async fn close(&mut self);
}

/// One item from a connection's inbound sequence.
#[derive(Debug, Clone)]
pub enum Inbound {
    /// A framed message.
    Message(Value),
    /// The transport closed; no further messages will arrive.
    Closed(CloseReason),
}

/// Why a transport closed, and whether the session it carried may be resumed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseReason {
    /// Close code reported by the peer, if any.
    pub code: Option<u16>,
    /// Human-readable reason.
    pub reason: String,
    /// Whether the closure permits resuming the prior session.
    pub resumable: bool,
}

impl CloseReason {
    /// Classifies a peer-reported close code.
    pub fn from_code(code: u16, reason: impl Into<String>) -> Self {
        Self {
            code: Some(code),
            reason: reason.into(),
            resumable: resumable_close_code(code),
        }
    }

    /// Close without a frame (connection reset, stream end). Resumable: the
    /// session itself was never invalidated.
    pub fn abnormal(reason: impl Into<String>) -> Self {
        Self {
            code: None,
            reason: reason.into(),
            resumable: true,
        }
    }

    /// Local force-close of a stalled (zombie) connection.
    pub fn stalled() -> Self {
        Self {
            code: None,
            reason: "heartbeat ack overdue".to_string(),
            resumable: true,
        }
    }
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.code {
            Some(code) => write!(f, "close code {code}: {}", self.reason),
            None => write!(f, "{}", self.reason),
        }
    }
}

/// Whether a session may be resumed after the peer closed with `code`.
///
/// Clean closes end the session outright, and the 4xxx codes below signal
/// conditions a resume cannot fix (bad credentials, bad shard layout,
/// rejected intents). Everything else, including abnormal closures without a
/// code, leaves the server-side session alive long enough to resume.
pub fn resumable_close_code(code: u16) -> bool {
    !matches!(
        code,
        1000 | 1001 // clean close: the session is gone
        | 4004 // authentication failed
        | 4010 // invalid shard
        | 4011 // sharding required
        | 4012 // invalid protocol version
        | 4013 // invalid intents
        | 4014 // disallowed intents
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_failure_is_not_resumable() {
        let reason = CloseReason::from_code(4004, "authentication failed");
        assert!(!reason.resumable);
    }

    #[test]
    fn unknown_error_is_resumable() {
        let reason = CloseReason::from_code(4000, "unknown error");
        assert!(reason.resumable);
    }

    #[test]
    fn codeless_close_is_resumable() {
        assert!(CloseReason::abnormal("connection reset").resumable);
        assert!(CloseReason::stalled().resumable);
    }
}
