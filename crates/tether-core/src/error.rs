//! Unified error types for the Tether core crates.
//!
//! This module defines the error taxonomy shared by the transport layer, the
//! gateway session machinery, and the dispatch pipeline. Runtime-level errors
//! (configuration, orchestration) are defined in `tether-runtime`.

use thiserror::Error;

// =============================================================================
// Transport Errors
// =============================================================================

/// Errors that can occur in transport operations.
///
/// Transport failures are always recoverable: the session manager decides
/// whether to retry based on the configured backoff policy.
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    /// Opening the connection failed.
    #[error("connection failed: {url} - {reason}")]
    ConnectFailed {
        /// The URL that failed to connect.
        url: String,
        /// Reason for failure.
        reason: String,
    },

    /// A send was attempted on a connection that is not open.
    #[error("connection is not open")]
    NotOpen,

    /// Message send failed.
    #[error("failed to send message: {0}")]
    SendFailed(String),

    /// The connection closed while an operation was in flight.
    #[error("connection closed: {reason}")]
    Closed {
        /// Reason for closure.
        reason: String,
    },

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(String),
}

impl From<std::io::Error> for TransportError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

// =============================================================================
// Handshake Errors
// =============================================================================

/// Errors that can occur during the identify/resume handshake.
///
/// A handshake failure invalidates any held resume token: the next attempt
/// must identify from scratch.
#[derive(Debug, Clone, Error)]
pub enum HandshakeError {
    /// The gateway sent something other than the expected frame.
    #[error("unexpected frame during handshake: expected {expected}, got {got}")]
    UnexpectedFrame {
        /// What the handshake state machine was waiting for.
        expected: &'static str,
        /// What actually arrived.
        got: String,
    },

    /// The gateway rejected the identify or resume payload.
    #[error("handshake rejected: {reason}")]
    Rejected {
        /// Reason for rejection.
        reason: String,
    },

    /// A handshake frame could not be decoded.
    #[error("malformed handshake frame: {0}")]
    Malformed(String),

    /// The transport closed before the handshake completed.
    #[error(transparent)]
    Transport(#[from] TransportError),
}

// =============================================================================
// API Errors
// =============================================================================

/// Errors from the external metadata API collaborator.
#[derive(Debug, Clone, Error)]
pub enum ApiError {
    /// The request could not be sent.
    #[error("API request failed: {0}")]
    Request(String),

    /// The API returned a non-success status.
    #[error("API error ({status}): {body}")]
    Status {
        /// HTTP status code.
        status: u16,
        /// Response body, as far as it could be read.
        body: String,
    },

    /// The response body could not be decoded.
    #[error("failed to decode API response: {0}")]
    Decode(String),
}

impl From<serde_json::Error> for ApiError {
    fn from(err: serde_json::Error) -> Self {
        Self::Decode(err.to_string())
    }
}

// =============================================================================
// Handler Errors
// =============================================================================

/// Error returned by a cache-stage or business-stage event handler.
///
/// Handler errors are always recovered inside the dispatch pipeline: they are
/// logged and never stall dispatch of other stages, envelopes, or event types.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct HandlerError {
    message: String,
}

impl HandlerError {
    /// Creates a new handler error from any displayable cause.
    pub fn new(cause: impl std::fmt::Display) -> Self {
        Self {
            message: cause.to_string(),
        }
    }
}

impl From<String> for HandlerError {
    fn from(message: String) -> Self {
        Self { message }
    }
}

impl From<&str> for HandlerError {
    fn from(message: &str) -> Self {
        Self {
            message: message.to_string(),
        }
    }
}

// =============================================================================
// Cache Errors
// =============================================================================

/// Error from the session cache collaborator.
///
/// Distinct from a cache miss: a miss is `Ok(None)` from
/// [`SessionCache::get`](crate::cache::SessionCache::get), while an error
/// means the backing store misbehaved. Callers log the error and fall through
/// to the live-fetch path; a cache error is never fatal on its own.
#[derive(Debug, Clone, Error)]
#[error("session cache error: {0}")]
pub struct CacheError(pub String);

// =============================================================================
// Result Type Aliases
// =============================================================================

/// Result type for transport operations.
pub type TransportResult<T> = Result<T, TransportError>;

/// Result type for handshake operations.
pub type HandshakeResult<T> = Result<T, HandshakeError>;

/// Result type for metadata API calls.
pub type ApiResult<T> = Result<T, ApiError>;

/// Result type for event handler stages.
pub type HandlerResult = Result<(), HandlerError>;

/// Result type for session cache operations.
pub type CacheResult<T> = Result<T, CacheError>;
