//! Gateway wire protocol.
//!
//! Only the slice of the protocol the session state machine needs lives
//! here: frame envelope, control opcodes, and the identify/resume/heartbeat
//! payloads. Event payloads stay opaque `serde_json::Value`s all the way to
//! the dispatch pipeline.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::time::Duration;

use tether_core::{HandshakeError, HandshakeResult, ResumeToken, ShardId};

/// Dispatch event name acknowledging a fresh identify.
pub const EVENT_READY: &str = "READY";

/// Dispatch event name acknowledging a resume.
pub const EVENT_RESUMED: &str = "RESUMED";

/// Control opcodes understood by the session state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    /// An application event, named by the frame's `t` field.
    Dispatch,
    /// Heartbeat (client-sent, or a server request for an immediate one).
    Heartbeat,
    /// Start a brand-new session.
    Identify,
    /// Re-attach to a prior session, replaying missed events by sequence.
    Resume,
    /// Server asks the client to disconnect and resume.
    Reconnect,
    /// Server declares the session invalid; `d` says whether it is resumable.
    InvalidSession,
    /// First frame on any connection; carries the heartbeat interval.
    Hello,
    /// Acknowledges a client heartbeat.
    HeartbeatAck,
}

impl Opcode {
    /// Decodes a wire opcode. Unknown opcodes return `None` and are ignored
    /// by the state machine (forward compatibility).
    pub fn from_wire(op: u8) -> Option<Self> {
        Some(match op {
            0 => Self::Dispatch,
            1 => Self::Heartbeat,
            2 => Self::Identify,
            6 => Self::Resume,
            7 => Self::Reconnect,
            9 => Self::InvalidSession,
            10 => Self::Hello,
            11 => Self::HeartbeatAck,
            _ => return None,
        })
    }

    /// Encodes to the wire opcode.
    pub fn to_wire(self) -> u8 {
        match self {
            Self::Dispatch => 0,
            Self::Heartbeat => 1,
            Self::Identify => 2,
            Self::Resume => 6,
            Self::Reconnect => 7,
            Self::InvalidSession => 9,
            Self::Hello => 10,
            Self::HeartbeatAck => 11,
        }
    }
}

/// The frame envelope every gateway message uses.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayFrame {
    /// Opcode.
    pub op: u8,
    /// Opcode-specific payload.
    #[serde(default)]
    pub d: Value,
    /// Sequence number, present on dispatch frames.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub s: Option<u64>,
    /// Dispatch event name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub t: Option<String>,
}

impl GatewayFrame {
    /// Decodes a raw transport message into a frame.
    pub fn decode(message: Value) -> HandshakeResult<Self> {
        serde_json::from_value(message).map_err(|e| HandshakeError::Malformed(e.to_string()))
    }

    /// The decoded opcode, if recognized.
    pub fn opcode(&self) -> Option<Opcode> {
        Opcode::from_wire(self.op)
    }
}

/// Credentials and identity the client presents when identifying.
#[derive(Clone, Serialize, Deserialize)]
pub struct IdentifyCredentials {
    /// Application token.
    pub token: String,
    /// Event intents bitfield.
    pub intents: u64,
    /// Connection properties reported to the service.
    #[serde(default)]
    pub properties: ConnectionProperties,
}

impl IdentifyCredentials {
    /// Creates credentials with default connection properties.
    pub fn new(token: impl Into<String>, intents: u64) -> Self {
        Self {
            token: token.into(),
            intents,
            properties: ConnectionProperties::default(),
        }
    }
}

impl std::fmt::Debug for IdentifyCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdentifyCredentials")
            .field("token", &"<redacted>")
            .field("intents", &self.intents)
            .finish()
    }
}

/// Client properties sent with an identify.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionProperties {
    /// Operating system name.
    pub os: String,
    /// Library name, reported twice per the upstream convention.
    pub browser: String,
    /// Device name.
    pub device: String,
}

impl Default for ConnectionProperties {
    fn default() -> Self {
        Self {
            os: std::env::consts::OS.to_string(),
            browser: "tether".to_string(),
            device: "tether".to_string(),
        }
    }
}

/// Builds a heartbeat frame carrying the last-seen sequence number.
pub fn heartbeat(sequence: Option<u64>) -> Value {
    json!({
        "op": Opcode::Heartbeat.to_wire(),
        "d": sequence,
    })
}

/// Builds an identify frame for a fresh session.
pub fn identify(credentials: &IdentifyCredentials, shard: ShardId) -> Value {
    json!({
        "op": Opcode::Identify.to_wire(),
        "d": {
            "token": credentials.token,
            "intents": credentials.intents,
            "properties": credentials.properties,
            "shard": [shard.index, shard.total],
        },
    })
}

/// Builds a resume frame re-attaching to a prior session.
pub fn resume(token: &str, resume_token: &ResumeToken) -> Value {
    json!({
        "op": Opcode::Resume.to_wire(),
        "d": {
            "token": token,
            "session_id": resume_token.session_id,
            "seq": resume_token.sequence,
        },
    })
}

/// Extracts the heartbeat interval from a hello frame's payload.
pub fn hello_interval(d: &Value) -> HandshakeResult<Duration> {
    d.get("heartbeat_interval")
        .and_then(Value::as_u64)
        .map(Duration::from_millis)
        .ok_or_else(|| HandshakeError::Malformed("hello frame missing heartbeat_interval".into()))
}

/// Extracts the session id from a ready dispatch payload.
pub fn ready_session_id(d: &Value) -> HandshakeResult<String> {
    d.get("session_id")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| HandshakeError::Malformed("ready frame missing session_id".into()))
}

/// Whether an invalid-session payload permits resuming.
pub fn invalid_session_resumable(d: &Value) -> bool {
    d.as_bool().unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opcodes_round_trip() {
        for op in [
            Opcode::Dispatch,
            Opcode::Heartbeat,
            Opcode::Identify,
            Opcode::Resume,
            Opcode::Reconnect,
            Opcode::InvalidSession,
            Opcode::Hello,
            Opcode::HeartbeatAck,
        ] {
            assert_eq!(Opcode::from_wire(op.to_wire()), Some(op));
        }
        assert_eq!(Opcode::from_wire(42), None);
    }

    #[test]
    fn decodes_dispatch_frame() {
        let frame = GatewayFrame::decode(json!({
            "op": 0,
            "t": "MESSAGE_CREATE",
            "s": 42,
            "d": {"content": "hi"},
        }))
        .unwrap();
        assert_eq!(frame.opcode(), Some(Opcode::Dispatch));
        assert_eq!(frame.s, Some(42));
        assert_eq!(frame.t.as_deref(), Some("MESSAGE_CREATE"));
    }

    #[test]
    fn identify_carries_shard_and_intents() {
        let credentials = IdentifyCredentials::new("secret", 513);
        let frame = identify(&credentials, ShardId::new(2, 4));
        assert_eq!(frame["op"], 2);
        assert_eq!(frame["d"]["shard"], json!([2, 4]));
        assert_eq!(frame["d"]["intents"], 513);
    }

    #[test]
    fn resume_carries_prior_sequence() {
        let token = ResumeToken {
            session_id: "abc".into(),
            sequence: 117,
        };
        let frame = resume("secret", &token);
        assert_eq!(frame["op"], 6);
        assert_eq!(frame["d"]["session_id"], "abc");
        assert_eq!(frame["d"]["seq"], 117);
    }

    #[test]
    fn hello_interval_requires_field() {
        assert_eq!(
            hello_interval(&json!({"heartbeat_interval": 41250})).unwrap(),
            Duration::from_millis(41250)
        );
        assert!(hello_interval(&json!({})).is_err());
    }

    #[test]
    fn debug_output_redacts_token() {
        let credentials = IdentifyCredentials::new("secret", 0);
        let formatted = format!("{credentials:?}");
        assert!(!formatted.contains("secret"));
    }
}
