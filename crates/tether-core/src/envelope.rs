//! Event envelopes produced by shards and consumed by the dispatch pipeline.

use serde_json::Value;

/// One inbound gateway event, ready for dispatch.
///
/// Produced by a shard from one inbound transport message and consumed
/// exactly once by the dispatch pipeline. Never persisted.
#[derive(Debug, Clone)]
pub struct EventEnvelope {
    /// Upstream event type name (e.g. `MESSAGE_CREATE`).
    pub event_type: String,
    /// Sequence number carried by the frame, if any.
    pub sequence: Option<u64>,
    /// Opaque event payload. Handler stages decode what they need.
    pub payload: Value,
}

impl EventEnvelope {
    /// Creates an envelope.
    pub fn new(event_type: impl Into<String>, sequence: Option<u64>, payload: Value) -> Self {
        Self {
            event_type: event_type.into(),
            sequence,
            payload,
        }
    }
}
