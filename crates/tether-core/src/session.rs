//! Per-shard session state types.

use std::time::Duration;

use tokio::time::Instant;

/// Identity of one shard within the fleet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ShardId {
    /// Zero-based shard index.
    pub index: u32,
    /// Total number of shards in the fleet.
    pub total: u32,
}

impl ShardId {
    /// Creates a shard id.
    pub fn new(index: u32, total: u32) -> Self {
        Self { index, total }
    }

    /// Identify bucket under the given concurrency limit.
    ///
    /// Shards in the same bucket must not identify concurrently; buckets are
    /// started in waves by the session manager.
    pub fn identify_bucket(&self, max_concurrency: u32) -> u32 {
        self.index / max_concurrency.max(1)
    }
}

impl std::fmt::Display for ShardId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.index, self.total)
    }
}

/// Lifecycle state of one shard's session.
///
/// Mutated solely by the shard's own control loop and published through a
/// `watch` channel; `Ready` is the only state in which business events are
/// dispatched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionState {
    /// Not yet started.
    #[default]
    Idle,
    /// Opening the transport.
    Connecting,
    /// Transport open, identify/resume in flight.
    Handshaking,
    /// Session established; events flow.
    Ready,
    /// Transport lost; waiting for the session manager to schedule a retry.
    Reconnecting,
    /// Terminal. Reached only via explicit shutdown.
    Closed,
}

impl SessionState {
    /// Whether the state is terminal.
    pub fn is_closed(&self) -> bool {
        matches!(self, Self::Closed)
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Connecting => write!(f, "connecting"),
            Self::Handshaking => write!(f, "handshaking"),
            Self::Ready => write!(f, "ready"),
            Self::Reconnecting => write!(f, "reconnecting"),
            Self::Closed => write!(f, "closed"),
        }
    }
}

/// Token required to resume a previous session instead of identifying anew.
///
/// Present only after a successful handshake. Discarded when the gateway
/// signals the session is not resumable, which forces a full re-identify.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResumeToken {
    /// Session id assigned by the gateway.
    pub session_id: String,
    /// Last sequence number observed before the connection was lost.
    pub sequence: u64,
}

/// Heartbeat bookkeeping for one connected session.
///
/// Owned and mutated exclusively by the shard that created it; dropped when
/// the shard's transport closes.
#[derive(Debug)]
pub struct HeartbeatState {
    /// Interval negotiated in the handshake.
    pub interval: Duration,
    /// Whether the previous heartbeat has been acknowledged.
    pub acked: bool,
    /// When the last heartbeat was sent.
    pub last_sent: Option<Instant>,
    /// Last sequence number seen on any inbound frame.
    pub sequence: Option<u64>,
}

impl HeartbeatState {
    /// Creates fresh heartbeat state for a negotiated interval.
    ///
    /// `sequence` carries over from a previous session when resuming, so the
    /// first heartbeat after a resume reports the right replay position.
    pub fn new(interval: Duration, sequence: Option<u64>) -> Self {
        Self {
            interval,
            acked: true,
            last_sent: None,
            sequence,
        }
    }

    /// Records an observed sequence number.
    pub fn observe_sequence(&mut self, seq: u64) {
        self.sequence = Some(seq);
    }

    /// Marks a heartbeat as sent and un-acknowledged.
    pub fn mark_sent(&mut self) {
        self.acked = false;
        self.last_sent = Some(Instant::now());
    }

    /// Marks the outstanding heartbeat as acknowledged.
    pub fn mark_acked(&mut self) {
        self.acked = true;
    }

    /// True when the previous heartbeat was never acknowledged before the
    /// next one came due: the zombie-connection signal.
    pub fn is_stalled(&self) -> bool {
        !self.acked
    }
}
