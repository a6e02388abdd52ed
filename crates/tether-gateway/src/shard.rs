//! Shard session state machine.
//!
//! One [`Shard`] owns one logical gateway session: it runs the
//! identify/resume handshake, the heartbeat loop, and the inbound read loop
//! for a single connection at a time, and tracks the resume token across
//! reconnects. It does not schedule its own retries; the session manager
//! drives `Reconnecting -> Connecting` so that all backoff policy stays in
//! one place.

use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use tether_core::{
    CloseReason, Connection, EventEnvelope, GatewayConnector, HandshakeError, HeartbeatState,
    Inbound, ResumeToken, SessionState, ShardId, TransportError,
};

use crate::protocol::{self, EVENT_READY, EVENT_RESUMED, GatewayFrame, IdentifyCredentials, Opcode};

/// How one connected session ended.
#[derive(Debug)]
pub enum SessionEnd {
    /// The transport could not be opened. The resume token, if any, is kept.
    ConnectFailed(TransportError),
    /// The handshake was rejected or malformed. The resume token has been
    /// discarded; the next attempt identifies from scratch.
    HandshakeFailed(HandshakeError),
    /// The transport closed. `after_ready` tells the supervisor whether the
    /// session got far enough to reset its attempt counter.
    Closed {
        /// Why the transport closed.
        reason: CloseReason,
        /// Whether the session reached `Ready` before closing.
        after_ready: bool,
    },
    /// Shutdown was requested; the shard is `Closed`.
    Shutdown,
}

/// One logical gateway session.
pub struct Shard {
    id: ShardId,
    credentials: Arc<IdentifyCredentials>,
    events: mpsc::Sender<EventEnvelope>,
    state: watch::Sender<SessionState>,
    resume: Option<ResumeToken>,
    last_sequence: Option<u64>,
}

impl Shard {
    /// Creates a shard that forwards envelopes into `events`.
    ///
    /// Returns the shard and a receiver observing its session state.
    pub fn new(
        id: ShardId,
        credentials: Arc<IdentifyCredentials>,
        events: mpsc::Sender<EventEnvelope>,
    ) -> (Self, watch::Receiver<SessionState>) {
        let (state, state_rx) = watch::channel(SessionState::Idle);
        (
            Self {
                id,
                credentials,
                events,
                state,
                resume: None,
                last_sequence: None,
            },
            state_rx,
        )
    }

    /// This shard's identity.
    pub fn id(&self) -> ShardId {
        self.id
    }

    /// The resume token held from the last successful handshake, if any.
    pub fn resume_token(&self) -> Option<&ResumeToken> {
        self.resume.as_ref()
    }

    /// Marks the shard terminally closed. Called by the supervisor once it
    /// stops driving reconnects.
    pub(crate) fn finalize(&self) {
        self.set_state(SessionState::Closed);
    }

    fn set_state(&self, next: SessionState) {
        self.state.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            debug!(shard = %self.id, from = %current, to = %next, "Session state change");
            *current = next;
            true
        });
    }

    fn observe_sequence(&mut self, sequence: u64) {
        self.last_sequence = Some(sequence);
        if let Some(token) = &mut self.resume {
            token.sequence = sequence;
        }
    }

    async fn forward(&self, envelope: EventEnvelope) {
        // The receiver only drops during shutdown; losing the tail is fine.
        if self.events.send(envelope).await.is_err() {
            trace!(shard = %self.id, "Event channel closed, dropping envelope");
        }
    }

    /// Runs one connected session to completion.
    ///
    /// Opens a transport, performs the handshake, then heartbeats and
    /// forwards dispatch events until the connection ends or `cancel` fires.
    /// The caller decides whether and when to call again.
    pub async fn run_session(
        &mut self,
        connector: &dyn GatewayConnector,
        url: &str,
        cancel: &CancellationToken,
    ) -> SessionEnd {
        self.set_state(SessionState::Connecting);

        let mut conn = tokio::select! {
            _ = cancel.cancelled() => {
                self.set_state(SessionState::Closed);
                return SessionEnd::Shutdown;
            }
            opened = connector.open(url) => match opened {
                Ok(conn) => conn,
                Err(e) => {
                    warn!(shard = %self.id, url = %url, error = %e, "Failed to open transport");
                    self.set_state(SessionState::Reconnecting);
                    return SessionEnd::ConnectFailed(e);
                }
            }
        };

        self.set_state(SessionState::Handshaking);
        let (heartbeat, replay) = match self.handshake(conn.as_mut(), cancel).await {
            Ok(handshake) => handshake,
            Err(end) => return end,
        };

        self.ready_loop(conn, heartbeat, replay, cancel).await
    }

    /// Receives the next decodable frame, recording sequence numbers.
    ///
    /// Returns `Err` with the final [`SessionEnd`] when the connection closes
    /// or shutdown is requested mid-wait.
    async fn next_frame(
        &mut self,
        conn: &mut dyn Connection,
        cancel: &CancellationToken,
    ) -> Result<GatewayFrame, SessionEnd> {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    conn.close().await;
                    self.set_state(SessionState::Closed);
                    return Err(SessionEnd::Shutdown);
                }
                inbound = conn.recv() => match inbound {
                    Inbound::Message(value) => match GatewayFrame::decode(value) {
                        Ok(frame) => {
                            if let Some(s) = frame.s {
                                self.observe_sequence(s);
                            }
                            return Ok(frame);
                        }
                        Err(e) => {
                            warn!(shard = %self.id, error = %e, "Discarding malformed frame");
                        }
                    },
                    Inbound::Closed(reason) => {
                        if !reason.resumable {
                            self.resume = None;
                        }
                        self.set_state(SessionState::Reconnecting);
                        return Err(SessionEnd::Closed {
                            reason,
                            after_ready: false,
                        });
                    }
                }
            }
        }
    }

    /// Fails the handshake, discarding the resume token per the error
    /// contract: a rejected or malformed handshake always re-identifies.
    async fn fail_handshake(
        &mut self,
        conn: &mut dyn Connection,
        error: HandshakeError,
    ) -> SessionEnd {
        warn!(shard = %self.id, error = %error, "Handshake failed");
        self.resume = None;
        conn.close().await;
        self.set_state(SessionState::Reconnecting);
        SessionEnd::HandshakeFailed(error)
    }

    /// Runs the identify/resume handshake.
    ///
    /// On success returns the negotiated heartbeat state plus any dispatch
    /// events that arrived before the acknowledgment (resume replay); the
    /// caller flushes them once the shard is `Ready`.
    async fn handshake(
        &mut self,
        conn: &mut dyn Connection,
        cancel: &CancellationToken,
    ) -> Result<(HeartbeatState, Vec<EventEnvelope>), SessionEnd> {
        // First frame on any connection must be the hello.
        let hello = self.next_frame(conn, cancel).await?;
        if hello.opcode() != Some(Opcode::Hello) {
            let error = HandshakeError::UnexpectedFrame {
                expected: "hello",
                got: format!("op {}", hello.op),
            };
            return Err(self.fail_handshake(conn, error).await);
        }
        let interval = match protocol::hello_interval(&hello.d) {
            Ok(interval) => interval,
            Err(e) => return Err(self.fail_handshake(conn, e).await),
        };

        let mut heartbeat = HeartbeatState::new(interval, self.last_sequence);
        let mut resuming = self.resume.is_some();

        let opening = match &self.resume {
            Some(token) => {
                info!(shard = %self.id, sequence = token.sequence, "Resuming session");
                protocol::resume(&self.credentials.token, token)
            }
            None => {
                info!(shard = %self.id, "Identifying new session");
                protocol::identify(&self.credentials, self.id)
            }
        };
        if let Err(e) = conn.send(opening).await {
            conn.close().await;
            self.set_state(SessionState::Reconnecting);
            return Err(SessionEnd::Closed {
                reason: CloseReason::abnormal(e.to_string()),
                after_ready: false,
            });
        }

        // Await the acknowledgment, buffering replayed events for delivery
        // once the shard is Ready.
        let mut replay = Vec::new();
        loop {
            let frame = self.next_frame(conn, cancel).await?;
            match frame.opcode() {
                Some(Opcode::Dispatch) => {
                    let name = frame.t.clone().unwrap_or_default();
                    if resuming && name == EVENT_RESUMED {
                        info!(shard = %self.id, replayed = replay.len(), "Session resumed");
                        replay.push(EventEnvelope::new(name, frame.s, frame.d));
                        return Ok((heartbeat, replay));
                    }
                    if !resuming && name == EVENT_READY {
                        let session_id = match protocol::ready_session_id(&frame.d) {
                            Ok(id) => id,
                            Err(e) => return Err(self.fail_handshake(conn, e).await),
                        };
                        self.resume = Some(ResumeToken {
                            session_id,
                            sequence: frame.s.or(self.last_sequence).unwrap_or(0),
                        });
                        replay.push(EventEnvelope::new(name, frame.s, frame.d));
                        return Ok((heartbeat, replay));
                    }
                    replay.push(EventEnvelope::new(name, frame.s, frame.d));
                }
                Some(Opcode::Heartbeat) => {
                    if let Err(e) = conn.send(protocol::heartbeat(heartbeat.sequence)).await {
                        conn.close().await;
                        self.set_state(SessionState::Reconnecting);
                        return Err(SessionEnd::Closed {
                            reason: CloseReason::abnormal(e.to_string()),
                            after_ready: false,
                        });
                    }
                    heartbeat.mark_sent();
                }
                Some(Opcode::HeartbeatAck) => heartbeat.mark_acked(),
                Some(Opcode::InvalidSession) => {
                    if resuming && !protocol::invalid_session_resumable(&frame.d) {
                        // Resume rejected outright: identify on this same
                        // connection instead of burning a reconnect cycle.
                        info!(shard = %self.id, "Resume rejected, identifying instead");
                        self.resume = None;
                        resuming = false;
                        if let Err(e) = conn.send(protocol::identify(&self.credentials, self.id)).await
                        {
                            conn.close().await;
                            self.set_state(SessionState::Reconnecting);
                            return Err(SessionEnd::Closed {
                                reason: CloseReason::abnormal(e.to_string()),
                                after_ready: false,
                            });
                        }
                    } else if resuming {
                        // Resumable later, just not on this connection.
                        conn.close().await;
                        self.set_state(SessionState::Reconnecting);
                        return Err(SessionEnd::Closed {
                            reason: CloseReason {
                                code: None,
                                reason: "session invalidated".to_string(),
                                resumable: true,
                            },
                            after_ready: false,
                        });
                    } else {
                        let error = HandshakeError::Rejected {
                            reason: "identify rejected by gateway".to_string(),
                        };
                        return Err(self.fail_handshake(conn, error).await);
                    }
                }
                Some(Opcode::Reconnect) => {
                    conn.close().await;
                    self.set_state(SessionState::Reconnecting);
                    return Err(SessionEnd::Closed {
                        reason: CloseReason {
                            code: None,
                            reason: "server requested reconnect".to_string(),
                            resumable: true,
                        },
                        after_ready: false,
                    });
                }
                _ => trace!(shard = %self.id, op = frame.op, "Ignoring frame during handshake"),
            }
        }
    }

    /// The ready loop: strictly periodic heartbeats plus inbound dispatch.
    async fn ready_loop(
        &mut self,
        mut conn: Box<dyn Connection>,
        mut heartbeat: HeartbeatState,
        replay: Vec<EventEnvelope>,
        cancel: &CancellationToken,
    ) -> SessionEnd {
        self.set_state(SessionState::Ready);
        info!(shard = %self.id, interval = ?heartbeat.interval, "Shard ready");

        for envelope in replay {
            self.forward(envelope).await;
        }

        // Heartbeats are periodic relative to the negotiated interval, not
        // to message arrival.
        let mut ticker = time::interval_at(Instant::now() + heartbeat.interval, heartbeat.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    conn.close().await;
                    self.set_state(SessionState::Closed);
                    return SessionEnd::Shutdown;
                }
                _ = ticker.tick() => {
                    if heartbeat.is_stalled() {
                        // Zombie connection: the previous heartbeat was never
                        // acknowledged. Undetected, a stalled transport would
                        // silently drop all future events.
                        warn!(shard = %self.id, "Heartbeat ack overdue, force-closing stalled connection");
                        conn.close().await;
                        self.set_state(SessionState::Reconnecting);
                        return SessionEnd::Closed {
                            reason: CloseReason::stalled(),
                            after_ready: true,
                        };
                    }
                    if let Err(e) = conn.send(protocol::heartbeat(heartbeat.sequence)).await {
                        warn!(shard = %self.id, error = %e, "Heartbeat send failed");
                        conn.close().await;
                        self.set_state(SessionState::Reconnecting);
                        return SessionEnd::Closed {
                            reason: CloseReason::abnormal(e.to_string()),
                            after_ready: true,
                        };
                    }
                    heartbeat.mark_sent();
                    trace!(shard = %self.id, sequence = ?heartbeat.sequence, "Heartbeat sent");
                }
                inbound = conn.recv() => match inbound {
                    Inbound::Message(value) => {
                        let frame = match GatewayFrame::decode(value) {
                            Ok(frame) => frame,
                            Err(e) => {
                                warn!(shard = %self.id, error = %e, "Discarding malformed frame");
                                continue;
                            }
                        };
                        if let Some(s) = frame.s {
                            self.observe_sequence(s);
                            heartbeat.observe_sequence(s);
                        }
                        match frame.opcode() {
                            Some(Opcode::Dispatch) => {
                                let name = frame.t.unwrap_or_default();
                                self.forward(EventEnvelope::new(name, frame.s, frame.d)).await;
                            }
                            Some(Opcode::HeartbeatAck) => heartbeat.mark_acked(),
                            Some(Opcode::Heartbeat) => {
                                // Server requested an immediate heartbeat.
                                if let Err(e) = conn.send(protocol::heartbeat(heartbeat.sequence)).await {
                                    warn!(shard = %self.id, error = %e, "Heartbeat send failed");
                                    conn.close().await;
                                    self.set_state(SessionState::Reconnecting);
                                    return SessionEnd::Closed {
                                        reason: CloseReason::abnormal(e.to_string()),
                                        after_ready: true,
                                    };
                                }
                                heartbeat.mark_sent();
                            }
                            Some(Opcode::Reconnect) => {
                                info!(shard = %self.id, "Server requested reconnect");
                                conn.close().await;
                                self.set_state(SessionState::Reconnecting);
                                return SessionEnd::Closed {
                                    reason: CloseReason {
                                        code: None,
                                        reason: "server requested reconnect".to_string(),
                                        resumable: true,
                                    },
                                    after_ready: true,
                                };
                            }
                            Some(Opcode::InvalidSession) => {
                                let resumable = protocol::invalid_session_resumable(&frame.d);
                                info!(shard = %self.id, resumable, "Session invalidated by server");
                                if !resumable {
                                    self.resume = None;
                                }
                                conn.close().await;
                                self.set_state(SessionState::Reconnecting);
                                return SessionEnd::Closed {
                                    reason: CloseReason {
                                        code: None,
                                        reason: "session invalidated".to_string(),
                                        resumable,
                                    },
                                    after_ready: true,
                                };
                            }
                            Some(_) => {}
                            None => trace!(shard = %self.id, op = frame.op, "Ignoring unknown opcode"),
                        }
                    }
                    Inbound::Closed(reason) => {
                        info!(shard = %self.id, reason = %reason, resumable = reason.resumable, "Transport closed");
                        if !reason.resumable {
                            self.resume = None;
                        }
                        self.set_state(SessionState::Reconnecting);
                        return SessionEnd::Closed {
                            reason,
                            after_ready: true,
                        };
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testkit::MockGateway;
    use serde_json::json;
    use std::time::Duration;
    use tokio::task::JoinHandle;

    fn new_shard(
        events: mpsc::Sender<EventEnvelope>,
    ) -> (Shard, watch::Receiver<SessionState>) {
        Shard::new(
            ShardId::new(0, 1),
            Arc::new(IdentifyCredentials::new("token", 0)),
            events,
        )
    }

    fn spawn_session(
        mut shard: Shard,
        gateway: Arc<MockGateway>,
        cancel: CancellationToken,
    ) -> JoinHandle<(Shard, SessionEnd)> {
        tokio::spawn(async move {
            let end = shard
                .run_session(gateway.as_ref(), "wss://gateway.test", &cancel)
                .await;
            (shard, end)
        })
    }

    #[tokio::test(start_paused = true)]
    async fn identify_then_ready_then_events_in_order() {
        let gateway = Arc::new(MockGateway::new());
        let (events_tx, mut events_rx) = mpsc::channel(16);
        let (shard, mut state_rx) = new_shard(events_tx);
        let cancel = CancellationToken::new();

        let task = spawn_session(shard, Arc::clone(&gateway), cancel.clone());
        state_rx
            .wait_for(|s| *s == SessionState::Ready)
            .await
            .unwrap();

        // The READY dispatch itself is forwarded once the shard is Ready.
        let ready = events_rx.recv().await.unwrap();
        assert_eq!(ready.event_type, EVENT_READY);

        let handle = gateway.handle(0);
        assert_eq!(handle.sent_ops(), vec![2], "fresh session must identify");

        for seq in 2..7 {
            handle.push_event("MESSAGE_CREATE", seq, json!({"n": seq}));
        }
        for seq in 2..7 {
            let envelope = events_rx.recv().await.unwrap();
            assert_eq!(envelope.event_type, "MESSAGE_CREATE");
            assert_eq!(envelope.sequence, Some(seq));
        }

        cancel.cancel();
        let (shard, end) = task.await.unwrap();
        assert!(matches!(end, SessionEnd::Shutdown));
        assert!(shard.resume_token().is_some());
        assert_eq!(*state_rx.borrow(), SessionState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn unacked_heartbeat_forces_reconnect_within_one_interval() {
        let gateway = Arc::new(MockGateway::new().heartbeat_interval_ms(30_000).auto_ack(false));
        let (events_tx, _events_rx) = mpsc::channel(16);
        let (shard, mut state_rx) = new_shard(events_tx);
        let cancel = CancellationToken::new();

        let task = spawn_session(shard, Arc::clone(&gateway), cancel.clone());
        state_rx
            .wait_for(|s| *s == SessionState::Ready)
            .await
            .unwrap();
        let ready_at = Instant::now();

        state_rx
            .wait_for(|s| *s == SessionState::Reconnecting)
            .await
            .unwrap();

        // First heartbeat at +30s goes unacknowledged; the stall is detected
        // at the next tick, +60s.
        let elapsed = ready_at.elapsed();
        assert!(elapsed <= Duration::from_secs(61), "stall detected too late: {elapsed:?}");

        let (_, end) = task.await.unwrap();
        match end {
            SessionEnd::Closed { reason, after_ready } => {
                assert!(reason.resumable);
                assert!(after_ready);
            }
            other => panic!("expected Closed, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn resumable_close_leads_to_resume_with_prior_sequence() {
        let gateway = Arc::new(MockGateway::new());
        let (events_tx, mut events_rx) = mpsc::channel(16);
        let (shard, mut state_rx) = new_shard(events_tx);
        let cancel = CancellationToken::new();

        let task = spawn_session(shard, Arc::clone(&gateway), cancel.clone());
        state_rx
            .wait_for(|s| *s == SessionState::Ready)
            .await
            .unwrap();

        let handle = gateway.handle(0);
        handle.push_event("MESSAGE_CREATE", 5, json!({}));
        // Drain READY plus the event so the sequence is observed.
        while events_rx.recv().await.unwrap().sequence != Some(5) {}

        handle.close(CloseReason::from_code(4000, "unknown error"));
        let (shard, end) = task.await.unwrap();
        assert!(matches!(end, SessionEnd::Closed { ref reason, .. } if reason.resumable));
        assert_eq!(*state_rx.borrow(), SessionState::Reconnecting);

        // Next session must resume, carrying the prior token's sequence.
        let task = spawn_session(shard, Arc::clone(&gateway), cancel.clone());
        state_rx
            .wait_for(|s| *s == SessionState::Ready)
            .await
            .unwrap();

        let handle = gateway.handle(1);
        let sent = handle.sent();
        assert_eq!(sent[0]["op"], 6, "reconnect after resumable close must resume");
        assert_eq!(sent[0]["d"]["seq"], 5);
        assert_eq!(sent[0]["d"]["session_id"], "session-0");

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn non_resumable_close_discards_token_and_identifies() {
        let gateway = Arc::new(MockGateway::new());
        let (events_tx, _events_rx) = mpsc::channel(16);
        let (shard, mut state_rx) = new_shard(events_tx);
        let cancel = CancellationToken::new();

        let task = spawn_session(shard, Arc::clone(&gateway), cancel.clone());
        state_rx
            .wait_for(|s| *s == SessionState::Ready)
            .await
            .unwrap();

        gateway
            .handle(0)
            .close(CloseReason::from_code(4004, "authentication failed"));
        let (shard, end) = task.await.unwrap();
        assert!(matches!(end, SessionEnd::Closed { ref reason, .. } if !reason.resumable));
        assert!(shard.resume_token().is_none(), "token must be discarded");

        let task = spawn_session(shard, Arc::clone(&gateway), cancel.clone());
        state_rx
            .wait_for(|s| *s == SessionState::Ready)
            .await
            .unwrap();

        assert_eq!(
            gateway.handle(1).sent_ops()[0],
            2,
            "non-resumable close must re-identify"
        );

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn rejected_resume_identifies_on_same_connection() {
        let gateway = Arc::new(MockGateway::new());
        let (events_tx, mut events_rx) = mpsc::channel(16);
        let (shard, mut state_rx) = new_shard(events_tx);
        let cancel = CancellationToken::new();

        // Establish a session, observe a sequence, then lose it resumably.
        let task = spawn_session(shard, Arc::clone(&gateway), cancel.clone());
        state_rx
            .wait_for(|s| *s == SessionState::Ready)
            .await
            .unwrap();
        let handle = gateway.handle(0);
        handle.push_event("MESSAGE_CREATE", 3, json!({}));
        while events_rx.recv().await.unwrap().sequence != Some(3) {}
        handle.close(CloseReason::from_code(4000, "unknown error"));
        let (shard, _) = task.await.unwrap();

        // The gateway now declares the session non-resumable mid-handshake.
        gateway.reject_resume(true);
        let task = spawn_session(shard, Arc::clone(&gateway), cancel.clone());
        state_rx
            .wait_for(|s| *s == SessionState::Ready)
            .await
            .unwrap();

        let handle = gateway.handle(1);
        assert_eq!(
            handle.sent_ops(),
            vec![6, 2],
            "identify must follow the rejected resume on the same connection"
        );

        cancel.cancel();
        let (shard, _) = task.await.unwrap();
        // The fresh identify established a brand-new session.
        assert_eq!(shard.resume_token().unwrap().session_id, "session-1");
    }

    #[tokio::test(start_paused = true)]
    async fn open_failure_keeps_resume_token() {
        let gateway = Arc::new(MockGateway::new());
        let (events_tx, _events_rx) = mpsc::channel(16);
        let (shard, mut state_rx) = new_shard(events_tx);
        let cancel = CancellationToken::new();

        let task = spawn_session(shard, Arc::clone(&gateway), cancel.clone());
        state_rx
            .wait_for(|s| *s == SessionState::Ready)
            .await
            .unwrap();
        gateway.handle(0).close(CloseReason::from_code(4000, ""));
        let (mut shard, _) = task.await.unwrap();
        assert!(shard.resume_token().is_some());

        gateway.fail_next_opens(1);
        let end = shard
            .run_session(gateway.as_ref(), "wss://gateway.test", &cancel)
            .await;
        assert!(matches!(end, SessionEnd::ConnectFailed(_)));
        assert!(
            shard.resume_token().is_some(),
            "a failed open must not invalidate the session"
        );
    }
}
