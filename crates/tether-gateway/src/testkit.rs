//! Scripted gateway and collaborator mocks for state-machine tests.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::sync::mpsc;

use tether_core::{
    ApiError, ApiResult, CacheError, CacheResult, CloseReason, Connection, ConnectionMetadata,
    GatewayConnector, Inbound, MetadataApi, SessionCache, TransportError, TransportResult,
};

/// A scripted gateway endpoint.
///
/// By default it plays the happy path by itself: hello on connect, ready (or
/// resumed) in response to the handshake, and an ack for every heartbeat.
/// Tests flip the knobs to script failures, and use per-connection
/// [`MockHandle`]s to inject events and closes and to inspect sent frames.
pub struct MockGateway {
    hello_interval_ms: u64,
    auto_handshake: bool,
    auto_ack: AtomicBool,
    reject_resume: AtomicBool,
    fail_opens: AtomicUsize,
    opens: AtomicUsize,
    sessions: Arc<AtomicUsize>,
    handles: Mutex<Vec<MockHandle>>,
}

impl Default for MockGateway {
    fn default() -> Self {
        Self {
            hello_interval_ms: 45_000,
            auto_handshake: true,
            auto_ack: AtomicBool::new(true),
            reject_resume: AtomicBool::new(false),
            fail_opens: AtomicUsize::new(0),
            opens: AtomicUsize::new(0),
            sessions: Arc::new(AtomicUsize::new(0)),
            handles: Mutex::new(Vec::new()),
        }
    }
}

impl MockGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the heartbeat interval advertised in the hello frame.
    pub fn heartbeat_interval_ms(mut self, ms: u64) -> Self {
        self.hello_interval_ms = ms;
        self
    }

    /// Controls whether heartbeats are acknowledged automatically.
    pub fn auto_ack(self, enabled: bool) -> Self {
        self.auto_ack.store(enabled, Ordering::SeqCst);
        self
    }

    /// Makes the gateway reject resume attempts with a non-resumable
    /// invalid-session frame.
    pub fn reject_resume(&self, enabled: bool) {
        self.reject_resume.store(enabled, Ordering::SeqCst);
    }

    /// Fails the next `n` open attempts.
    pub fn fail_next_opens(&self, n: usize) {
        self.fail_opens.store(n, Ordering::SeqCst);
    }

    /// Total successful opens so far.
    pub fn open_count(&self) -> usize {
        self.handles.lock().len()
    }

    /// Total open attempts, including failed ones.
    pub fn attempt_count(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    /// The handle for the `index`-th successful connection.
    pub fn handle(&self, index: usize) -> MockHandle {
        self.handles.lock()[index].clone()
    }
}

#[async_trait]
impl GatewayConnector for MockGateway {
    async fn open(&self, url: &str) -> TransportResult<Box<dyn Connection>> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        if self
            .fail_opens
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(TransportError::ConnectFailed {
                url: url.to_string(),
                reason: "scripted open failure".to_string(),
            });
        }

        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let handle = MockHandle {
            sent: Arc::new(Mutex::new(Vec::new())),
            inbound: inbound_tx,
        };
        handle.push_frame(json!({
            "op": 10,
            "d": { "heartbeat_interval": self.hello_interval_ms },
        }));
        self.handles.lock().push(handle.clone());

        Ok(Box::new(MockConnection {
            handle,
            rx: inbound_rx,
            auto_handshake: self.auto_handshake,
            auto_ack: self.auto_ack.load(Ordering::SeqCst),
            reject_resume: self.reject_resume.load(Ordering::SeqCst),
            sessions: Arc::clone(&self.sessions),
            closed: None,
        }))
    }
}

/// Test-side handle to one mock connection.
#[derive(Clone)]
pub struct MockHandle {
    sent: Arc<Mutex<Vec<Value>>>,
    inbound: mpsc::UnboundedSender<Inbound>,
}

impl MockHandle {
    /// Injects a raw inbound frame.
    pub fn push_frame(&self, frame: Value) {
        let _ = self.inbound.send(Inbound::Message(frame));
    }

    /// Injects a dispatch event.
    pub fn push_event(&self, event_type: &str, sequence: u64, payload: Value) {
        self.push_frame(json!({
            "op": 0,
            "t": event_type,
            "s": sequence,
            "d": payload,
        }));
    }

    /// Closes the connection from the server side.
    pub fn close(&self, reason: CloseReason) {
        let _ = self.inbound.send(Inbound::Closed(reason));
    }

    /// Frames the client sent on this connection.
    pub fn sent(&self) -> Vec<Value> {
        self.sent.lock().clone()
    }

    /// Opcodes the client sent on this connection, in order.
    pub fn sent_ops(&self) -> Vec<u8> {
        self.sent
            .lock()
            .iter()
            .filter_map(|v| v["op"].as_u64().map(|op| op as u8))
            .collect()
    }
}

struct MockConnection {
    handle: MockHandle,
    rx: mpsc::UnboundedReceiver<Inbound>,
    auto_handshake: bool,
    auto_ack: bool,
    reject_resume: bool,
    sessions: Arc<AtomicUsize>,
    closed: Option<CloseReason>,
}

#[async_trait]
impl Connection for MockConnection {
    async fn send(&mut self, message: Value) -> TransportResult<()> {
        if self.closed.is_some() {
            return Err(TransportError::NotOpen);
        }
        let op = message["op"].as_u64();
        self.handle.sent.lock().push(message);

        match op {
            Some(1) if self.auto_ack => {
                self.handle.push_frame(json!({ "op": 11 }));
            }
            Some(2) if self.auto_handshake => {
                let n = self.sessions.fetch_add(1, Ordering::SeqCst);
                self.handle.push_frame(json!({
                    "op": 0,
                    "t": "READY",
                    "s": 1,
                    "d": { "session_id": format!("session-{n}") },
                }));
            }
            Some(6) if self.reject_resume => {
                self.handle.push_frame(json!({ "op": 9, "d": false }));
            }
            Some(6) if self.auto_handshake => {
                self.handle.push_frame(json!({ "op": 0, "t": "RESUMED", "d": null }));
            }
            _ => {}
        }
        Ok(())
    }

    async fn recv(&mut self) -> Inbound {
        if let Some(reason) = &self.closed {
            return Inbound::Closed(reason.clone());
        }
        // The connection holds its own sender, so `recv` pends (rather than
        // ending) when the script runs dry, which is what lets paused-clock
        // tests drive the heartbeat timer.
        match self.rx.recv().await {
            Some(Inbound::Closed(reason)) => {
                self.closed = Some(reason.clone());
                Inbound::Closed(reason)
            }
            Some(inbound) => inbound,
            None => {
                let reason = CloseReason::abnormal("script ended");
                self.closed = Some(reason.clone());
                Inbound::Closed(reason)
            }
        }
    }

    async fn close(&mut self) {
        if self.closed.is_none() {
            self.closed = Some(CloseReason::abnormal("closed by client"));
        }
    }
}

/// Scripted metadata API.
pub struct MockApi {
    responses: Mutex<VecDeque<ApiResult<ConnectionMetadata>>>,
    fallback: Option<ConnectionMetadata>,
    calls: AtomicUsize,
}

impl MockApi {
    /// Always returns the given metadata.
    pub fn always(metadata: ConnectionMetadata) -> Self {
        Self {
            responses: Mutex::new(VecDeque::new()),
            fallback: Some(metadata),
            calls: AtomicUsize::new(0),
        }
    }

    /// Plays the scripted responses in order, then errors.
    pub fn sequence(responses: Vec<ApiResult<ConnectionMetadata>>) -> Self {
        Self {
            responses: Mutex::new(responses.into()),
            fallback: None,
            calls: AtomicUsize::new(0),
        }
    }

    /// Always fails.
    pub fn failing() -> Self {
        Self::sequence(Vec::new())
    }

    /// How many fetches were made.
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MetadataApi for MockApi {
    async fn fetch_connection_metadata(&self) -> ApiResult<ConnectionMetadata> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(response) = self.responses.lock().pop_front() {
            return response;
        }
        match &self.fallback {
            Some(metadata) => Ok(metadata.clone()),
            None => Err(ApiError::Request("scripted responses exhausted".into())),
        }
    }
}

/// A cache whose backing store is broken. Errors must be treated as misses.
pub struct FailingCache;

#[async_trait]
impl SessionCache for FailingCache {
    async fn get(&self) -> CacheResult<Option<ConnectionMetadata>> {
        Err(CacheError("backing store unreachable".into()))
    }

    async fn set(
        &self,
        _metadata: ConnectionMetadata,
        _ttl: std::time::Duration,
    ) -> CacheResult<()> {
        Err(CacheError("backing store unreachable".into()))
    }
}
