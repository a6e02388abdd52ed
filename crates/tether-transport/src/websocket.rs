//! WebSocket gateway connector.
//!
//! One [`WsConnection`] carries exactly one shard's session. Reconnection is
//! not handled here; retry scheduling is centralized in the session manager,
//! so the connector stays one-shot.

use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message};
use tracing::{info, trace, warn};

use tether_core::{CloseReason, Connection, GatewayConnector, Inbound, TransportError};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;
type WsSource = SplitStream<WsStream>;

/// WebSocket implementation of [`GatewayConnector`].
#[derive(Default)]
pub struct WsConnector;

impl WsConnector {
    /// Creates a new WebSocket connector.
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl GatewayConnector for WsConnector {
    async fn open(&self, url: &str) -> Result<Box<dyn Connection>, TransportError> {
        info!(url = %url, "Connecting to gateway");

        let (ws_stream, _response) =
            connect_async(url)
                .await
                .map_err(|e| TransportError::ConnectFailed {
                    url: url.to_string(),
                    reason: e.to_string(),
                })?;
        let (ws_tx, ws_rx) = ws_stream.split();

        info!(url = %url, "Gateway connection established");

        Ok(Box::new(WsConnection {
            tx: ws_tx,
            rx: ws_rx,
            closed: None,
        }))
    }
}

/// One open WebSocket connection to the gateway.
pub struct WsConnection {
    tx: WsSink,
    rx: WsSource,
    /// Set once the connection has closed; replayed by later `recv` calls.
    closed: Option<CloseReason>,
}

#[async_trait]
impl Connection for WsConnection {
    async fn send(&mut self, message: Value) -> Result<(), TransportError> {
        if self.closed.is_some() {
            return Err(TransportError::NotOpen);
        }
        let text = message.to_string();
        self.tx
            .send(Message::Text(text.into()))
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }

    async fn recv(&mut self) -> Inbound {
        if let Some(reason) = &self.closed {
            return Inbound::Closed(reason.clone());
        }

        loop {
            match self.rx.next().await {
                Some(Ok(Message::Text(text))) => {
                    trace!(len = text.len(), "Received text frame");
                    match serde_json::from_str(text.as_str()) {
                        Ok(value) => return Inbound::Message(value),
                        Err(e) => {
                            warn!(error = %e, "Discarding undecodable frame");
                        }
                    }
                }
                Some(Ok(Message::Binary(data))) => {
                    trace!(len = data.len(), "Received binary frame");
                    match serde_json::from_slice(&data) {
                        Ok(value) => return Inbound::Message(value),
                        Err(e) => {
                            warn!(error = %e, "Discarding undecodable frame");
                        }
                    }
                }
                Some(Ok(Message::Ping(data))) => {
                    trace!("Received ping, sending pong");
                    let _ = self.tx.send(Message::Pong(data)).await;
                }
                Some(Ok(Message::Pong(_))) => {
                    trace!("Received pong");
                }
                Some(Ok(Message::Close(frame))) => {
                    let reason = match frame {
                        Some(frame) => CloseReason::from_code(
                            frame.code.into(),
                            frame.reason.as_str().to_string(),
                        ),
                        None => CloseReason::abnormal("peer closed without a close frame"),
                    };
                    info!(reason = %reason, resumable = reason.resumable, "Gateway closed connection");
                    self.closed = Some(reason.clone());
                    return Inbound::Closed(reason);
                }
                Some(Ok(Message::Frame(_))) => {
                    // Raw frames never surface from a configured client stream.
                    continue;
                }
                Some(Err(e)) => {
                    let reason = CloseReason::abnormal(e.to_string());
                    warn!(error = %e, "WebSocket error, treating as closed");
                    self.closed = Some(reason.clone());
                    return Inbound::Closed(reason);
                }
                None => {
                    let reason = CloseReason::abnormal("stream ended");
                    self.closed = Some(reason.clone());
                    return Inbound::Closed(reason);
                }
            }
        }
    }

    async fn close(&mut self) {
        if self.closed.is_some() {
            return;
        }
        let _ = self.tx.close().await;
        self.closed = Some(CloseReason::abnormal("closed by client"));
    }
}
