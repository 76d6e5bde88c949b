//! Tunnel control-channel session.
//!
//! # Protocol
//! 1. Connect to `<domain>/connect` (ws:// or wss://, derived from the
//!    configured http(s) domain)
//! 2. Send `register` with the local port
//! 3. Receive `registered` — anything else fails the handshake
//! 4. Pump frames: inbound to the [`Dispatcher`], outbound from the shared
//!    frame queue the per-request tasks write to

use futures_util::{SinkExt, StreamExt};
use op_protocol::{Frame, Register};
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::MaybeTlsStream;
use tokio_tungstenite::tungstenite::protocol::Message;
use tracing::{info, warn};

use crate::dispatcher::Dispatcher;

type WsStream =
    tokio_tungstenite::WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

const OUTBOUND_QUEUE_DEPTH: usize = 256;

/// Everything a session needs to open the channel and dispatch requests.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Edge base URL as stored in config.json (`http://…` or `https://…`).
    pub domain: String,
    /// Loopback port the dispatcher issues requests against.
    pub local_port: u16,
}

/// How a session loop ended, when it ended without a transport error.
#[derive(Debug, PartialEq, Eq)]
pub enum SessionEnd {
    /// The shutdown signal fired; do not reconnect.
    ShutdownRequested,
    /// The edge closed the channel; the reconnect controller takes over.
    Disconnected,
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("connection error: {0}")]
    Connect(String),
    #[error("WebSocket error: {0}")]
    Ws(String),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Derive the control-channel URL from the configured http(s) domain.
pub fn connect_url(domain: &str) -> Result<String, SessionError> {
    if let Some(rest) = domain.strip_prefix("https://") {
        Ok(format!("wss://{}/connect", rest))
    } else if let Some(rest) = domain.strip_prefix("http://") {
        Ok(format!("ws://{}/connect", rest))
    } else {
        Err(SessionError::Connect(format!(
            "domain '{}' has no http(s) scheme",
            domain
        )))
    }
}

/// An open, registered control channel.
pub struct TunnelSession {
    ws: WsStream,
}

impl TunnelSession {
    /// Connect and perform the register/registered handshake.
    pub async fn connect(cfg: &SessionConfig) -> Result<Self, SessionError> {
        let url = connect_url(&cfg.domain)?;
        let (ws, _response) = tokio_tungstenite::connect_async(url.as_str())
            .await
            .map_err(|e| SessionError::Connect(e.to_string()))?;
        let mut session = TunnelSession { ws };

        session
            .send_frame(&Frame::Register(Register {
                port: cfg.local_port,
            }))
            .await?;

        match session.recv_frame().await? {
            Frame::Registered(ack) => {
                info!(port = ack.port, "tunnel registered");
                Ok(session)
            }
            Frame::Error(notice) => Err(SessionError::Protocol(format!(
                "edge rejected registration: {}",
                notice.message
            ))),
            other => Err(SessionError::Protocol(format!(
                "expected registered, got {:?}",
                other
            ))),
        }
    }

    /// Pump frames until the channel closes or shutdown fires.
    pub async fn run(
        mut self,
        local_port: u16,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<SessionEnd, SessionError> {
        let (frame_tx, mut frame_rx) = mpsc::channel::<Frame>(OUTBOUND_QUEUE_DEPTH);
        let dispatcher = Dispatcher::new(local_port, frame_tx);

        loop {
            tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    // A dropped sender counts as shutdown.
                    if changed.is_err() || *shutdown.borrow() {
                        let _ = self.ws.send(Message::Close(None)).await;
                        return Ok(SessionEnd::ShutdownRequested);
                    }
                }
                outbound = frame_rx.recv() => {
                    // The dispatcher holds a sender for the session's
                    // lifetime, so this arm only sees Some.
                    if let Some(frame) = outbound {
                        self.send_frame(&frame).await?;
                    }
                }
                inbound = self.ws.next() => {
                    match inbound {
                        None => return Ok(SessionEnd::Disconnected),
                        Some(Err(e)) => return Err(SessionError::Ws(e.to_string())),
                        Some(Ok(Message::Text(text))) => {
                            match serde_json::from_str::<Frame>(&text) {
                                Ok(frame) => dispatcher.dispatch(frame).await,
                                Err(e) => warn!(error = %e, "undecodable frame on control channel"),
                            }
                        }
                        Some(Ok(Message::Ping(data))) => {
                            let _ = self.ws.send(Message::Pong(data)).await;
                        }
                        Some(Ok(Message::Close(_))) => return Ok(SessionEnd::Disconnected),
                        Some(Ok(_)) => {}
                    }
                }
            }
        }
    }

    async fn send_frame(&mut self, frame: &Frame) -> Result<(), SessionError> {
        let json = serde_json::to_string(frame)?;
        self.ws
            .send(Message::Text(json.into()))
            .await
            .map_err(|e| SessionError::Ws(e.to_string()))
    }

    async fn recv_frame(&mut self) -> Result<Frame, SessionError> {
        loop {
            match self.ws.next().await {
                None => return Err(SessionError::Connect("closed during handshake".to_owned())),
                Some(Err(e)) => return Err(SessionError::Ws(e.to_string())),
                Some(Ok(Message::Text(text))) => {
                    return serde_json::from_str(&text)
                        .map_err(|e| SessionError::Protocol(format!("JSON parse: {}", e)));
                }
                Some(Ok(Message::Close(_))) => {
                    return Err(SessionError::Connect("closed during handshake".to_owned()));
                }
                Some(Ok(Message::Ping(data))) => {
                    let _ = self.ws.send(Message::Pong(data)).await;
                }
                Some(Ok(_)) => {}
            }
        }
    }
}
