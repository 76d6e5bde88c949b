//! The `/connect` control-channel endpoint.
//!
//! # Protocol
//! 1. Client upgrades to WebSocket and sends a `register` frame (within
//!    [`REGISTER_TIMEOUT`], or the socket is dropped)
//! 2. The edge installs the registration — displacing and closing any
//!    previous one — and answers with `registered`
//! 3. The loop then demultiplexes inbound `response`/`chunk`/`end` frames to
//!    per-request mailboxes and drains the shared outbound frame queue
//!
//! On exit the loop clears the in-flight table (failing pending requests)
//! and vacates the active-tunnel slot if it still owns it.

use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::IntoResponse;
use op_protocol::{ErrorNotice, Frame, Registered};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::state::{AppState, TunnelHandle};

const REGISTER_TIMEOUT: Duration = Duration::from_secs(10);
const FRAME_QUEUE_DEPTH: usize = 256;

pub async fn ws_connect_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_tunnel_socket(socket, state))
}

async fn send_frame(socket: &mut WebSocket, frame: &Frame) -> Result<(), axum::Error> {
    match serde_json::to_string(frame) {
        Ok(json) => socket.send(Message::Text(json.into())).await,
        Err(e) => {
            warn!(error = %e, "failed to serialize frame");
            Ok(())
        }
    }
}

async fn send_error_notice(socket: &mut WebSocket, message: &str) {
    let frame = Frame::Error(ErrorNotice {
        message: message.to_owned(),
    });
    let _ = send_frame(socket, &frame).await;
}

async fn handle_tunnel_socket(mut socket: WebSocket, state: AppState) {
    // Handshake: the first frame must be `register`.
    let declared_port = match tokio::time::timeout(REGISTER_TIMEOUT, socket.recv()).await {
        Ok(Some(Ok(Message::Text(text)))) => match serde_json::from_str::<Frame>(&text) {
            Ok(Frame::Register(register)) => register.port,
            Ok(other) => {
                warn!(?other, "first frame was not register");
                send_error_notice(&mut socket, "expected register").await;
                return;
            }
            Err(e) => {
                send_error_notice(&mut socket, &format!("invalid JSON: {}", e)).await;
                return;
            }
        },
        Ok(_) => {
            warn!("control channel closed before register");
            return;
        }
        Err(_) => {
            warn!("timeout waiting for register");
            send_error_notice(&mut socket, "timeout waiting for register").await;
            return;
        }
    };

    let (frame_tx, mut frame_rx) = mpsc::channel::<Frame>(FRAME_QUEUE_DEPTH);
    let tunnel = TunnelHandle::new(declared_port, frame_tx);
    let registration_id = tunnel.registration_id();
    let cancel = tunnel.cancel_token();

    if let Some(previous) = state.install_tunnel(tunnel.clone()).await {
        info!(port = previous.port(), "replacing existing tunnel registration");
        previous.close();
    }

    let ack = Frame::Registered(Registered {
        port: declared_port,
    });
    if send_frame(&mut socket, &ack).await.is_err() {
        tunnel.abort_inflight().await;
        state.clear_tunnel(registration_id).await;
        return;
    }
    info!(port = declared_port, "tunnel registered");

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                let _ = socket.send(Message::Close(None)).await;
                break;
            }
            outbound = frame_rx.recv() => {
                match outbound {
                    Some(frame) => {
                        if send_frame(&mut socket, &frame).await.is_err() {
                            warn!("control channel write failed");
                            break;
                        }
                    }
                    // All handle clones dropped; nothing left to serve.
                    None => break,
                }
            }
            inbound = socket.recv() => {
                match inbound {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<Frame>(&text) {
                            Ok(frame) => dispatch_inbound(&tunnel, frame).await,
                            Err(e) => warn!(error = %e, "undecodable frame on control channel"),
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        let _ = socket.send(Message::Pong(data)).await;
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        info!("tunnel disconnected");
                        break;
                    }
                    Some(Err(e)) => {
                        warn!(error = %e, "control channel error");
                        break;
                    }
                    Some(Ok(_)) => {}
                }
            }
        }
    }

    tunnel.abort_inflight().await;
    if state.clear_tunnel(registration_id).await {
        info!("tunnel unregistered");
    }
}

/// Route one inbound frame.  Only response-side frames are legal here;
/// protocol errors are logged and the channel stays up.
async fn dispatch_inbound(tunnel: &TunnelHandle, frame: Frame) {
    match &frame {
        Frame::Response(_) | Frame::Chunk(_) | Frame::End(_) => {
            // request_id is always Some for these kinds.
            let Some(id) = frame.request_id().map(str::to_owned) else {
                return;
            };
            if !tunnel.route_frame(&id, frame).await {
                debug!(id = %id, "frame for unknown request id");
            }
        }
        Frame::Error(notice) => {
            warn!(message = %notice.message, "error notice from tunnel client");
        }
        Frame::Register(_) | Frame::Registered(_) | Frame::Request(_) => {
            warn!("unexpected frame kind from tunnel client");
        }
    }
}
