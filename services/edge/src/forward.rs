//! The catch-all forward path: multiplexes one public HTTP request onto the
//! control channel and assembles the framed response.
//!
//! # Per-request flow
//! 1. Mint an id, create a mailbox, add it to the in-flight table
//! 2. Send the `request` frame; pump the public body out as
//!    request-direction chunks
//! 3. A spawned task drives the response state machine
//!    (`AwaitingHead` → `Streaming` → `Closed`) off the mailbox and removes
//!    the record at exactly one point, whatever the exit path
//!
//! The 30 s deadline is fixed at record creation and also cuts long-lived
//! streaming responses.

use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use futures_util::StreamExt;
use op_protocol::{BodyChunk, BodyEnd, Direction, Frame, Headers, RequestHead};
use rand::Rng;
use rand::distributions::Alphanumeric;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, timeout_at};
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, warn};

use crate::state::{AppState, TunnelHandle};

const FRAME_MAILBOX_DEPTH: usize = 64;
const BODY_QUEUE_DEPTH: usize = 32;

pub async fn forward(State(state): State<AppState>, req: Request) -> Response {
    let Some(tunnel) = state.active_tunnel().await else {
        return error_response(
            StatusCode::SERVICE_UNAVAILABLE,
            "No active tunnel",
            "no tunnel client is registered",
        );
    };

    let id = mint_request_id();
    let (parts, public_body) = req.into_parts();
    let url = parts
        .uri
        .path_and_query()
        .map_or_else(|| "/".to_owned(), |pq| pq.as_str().to_owned());
    let request_headers = op_protocol::headers::sanitize(&header_map_to_frame(&parts.headers));
    let has_body = content_length(&parts.headers).is_some_and(|n| n > 0);

    let (mailbox_tx, mailbox_rx) = mpsc::channel(FRAME_MAILBOX_DEPTH);
    tunnel.track_request(&id, mailbox_tx).await;

    let head = Frame::Request(RequestHead {
        id: id.clone(),
        method: parts.method.to_string(),
        url,
        headers: request_headers,
        has_body,
    });
    if tunnel.send_frame(head).await.is_err() {
        tunnel.untrack_request(&id).await;
        return error_response(
            StatusCode::SERVICE_UNAVAILABLE,
            "Tunnel disconnected",
            "the tunnel dropped before the request could be forwarded",
        );
    }

    if has_body {
        tokio::spawn(pump_request_body(tunnel.clone(), id.clone(), public_body));
    }

    let deadline = Instant::now() + state.request_timeout();
    let (head_tx, head_rx) = oneshot::channel();
    tokio::spawn(run_response(tunnel, id, mailbox_rx, deadline, head_tx));

    match head_rx.await {
        Ok(response) => response,
        // The response task sends on every exit path; reaching this means it
        // panicked.
        Err(_) => error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            "Internal error",
            "response task ended unexpectedly",
        ),
    }
}

/// Stream the public request body out as request-direction chunks.
///
/// Best-effort: if the channel drops mid-stream the record is reaped by the
/// deadline or by the channel-close path.
async fn pump_request_body(tunnel: TunnelHandle, id: String, public_body: Body) {
    let mut stream = public_body.into_data_stream();
    while let Some(piece) = stream.next().await {
        match piece {
            Ok(bytes) => {
                if bytes.is_empty() {
                    continue;
                }
                let frame = Frame::Chunk(BodyChunk {
                    id: id.clone(),
                    data: op_protocol::body::encode(&bytes),
                    direction: Some(Direction::Request),
                });
                if tunnel.send_frame(frame).await.is_err() {
                    return;
                }
            }
            Err(e) => {
                debug!(id = %id, error = %e, "public request body error");
                return;
            }
        }
    }
    let end = Frame::End(BodyEnd {
        id,
        direction: Some(Direction::Request),
    });
    let _ = tunnel.send_frame(end).await;
}

/// Drive the response state machine for one request.
///
/// `head_tx` carries the assembled `Response` back to the HTTP handler the
/// moment status and headers are known; streaming bodies keep flowing through
/// the channel behind it.  The in-flight record is removed at the single
/// cleanup point at the bottom.
async fn run_response(
    tunnel: TunnelHandle,
    id: String,
    mut mailbox: mpsc::Receiver<Frame>,
    deadline: Instant,
    head_tx: oneshot::Sender<Response>,
) {
    let mut head_tx = Some(head_tx);
    let mut body_tx: Option<mpsc::Sender<Result<Bytes, std::io::Error>>> = None;

    loop {
        let frame = match timeout_at(deadline, mailbox.recv()).await {
            Err(_) => {
                if let Some(tx) = head_tx.take() {
                    let _ = tx.send(error_response(
                        StatusCode::GATEWAY_TIMEOUT,
                        "Request timeout",
                        "no response from the tunnel client within the deadline",
                    ));
                } else {
                    warn!(id = %id, "deadline reached mid-stream, truncating response");
                }
                break;
            }
            Ok(None) => {
                // The channel loop cleared the in-flight table.
                if let Some(tx) = head_tx.take() {
                    let _ = tx.send(error_response(
                        StatusCode::SERVICE_UNAVAILABLE,
                        "Tunnel disconnected",
                        "the tunnel dropped before a response arrived",
                    ));
                }
                break;
            }
            Ok(Some(frame)) => frame,
        };

        match frame {
            Frame::Response(resp) if head_tx.is_some() => {
                let Some(tx) = head_tx.take() else { break };
                let status = match StatusCode::from_u16(resp.status) {
                    Ok(status) => status,
                    Err(_) => {
                        let _ = tx.send(bad_frame_response(&format!(
                            "invalid status {}",
                            resp.status
                        )));
                        break;
                    }
                };
                let inline = match resp.body.as_deref().map(op_protocol::body::decode).transpose() {
                    Ok(decoded) => decoded.map(Bytes::from),
                    Err(e) => {
                        let _ = tx.send(bad_frame_response(&format!("invalid base64 body: {}", e)));
                        break;
                    }
                };

                if resp.is_streaming() {
                    let (chunk_tx, chunk_rx) = mpsc::channel(BODY_QUEUE_DEPTH);
                    if let Some(bytes) = inline {
                        let _ = chunk_tx.send(Ok(bytes)).await;
                    }
                    let streamed = Body::from_stream(ReceiverStream::new(chunk_rx));
                    match proxied_response(status, &resp.headers, streamed) {
                        Ok(response) => {
                            let _ = tx.send(response);
                            body_tx = Some(chunk_tx);
                        }
                        Err(e) => {
                            let _ = tx.send(bad_frame_response(&e.to_string()));
                            break;
                        }
                    }
                } else {
                    let bytes = inline.unwrap_or_default();
                    match proxied_response(status, &resp.headers, Body::from(bytes)) {
                        Ok(response) => {
                            let _ = tx.send(response);
                        }
                        Err(e) => {
                            let _ = tx.send(bad_frame_response(&e.to_string()));
                        }
                    }
                    break;
                }
            }
            Frame::Chunk(chunk) if chunk.direction() == Direction::Response => {
                let bytes = match op_protocol::body::decode(&chunk.data) {
                    Ok(decoded) => Bytes::from(decoded),
                    Err(e) => {
                        warn!(id = %id, error = %e, "invalid base64 in chunk");
                        if let Some(tx) = head_tx.take() {
                            let _ = tx.send(bad_frame_response("invalid base64 in chunk"));
                        }
                        body_tx.take();
                        break;
                    }
                };
                if let Some(tx) = head_tx.take() {
                    // Body-first response: synthesize a 200 and start
                    // streaming.
                    let (chunk_tx, chunk_rx) = mpsc::channel(BODY_QUEUE_DEPTH);
                    let _ = chunk_tx.send(Ok(bytes)).await;
                    let streamed = Body::from_stream(ReceiverStream::new(chunk_rx));
                    match proxied_response(StatusCode::OK, &Headers::new(), streamed) {
                        Ok(response) => {
                            let _ = tx.send(response);
                            body_tx = Some(chunk_tx);
                        }
                        Err(e) => {
                            let _ = tx.send(bad_frame_response(&e.to_string()));
                            break;
                        }
                    }
                } else if let Some(chunk_tx) = &body_tx {
                    if chunk_tx.send(Ok(bytes)).await.is_err() {
                        debug!(id = %id, "public caller dropped mid-stream");
                        break;
                    }
                }
            }
            Frame::End(end) if end.direction() == Direction::Response => {
                if let Some(tx) = head_tx.take() {
                    // End before head: an empty implicit 200.
                    let _ = tx.send(StatusCode::OK.into_response());
                }
                body_tx.take();
                break;
            }
            other => {
                warn!(id = %id, ?other, "malformed frame for in-flight request");
                if let Some(tx) = head_tx.take() {
                    let _ = tx.send(error_response(
                        StatusCode::INTERNAL_SERVER_ERROR,
                        "Protocol error",
                        "malformed frame from tunnel client",
                    ));
                }
                body_tx.take();
                break;
            }
        }
    }

    // Single cleanup point for the request record.
    tunnel.untrack_request(&id).await;
}

// ---------------------------------------------------------------------------
// Response construction
// ---------------------------------------------------------------------------

fn proxied_response(
    status: StatusCode,
    headers: &Headers,
    response_body: Body,
) -> Result<Response, axum::http::Error> {
    let mut builder = Response::builder().status(status);
    for (name, value) in headers {
        builder = builder.header(name.as_str(), value.as_str());
    }
    builder.body(response_body)
}

fn bad_frame_response(message: &str) -> Response {
    error_response(StatusCode::INTERNAL_SERVER_ERROR, "Bad response frame", message)
}

/// JSON error envelope for edge-originated statuses (503 / 504 / 500).
pub(crate) fn error_response(status: StatusCode, error: &str, message: &str) -> Response {
    let payload = serde_json::json!({ "error": error, "message": message });
    (
        status,
        [(header::CONTENT_TYPE, "application/json")],
        payload.to_string(),
    )
        .into_response()
}

// ---------------------------------------------------------------------------
// Request helpers
// ---------------------------------------------------------------------------

/// Mint a request id: millisecond timestamp in hex plus a short random
/// suffix.  Unique within a registration by construction.
fn mint_request_id() -> String {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis();
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(6)
        .map(char::from)
        .collect();
    format!("{millis:x}-{suffix}")
}

fn content_length(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(header::CONTENT_LENGTH)?
        .to_str()
        .ok()?
        .trim()
        .parse()
        .ok()
}

/// Fold an HTTP header map into the wire representation, joining repeated
/// names the way a downstream proxy would.
fn header_map_to_frame(headers: &HeaderMap) -> Headers {
    let mut out = Headers::new();
    for (name, value) in headers {
        let Ok(value) = value.to_str() else {
            warn!(header = %name, "dropping non-ASCII header value");
            continue;
        };
        out.entry(name.as_str().to_owned())
            .and_modify(|existing| {
                existing.push_str(", ");
                existing.push_str(value);
            })
            .or_insert_with(|| value.to_owned());
    }
    out
}
