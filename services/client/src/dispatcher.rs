//! Frame dispatcher: turns inbound `request` frames into loopback HTTP
//! calls and streams both bodies across the channel.
//!
//! One task per in-flight request.  The pending table only tracks the
//! request-body feed; `chunk`/`end` frames for unknown ids are dropped
//! silently to tolerate races with channel close.

use bytes::Bytes;
use futures_util::StreamExt;
use op_protocol::{
    BodyChunk, BodyEnd, Direction, Frame, Headers, RequestHead, ResponseHead,
};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, mpsc};
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, warn};

const BODY_QUEUE_DEPTH: usize = 32;

type BodyFeed = mpsc::Sender<Result<Bytes, std::io::Error>>;

/// Why a loopback request could not produce a real response.
enum LocalFailure {
    /// Could not reach the loopback service at all — surfaced as 502.
    Unreachable(String),
    /// Failed after connecting but before any headers crossed the channel —
    /// surfaced as 500.
    Failed(String),
}

impl LocalFailure {
    fn status(&self) -> u16 {
        match self {
            LocalFailure::Unreachable(_) => 502,
            LocalFailure::Failed(_) => 500,
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            LocalFailure::Unreachable(_) => "Bad Gateway",
            LocalFailure::Failed(_) => "Internal error",
        }
    }

    fn message(&self) -> &str {
        match self {
            LocalFailure::Unreachable(m) | LocalFailure::Failed(m) => m,
        }
    }
}

#[derive(Clone)]
pub struct Dispatcher {
    local_port: u16,
    http: reqwest::Client,
    frame_tx: mpsc::Sender<Frame>,
    pending: Arc<Mutex<HashMap<String, BodyFeed>>>,
}

impl Dispatcher {
    pub fn new(local_port: u16, frame_tx: mpsc::Sender<Frame>) -> Self {
        Self {
            local_port,
            http: reqwest::Client::new(),
            frame_tx,
            pending: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Route one inbound frame from the control channel.
    pub async fn dispatch(&self, frame: Frame) {
        match frame {
            Frame::Request(head) => {
                // The feed entry must exist before the next frame is
                // dispatched; request chunks can arrive right behind the
                // head.
                let body_feed = if head.has_body {
                    let (feed_tx, feed_rx) = mpsc::channel(BODY_QUEUE_DEPTH);
                    self.pending.lock().await.insert(head.id.clone(), feed_tx);
                    Some(feed_rx)
                } else {
                    None
                };
                let dispatcher = self.clone();
                tokio::spawn(async move {
                    dispatcher.handle_request(head, body_feed).await;
                });
            }
            Frame::Chunk(chunk) if chunk.direction() == Direction::Request => {
                self.feed_chunk(chunk).await;
            }
            Frame::End(end) if end.direction() == Direction::Request => {
                // Dropping the feed closes the loopback request body.
                self.pending.lock().await.remove(&end.id);
            }
            Frame::Chunk(_) | Frame::End(_) => {
                warn!("response-direction frame arrived at the client");
            }
            Frame::Error(notice) => {
                warn!(message = %notice.message, "error notice from edge");
            }
            other => {
                warn!(?other, "unexpected frame kind from edge");
            }
        }
    }

    pub async fn pending_len(&self) -> usize {
        self.pending.lock().await.len()
    }

    async fn handle_request(
        self,
        head: RequestHead,
        body_feed: Option<mpsc::Receiver<Result<Bytes, std::io::Error>>>,
    ) {
        let id = head.id.clone();
        if let Err(failure) = self.issue_local_request(head, body_feed).await {
            warn!(id = %id, status = failure.status(), message = failure.message(), "loopback request failed");
            self.send_synthetic_error(&id, &failure).await;
        }
        // Covers loopback errors that die before the request-body end frame
        // arrives; normal completion already removed the entry.
        self.pending.lock().await.remove(&id);
    }

    async fn issue_local_request(
        &self,
        head: RequestHead,
        body_feed: Option<mpsc::Receiver<Result<Bytes, std::io::Error>>>,
    ) -> Result<(), LocalFailure> {
        let method = reqwest::Method::from_bytes(head.method.as_bytes())
            .map_err(|e| LocalFailure::Failed(format!("invalid method: {}", e)))?;
        let url = format!("http://127.0.0.1:{}{}", self.local_port, head.url);

        let mut builder = self.http.request(method, &url);
        for (name, value) in &head.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(feed_rx) = body_feed {
            builder = builder.body(reqwest::Body::wrap_stream(ReceiverStream::new(feed_rx)));
        }

        let response = builder.send().await.map_err(|e| {
            if e.is_connect() {
                LocalFailure::Unreachable(e.to_string())
            } else {
                LocalFailure::Failed(e.to_string())
            }
        })?;

        let status = response.status().as_u16();
        let response_headers = response_headers_to_frame(response.headers());
        let head_frame = Frame::Response(ResponseHead {
            id: head.id.clone(),
            status,
            headers: op_protocol::headers::sanitize(&response_headers),
            body: None,
            streaming: Some(true),
        });
        if self.send_frame(head_frame).await.is_err() {
            // Channel gone; the session is over, nothing left to report to.
            return Ok(());
        }

        let mut stream = response.bytes_stream();
        while let Some(piece) = stream.next().await {
            match piece {
                Ok(bytes) => {
                    if bytes.is_empty() {
                        continue;
                    }
                    let frame = Frame::Chunk(BodyChunk {
                        id: head.id.clone(),
                        data: op_protocol::body::encode(&bytes),
                        direction: None,
                    });
                    if self.send_frame(frame).await.is_err() {
                        return Ok(());
                    }
                }
                Err(e) => {
                    // Headers already crossed the channel: abort with no
                    // further frames and let the edge deadline reap it.
                    warn!(id = %head.id, error = %e, "loopback response stream error, aborting");
                    return Ok(());
                }
            }
        }

        let _ = self
            .send_frame(Frame::End(BodyEnd {
                id: head.id,
                direction: None,
            }))
            .await;
        Ok(())
    }

    /// Feed a request-direction chunk into its loopback body stream.
    async fn feed_chunk(&self, chunk: BodyChunk) {
        let feed = { self.pending.lock().await.get(&chunk.id).cloned() };
        let Some(feed) = feed else {
            debug!(id = %chunk.id, "chunk for unknown request id");
            return;
        };
        match op_protocol::body::decode(&chunk.data) {
            Ok(bytes) => {
                if feed.send(Ok(Bytes::from(bytes))).await.is_err() {
                    self.pending.lock().await.remove(&chunk.id);
                }
            }
            Err(e) => {
                warn!(id = %chunk.id, error = %e, "invalid base64 in request chunk, aborting body");
                let _ = feed
                    .send(Err(std::io::Error::new(
                        std::io::ErrorKind::InvalidData,
                        "invalid base64 in request chunk",
                    )))
                    .await;
                self.pending.lock().await.remove(&chunk.id);
            }
        }
    }

    async fn send_synthetic_error(&self, id: &str, failure: &LocalFailure) {
        let payload = serde_json::json!({
            "error": failure.kind(),
            "message": failure.message(),
        });
        let mut headers = Headers::new();
        headers.insert("content-type".to_owned(), "application/json".to_owned());
        let frame = Frame::Response(ResponseHead {
            id: id.to_owned(),
            status: failure.status(),
            headers,
            body: Some(op_protocol::body::encode(payload.to_string().as_bytes())),
            streaming: None,
        });
        let _ = self.send_frame(frame).await;
    }

    async fn send_frame(&self, frame: Frame) -> Result<(), ()> {
        self.frame_tx.send(frame).await.map_err(|_| ())
    }
}

fn response_headers_to_frame(headers: &reqwest::header::HeaderMap) -> Headers {
    let mut out = Headers::new();
    for (name, value) in headers {
        let Ok(value) = value.to_str() else {
            warn!(header = %name, "dropping non-ASCII response header");
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
