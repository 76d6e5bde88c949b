// mock_tunnel_client: A scripted tunnel client for testing the edge.
//
// Connects to a real edge's /connect endpoint, performs the
// register/registered handshake, and either exposes raw frame send/recv or
// runs a canned serve loop that answers forwarded requests.

use std::collections::HashMap;

use futures_util::{SinkExt, StreamExt};
use op_protocol::{
    BodyChunk, BodyEnd, Direction, Frame, Headers, Register, RequestHead, ResponseHead,
};
use tokio_tungstenite::MaybeTlsStream;
use tokio_tungstenite::tungstenite::protocol::Message;

use crate::BoxError;

type WsStream = tokio_tungstenite::WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// A canned response the serve loop returns for one forwarded request.
#[derive(Debug, Clone)]
pub struct MockResponse {
    pub status: u16,
    pub headers: Headers,
    pub body: Vec<u8>,
    /// When true the body is sent as chunk frames of `chunk_size` bytes
    /// followed by an end; otherwise it travels inline on the response frame.
    pub streaming: bool,
    pub chunk_size: usize,
}

impl MockResponse {
    pub fn text(status: u16, body: &str) -> Self {
        let mut headers = Headers::new();
        headers.insert("content-type".to_owned(), "text/plain".to_owned());
        Self {
            status,
            headers,
            body: body.as_bytes().to_vec(),
            streaming: false,
            chunk_size: 0,
        }
    }

    pub fn bytes(status: u16, body: Vec<u8>) -> Self {
        Self {
            status,
            headers: Headers::new(),
            body,
            streaming: false,
            chunk_size: 0,
        }
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.insert(name.to_owned(), value.to_owned());
        self
    }

    pub fn streamed(mut self, chunk_size: usize) -> Self {
        self.streaming = true;
        self.chunk_size = chunk_size;
        self
    }
}

pub struct MockTunnelClient {
    ws: WsStream,
}

impl MockTunnelClient {
    /// Connect to `ws://host:port/connect`, register `declared_port`, and
    /// wait for the `registered` ack.
    pub async fn register(connect_url: &str, declared_port: u16) -> Result<Self, BoxError> {
        let (ws, _response) = tokio_tungstenite::connect_async(connect_url).await?;
        let mut client = Self { ws };

        client
            .send_frame(&Frame::Register(Register {
                port: declared_port,
            }))
            .await?;

        match client.recv_frame().await? {
            Frame::Registered(ack) if ack.port == declared_port => Ok(client),
            other => Err(format!("expected registered, got {:?}", other).into()),
        }
    }

    pub async fn send_frame(&mut self, frame: &Frame) -> Result<(), BoxError> {
        let json = serde_json::to_string(frame)?;
        self.ws.send(Message::Text(json.into())).await?;
        Ok(())
    }

    pub async fn recv_frame(&mut self) -> Result<Frame, BoxError> {
        loop {
            match self.ws.next().await {
                Some(Ok(Message::Text(text))) => {
                    return Ok(serde_json::from_str(&text)?);
                }
                Some(Ok(Message::Ping(data))) => {
                    let _ = self.ws.send(Message::Pong(data)).await;
                }
                Some(Ok(Message::Close(_))) | None => {
                    return Err("control channel closed".into());
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(e.into()),
            }
        }
    }

    pub async fn close(&mut self) -> Result<(), BoxError> {
        self.ws.send(Message::Close(None)).await?;
        Ok(())
    }

    /// Answer every forwarded request with `handler`'s canned response.
    ///
    /// Requests with a body are buffered until their request-direction `end`
    /// arrives, then handed to the handler whole.  Runs until the channel
    /// closes; spawn it on a task.
    pub async fn serve<F>(mut self, mut handler: F)
    where
        F: FnMut(&RequestHead, Vec<u8>) -> MockResponse + Send,
    {
        let mut pending: HashMap<String, (RequestHead, Vec<u8>)> = HashMap::new();
        loop {
            let frame = match self.recv_frame().await {
                Ok(frame) => frame,
                Err(_) => return,
            };
            match frame {
                Frame::Request(head) => {
                    if head.has_body {
                        pending.insert(head.id.clone(), (head, Vec::new()));
                    } else {
                        let response = handler(&head, Vec::new());
                        if self.send_response(&head.id, response).await.is_err() {
                            return;
                        }
                    }
                }
                Frame::Chunk(chunk) if chunk.direction() == Direction::Request => {
                    if let Some((_, buf)) = pending.get_mut(&chunk.id) {
                        if let Ok(bytes) = op_protocol::body::decode(&chunk.data) {
                            buf.extend_from_slice(&bytes);
                        }
                    }
                }
                Frame::End(end) if end.direction() == Direction::Request => {
                    if let Some((head, buf)) = pending.remove(&end.id) {
                        let response = handler(&head, buf);
                        if self.send_response(&head.id, response).await.is_err() {
                            return;
                        }
                    }
                }
                _ => {}
            }
        }
    }

    /// Send one canned response, inline or streamed per its `streaming` flag.
    pub async fn send_response(
        &mut self,
        id: &str,
        response: MockResponse,
    ) -> Result<(), BoxError> {
        if response.streaming {
            self.send_frame(&Frame::Response(ResponseHead {
                id: id.to_owned(),
                status: response.status,
                headers: response.headers,
                body: None,
                streaming: Some(true),
            }))
            .await?;
            for chunk in response.body.chunks(response.chunk_size.max(1)) {
                self.send_frame(&Frame::Chunk(BodyChunk {
                    id: id.to_owned(),
                    data: op_protocol::body::encode(chunk),
                    direction: None,
                }))
                .await?;
            }
            self.send_frame(&Frame::End(BodyEnd {
                id: id.to_owned(),
                direction: None,
            }))
            .await?;
        } else {
            let inline = if response.body.is_empty() {
                None
            } else {
                Some(op_protocol::body::encode(&response.body))
            };
            self.send_frame(&Frame::Response(ResponseHead {
                id: id.to_owned(),
                status: response.status,
                headers: response.headers,
                body: inline,
                streaming: None,
            }))
            .await?;
        }
        Ok(())
    }
}
