// mock_edge: A scripted edge server for testing the client side.
//
// Binds to port 0, accepts /connect upgrades, validates the register
// handshake, answers with registered, and hands each established connection
// to the test as a pair of frame channels.

use std::net::SocketAddr;

use futures_util::{SinkExt, StreamExt};
use op_protocol::{Frame, Registered};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::Message;

use crate::BoxError;

/// One registered control-channel connection, seen from the edge side.
pub struct EdgeConn {
    /// Port the client declared in its register frame.
    pub declared_port: u16,
    to_client: mpsc::Sender<Frame>,
    from_client: mpsc::Receiver<Frame>,
}

impl EdgeConn {
    /// Queue a frame for the client.  Returns false once the socket is gone.
    pub async fn send(&self, frame: Frame) -> bool {
        self.to_client.send(frame).await.is_ok()
    }

    /// Next frame the client sent; None when the channel closed.
    pub async fn recv(&mut self) -> Option<Frame> {
        self.from_client.recv().await
    }

    /// Drop the connection from the edge side (sends a WebSocket close).
    pub fn close(self) {}
}

pub struct MockEdge {
    addr: SocketAddr,
    conn_rx: mpsc::Receiver<EdgeConn>,
    _task: tokio::task::JoinHandle<()>,
}

impl MockEdge {
    /// Start the mock edge on a random port.
    pub async fn start() -> Result<Self, BoxError> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let (conn_tx, conn_rx) = mpsc::channel(8);

        let task = tokio::spawn(async move {
            accept_loop(listener, conn_tx).await;
        });

        Ok(Self {
            addr,
            conn_rx,
            _task: task,
        })
    }

    /// Base URL in the form the client's config stores (`http://…`).
    pub fn http_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// Wait for the next connection to complete its register handshake.
    pub async fn next_conn(&mut self) -> Option<EdgeConn> {
        self.conn_rx.recv().await
    }
}

async fn accept_loop(listener: TcpListener, conn_tx: mpsc::Sender<EdgeConn>) {
    loop {
        match listener.accept().await {
            Ok((stream, _peer)) => {
                let conn_tx = conn_tx.clone();
                tokio::spawn(async move {
                    // Handshake or transport failures just drop the socket;
                    // that is what the test is usually provoking.
                    let _ = handle_connection(stream, conn_tx).await;
                });
            }
            Err(_) => break,
        }
    }
}

async fn handle_connection(
    stream: tokio::net::TcpStream,
    conn_tx: mpsc::Sender<EdgeConn>,
) -> Result<(), BoxError> {
    let mut ws = tokio_tungstenite::accept_async(stream).await?;

    // First frame must be register.
    let declared_port = loop {
        match ws.next().await {
            Some(Ok(Message::Text(text))) => match serde_json::from_str::<Frame>(&text)? {
                Frame::Register(register) => break register.port,
                other => return Err(format!("expected register, got {:?}", other).into()),
            },
            Some(Ok(Message::Ping(data))) => {
                ws.send(Message::Pong(data)).await?;
            }
            Some(Ok(_)) => {}
            Some(Err(e)) => return Err(e.into()),
            None => return Err("closed before register".into()),
        }
    };

    let ack = Frame::Registered(Registered {
        port: declared_port,
    });
    ws.send(Message::Text(serde_json::to_string(&ack)?.into()))
        .await?;

    let (to_client, mut out_rx) = mpsc::channel::<Frame>(64);
    let (in_tx, from_client) = mpsc::channel::<Frame>(64);
    if conn_tx
        .send(EdgeConn {
            declared_port,
            to_client,
            from_client,
        })
        .await
        .is_err()
    {
        // The test dropped its MockEdge; nothing to serve.
        return Ok(());
    }

    loop {
        tokio::select! {
            outbound = out_rx.recv() => {
                match outbound {
                    Some(frame) => {
                        let json = serde_json::to_string(&frame)?;
                        ws.send(Message::Text(json.into())).await?;
                    }
                    // Test dropped its EdgeConn: close from the edge side.
                    None => {
                        let _ = ws.send(Message::Close(None)).await;
                        break;
                    }
                }
            }
            inbound = ws.next() => {
                match inbound {
                    Some(Ok(Message::Text(text))) => {
                        if let Ok(frame) = serde_json::from_str::<Frame>(&text) {
                            let _ = in_tx.send(frame).await;
                        }
                    }
                    Some(Ok(Message::Ping(data))) => { ws.send(Message::Pong(data)).await?; }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(_)) => break,
                }
            }
        }
    }

    Ok(())
}
