/// End-to-end: real edge, real client session, real loopback service.
///
/// Caller → edge HTTP → control channel → dispatcher → local axum service,
/// and all the way back.
use axum::Router;
use axum::body::Body;
use axum::routing::{get, post};
use bytes::Bytes;
use client::session::{SessionConfig, TunnelSession};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::sync::watch;
use tokio_stream::wrappers::ReceiverStream;

async fn spawn_edge() -> SocketAddr {
    let state = edge::AppState::new();
    let router = edge::build_router(state);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    addr
}

/// Local service: instant text, byte echo, and a paced 100 KB stream.
async fn spawn_local_http() -> SocketAddr {
    let app = Router::new()
        .route(
            "/hello",
            get(|| async { ([("content-type", "text/plain")], "hi") }),
        )
        .route("/echo", post(|body: Bytes| async move { body }))
        .route(
            "/stream",
            get(|| async {
                let (tx, rx) = tokio::sync::mpsc::channel::<Result<Bytes, std::io::Error>>(4);
                tokio::spawn(async move {
                    for i in 0..10u8 {
                        let chunk = vec![i; 10 * 1024];
                        if tx.send(Ok(Bytes::from(chunk))).await.is_err() {
                            return;
                        }
                        tokio::time::sleep(Duration::from_millis(10)).await;
                    }
                });
                Body::from_stream(ReceiverStream::new(rx))
            }),
        );
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

/// Open a session against `edge_addr` for `local_port` and keep it running
/// in the background until the returned sender fires.
async fn connect_client(edge_addr: SocketAddr, local_port: u16) -> watch::Sender<bool> {
    let cfg = SessionConfig {
        domain: format!("http://{}", edge_addr),
        local_port,
    };
    let session = TunnelSession::connect(&cfg).await.expect("client connect");
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(session.run(local_port, shutdown_rx));
    shutdown_tx
}

#[tokio::test]
async fn simple_get_travels_the_full_path() {
    let local = spawn_local_http().await;
    let edge_addr = spawn_edge().await;
    let _shutdown = connect_client(edge_addr, local.port()).await;

    let response = reqwest::get(format!("http://{}/hello", edge_addr))
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(
        response
            .headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok()),
        Some("text/plain")
    );
    assert_eq!(response.text().await.unwrap(), "hi");

    let health: serde_json::Value = reqwest::get(format!("http://{}/health", edge_addr))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(health["tunnel"]["connected"], true);
    assert_eq!(health["tunnel"]["port"], local.port());
}

#[tokio::test]
async fn large_upload_arrives_byte_identical() {
    let local = spawn_local_http().await;
    let edge_addr = spawn_edge().await;
    let _shutdown = connect_client(edge_addr, local.port()).await;

    let upload: Vec<u8> = (0..5 * 1024 * 1024).map(|i| (i * 31 % 256) as u8).collect();
    let response = reqwest::Client::new()
        .post(format!("http://{}/echo", edge_addr))
        .body(upload.clone())
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    let echoed = response.bytes().await.unwrap();
    assert_eq!(echoed.len(), upload.len());
    assert_eq!(echoed.as_ref(), upload.as_slice());
}

#[tokio::test]
async fn streamed_response_arrives_complete_and_ordered() {
    let local = spawn_local_http().await;
    let edge_addr = spawn_edge().await;
    let _shutdown = connect_client(edge_addr, local.port()).await;

    let received = reqwest::get(format!("http://{}/stream", edge_addr))
        .await
        .unwrap()
        .bytes()
        .await
        .unwrap();
    assert_eq!(received.len(), 100 * 1024);
    for (i, window) in received.chunks(10 * 1024).enumerate() {
        assert!(
            window.iter().all(|&b| b == i as u8),
            "chunk {} is out of order or corrupted",
            i
        );
    }
}

#[tokio::test]
async fn concurrent_requests_multiplex_without_interleaving() {
    let local = spawn_local_http().await;
    let edge_addr = spawn_edge().await;
    let _shutdown = connect_client(edge_addr, local.port()).await;

    let base = format!("http://{}", edge_addr);
    let stream_req = reqwest::get(format!("{}/stream", base));
    let hello_a = reqwest::get(format!("{}/hello", base));
    let hello_b = reqwest::get(format!("{}/hello", base));

    let (stream_res, hello_a, hello_b) = tokio::join!(stream_req, hello_a, hello_b);

    let streamed = stream_res.unwrap().bytes().await.unwrap();
    assert_eq!(streamed.len(), 100 * 1024);
    for (i, window) in streamed.chunks(10 * 1024).enumerate() {
        assert!(window.iter().all(|&b| b == i as u8), "chunk {} corrupted", i);
    }

    assert_eq!(hello_a.unwrap().text().await.unwrap(), "hi");
    assert_eq!(hello_b.unwrap().text().await.unwrap(), "hi");
}
