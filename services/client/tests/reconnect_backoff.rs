/// Reconnection controller behavior: give-up budget, counter reset on a
/// successful open, status-file lifecycle, re-entrancy.
///
/// Backoff schedule math (doubling, cap, jitter bound) is unit-tested next
/// to the policy; these tests run the controller against MockEdge with
/// millisecond delays.
use client::config::ConfigStore;
use client::reconnect::{BackoffPolicy, ControllerEnd, ReconnectController};
use client::session::SessionConfig;
use op_test_utils::MockEdge;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

fn fast_policy(max_attempts: Option<u32>) -> BackoffPolicy {
    BackoffPolicy {
        base_delay: Duration::from_millis(5),
        max_delay: Duration::from_millis(20),
        max_attempts,
    }
}

fn temp_store() -> (tempfile::TempDir, ConfigStore) {
    let dir = tempfile::tempdir().unwrap();
    let store = ConfigStore::new(dir.path().join("outpost"));
    (dir, store)
}

#[tokio::test]
async fn controller_gives_up_after_max_attempts() {
    let dead_port = {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    };
    let (_guard, store) = temp_store();
    let cfg = SessionConfig {
        domain: format!("http://127.0.0.1:{}", dead_port),
        local_port: 3000,
    };
    let controller = ReconnectController::new(fast_policy(Some(3)));
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);

    let end = controller.run(&cfg, &store, shutdown_rx).await;
    assert_eq!(end, ControllerEnd::GaveUp);
    assert_eq!(controller.attempts(), 4, "gave up on the attempt past the budget");
    assert_eq!(store.read_status().unwrap(), None);
}

#[tokio::test]
async fn successful_open_resets_the_attempt_counter() {
    let mut edge = MockEdge::start().await.unwrap();
    let (_guard, store) = temp_store();
    let cfg = SessionConfig {
        domain: edge.http_url(),
        local_port: 3000,
    };
    let controller = Arc::new(ReconnectController::new(fast_policy(None)));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let run = {
        let controller = controller.clone();
        let store = store.clone();
        tokio::spawn(async move { controller.run(&cfg, &store, shutdown_rx).await })
    };

    // First connection: status file appears, counter is zero.
    let conn = edge.next_conn().await.expect("first connection");
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(controller.attempts(), 0);
    let status = store.read_status().unwrap().expect("status written");
    assert!(status.connected);
    assert_eq!(status.port, 3000);

    // Drop the channel: the controller backs off and reconnects.
    conn.close();
    let _conn2 = edge.next_conn().await.expect("reconnected");
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(controller.attempts(), 0, "counter resets on the new open");

    shutdown_tx.send(true).unwrap();
    let end = run.await.unwrap();
    assert_eq!(end, ControllerEnd::Shutdown);
    assert_eq!(store.read_status().unwrap(), None, "status removed on disconnect");
}

#[tokio::test]
async fn second_concurrent_run_is_a_noop() {
    let mut edge = MockEdge::start().await.unwrap();
    let (_guard, store) = temp_store();
    let cfg = SessionConfig {
        domain: edge.http_url(),
        local_port: 3000,
    };
    let controller = Arc::new(ReconnectController::new(fast_policy(None)));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let run = {
        let controller = controller.clone();
        let cfg = cfg.clone();
        let store = store.clone();
        let shutdown_rx = shutdown_rx.clone();
        tokio::spawn(async move { controller.run(&cfg, &store, shutdown_rx).await })
    };
    let _conn = edge.next_conn().await.expect("connected");

    let end = controller.run(&cfg, &store, shutdown_rx).await;
    assert_eq!(end, ControllerEnd::AlreadyRunning);

    shutdown_tx.send(true).unwrap();
    assert_eq!(run.await.unwrap(), ControllerEnd::Shutdown);
}

#[tokio::test]
async fn shutdown_during_backoff_cancels_the_pending_attempt() {
    let dead_port = {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    };
    let (_guard, store) = temp_store();
    let cfg = SessionConfig {
        domain: format!("http://127.0.0.1:{}", dead_port),
        local_port: 3000,
    };
    // A long backoff so the shutdown clearly lands inside the timer.
    let controller = Arc::new(ReconnectController::new(BackoffPolicy {
        base_delay: Duration::from_secs(30),
        max_delay: Duration::from_secs(60),
        max_attempts: None,
    }));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let run = {
        let controller = controller.clone();
        tokio::spawn(async move { controller.run(&cfg, &store, shutdown_rx).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    shutdown_tx.send(true).unwrap();

    let end = tokio::time::timeout(Duration::from_secs(1), run)
        .await
        .expect("controller must exit promptly, not wait out the timer")
        .unwrap();
    assert_eq!(end, ControllerEnd::Shutdown);
}
