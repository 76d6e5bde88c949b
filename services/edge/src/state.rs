//! Shared edge state: the single active-tunnel slot and the per-registration
//! in-flight request table.
//!
//! The channel read loop owns frame demultiplexing; per-request tasks own
//! their mailbox receivers.  The in-flight table maps request id to the
//! mailbox sender, so routing an inbound frame is one map lookup.

use op_protocol::Frame;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, RwLock, mpsc};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Default deadline for an in-flight request, measured from record creation.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// The tunnel side of the channel went away before the frame could be queued.
#[derive(Debug, thiserror::Error)]
#[error("tunnel channel closed")]
pub struct TunnelGone;

type InflightTable = Arc<Mutex<HashMap<String, mpsc::Sender<Frame>>>>;

/// Handle to one registered tunnel.
///
/// Clones share the outbound frame queue, the in-flight table, and the
/// cancellation token; the channel loop holds the receiving ends.
#[derive(Clone)]
pub struct TunnelHandle {
    registration_id: Uuid,
    port: u16,
    connected_at: Instant,
    frame_tx: mpsc::Sender<Frame>,
    inflight: InflightTable,
    cancel: CancellationToken,
}

impl TunnelHandle {
    pub fn new(port: u16, frame_tx: mpsc::Sender<Frame>) -> Self {
        Self {
            registration_id: Uuid::new_v4(),
            port,
            connected_at: Instant::now(),
            frame_tx,
            inflight: Arc::new(Mutex::new(HashMap::new())),
            cancel: CancellationToken::new(),
        }
    }

    pub fn registration_id(&self) -> Uuid {
        self.registration_id
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn uptime(&self) -> Duration {
        self.connected_at.elapsed()
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Ask the channel loop that owns this registration to shut down.
    pub fn close(&self) {
        self.cancel.cancel();
    }

    /// Queue a frame for the channel loop to write.  All writers share one
    /// queue, so frames never interleave on the socket.
    pub async fn send_frame(&self, frame: Frame) -> Result<(), TunnelGone> {
        self.frame_tx.send(frame).await.map_err(|_| TunnelGone)
    }

    pub async fn track_request(&self, id: &str, mailbox: mpsc::Sender<Frame>) {
        self.inflight.lock().await.insert(id.to_owned(), mailbox);
    }

    pub async fn untrack_request(&self, id: &str) {
        self.inflight.lock().await.remove(id);
    }

    /// Route an inbound frame to the request's mailbox.
    ///
    /// Returns false when the id is unknown (already reaped, or never ours) —
    /// callers drop the frame.
    pub async fn route_frame(&self, id: &str, frame: Frame) -> bool {
        let mailbox = { self.inflight.lock().await.get(id).cloned() };
        match mailbox {
            Some(tx) => tx.send(frame).await.is_ok(),
            None => false,
        }
    }

    /// Drop every mailbox sender so pending request tasks observe the
    /// channel closing immediately.
    pub async fn abort_inflight(&self) {
        self.inflight.lock().await.clear();
    }

    pub async fn inflight_len(&self) -> usize {
        self.inflight.lock().await.len()
    }
}

/// Tunnel status as reported by `/health`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TunnelStatus {
    pub connected: bool,
    pub port: Option<u16>,
    pub uptime_ms: Option<u64>,
}

#[derive(Clone)]
pub struct AppState {
    active_tunnel: Arc<RwLock<Option<TunnelHandle>>>,
    request_timeout: Duration,
}

impl AppState {
    pub fn new() -> Self {
        Self::with_request_timeout(DEFAULT_REQUEST_TIMEOUT)
    }

    pub fn with_request_timeout(request_timeout: Duration) -> Self {
        Self {
            active_tunnel: Arc::new(RwLock::new(None)),
            request_timeout,
        }
    }

    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    pub async fn active_tunnel(&self) -> Option<TunnelHandle> {
        self.active_tunnel.read().await.clone()
    }

    /// Install a new registration, returning the one it displaced (if any).
    /// The caller closes the displaced handle; its channel loop fails its own
    /// in-flight requests on the way out.
    pub async fn install_tunnel(&self, handle: TunnelHandle) -> Option<TunnelHandle> {
        self.active_tunnel.write().await.replace(handle)
    }

    /// Clear the slot, but only if it still holds `registration_id` — a
    /// replaced loop must not tear down its successor.
    pub async fn clear_tunnel(&self, registration_id: Uuid) -> bool {
        let mut slot = self.active_tunnel.write().await;
        match slot.as_ref() {
            Some(current) if current.registration_id() == registration_id => {
                *slot = None;
                true
            }
            _ => false,
        }
    }

    pub async fn status(&self) -> TunnelStatus {
        match self.active_tunnel.read().await.as_ref() {
            Some(tunnel) => TunnelStatus {
                connected: true,
                port: Some(tunnel.port()),
                uptime_ms: Some(tunnel.uptime().as_millis() as u64),
            },
            None => TunnelStatus {
                connected: false,
                port: None,
                uptime_ms: None,
            },
        }
    }
}

impl Default for AppState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle(port: u16) -> TunnelHandle {
        let (tx, _rx) = mpsc::channel(8);
        TunnelHandle::new(port, tx)
    }

    #[tokio::test]
    async fn install_replaces_and_returns_previous_registration() {
        let state = AppState::new();
        assert!(state.install_tunnel(handle(5000)).await.is_none());

        let displaced = state.install_tunnel(handle(6000)).await;
        assert_eq!(displaced.map(|h| h.port()), Some(5000));
        assert_eq!(state.status().await.port, Some(6000));
    }

    #[tokio::test]
    async fn clear_only_removes_matching_registration() {
        let state = AppState::new();
        let first = handle(5000);
        let first_id = first.registration_id();
        state.install_tunnel(first).await;
        state.install_tunnel(handle(6000)).await;

        // The displaced loop unregistering itself must be a no-op.
        assert!(!state.clear_tunnel(first_id).await);
        assert!(state.status().await.connected);

        let current_id = state.active_tunnel().await.map(|h| h.registration_id());
        assert!(state.clear_tunnel(current_id.expect("active")).await);
        assert!(!state.status().await.connected);
    }

    #[tokio::test]
    async fn status_reports_disconnected_slot() {
        let state = AppState::new();
        assert_eq!(
            state.status().await,
            TunnelStatus {
                connected: false,
                port: None,
                uptime_ms: None,
            }
        );
    }

    #[tokio::test]
    async fn route_frame_reaches_tracked_mailbox_and_drops_unknown_ids() {
        let tunnel = handle(5000);
        let (mailbox_tx, mut mailbox_rx) = mpsc::channel(8);
        tunnel.track_request("r1", mailbox_tx).await;

        let frame = Frame::End(op_protocol::BodyEnd {
            id: "r1".to_owned(),
            direction: None,
        });
        assert!(tunnel.route_frame("r1", frame.clone()).await);
        assert_eq!(mailbox_rx.recv().await, Some(frame.clone()));

        assert!(!tunnel.route_frame("nope", frame).await);

        tunnel.untrack_request("r1").await;
        assert_eq!(tunnel.inflight_len().await, 0);
    }

    #[tokio::test]
    async fn abort_inflight_closes_every_mailbox() {
        let tunnel = handle(5000);
        let (tx_a, mut rx_a) = mpsc::channel(8);
        let (tx_b, mut rx_b) = mpsc::channel(8);
        tunnel.track_request("a", tx_a).await;
        tunnel.track_request("b", tx_b).await;

        tunnel.abort_inflight().await;
        assert_eq!(rx_a.recv().await, None);
        assert_eq!(rx_b.recv().await, None);
        assert_eq!(tunnel.inflight_len().await, 0);
    }
}
