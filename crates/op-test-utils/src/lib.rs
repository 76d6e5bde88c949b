// op-test-utils: Mock control-channel peers for integration testing.
//
// MockTunnelClient plays the tunnel-client side against a real edge;
// MockEdge plays the edge side for client/session tests.  Both speak the
// real frame vocabulary from op-protocol over tokio-tungstenite.

pub mod mock_edge;
pub mod mock_tunnel_client;

pub use mock_edge::{EdgeConn, MockEdge};
pub use mock_tunnel_client::{MockResponse, MockTunnelClient};

/// Boxed error used across the mocks; tests only care about Ok/Err.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;
