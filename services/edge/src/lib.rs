pub mod forward;
pub mod state;
pub mod ws_connect;

pub use state::AppState;

use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};

/// Assemble the edge router: `/health`, the `/connect` control-channel
/// endpoint, and the catch-all forward path for everything else.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/connect", get(ws_connect::ws_connect_handler))
        .fallback(forward::forward)
        .with_state(state)
}

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let tunnel = state.status().await;
    Json(serde_json::json!({ "status": "ok", "tunnel": tunnel }))
}
