// outpost-edge: Publicly reachable tunnel endpoint.
//
// Accepts HTTPS traffic (TLS is terminated upstream), forwards every request
// over the registered control channel, and serves /health.

use edge::AppState;
use tracing::info;

const DEFAULT_PORT: u16 = 3001;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let port = match std::env::var("PORT") {
        Ok(raw) => match raw.parse::<u16>() {
            Ok(port) => port,
            Err(_) => {
                eprintln!("FATAL: invalid PORT value '{}'", raw);
                std::process::exit(1);
            }
        },
        Err(_) => DEFAULT_PORT,
    };

    let state = AppState::new();
    let router = edge::build_router(state);

    let listener = match tokio::net::TcpListener::bind(("0.0.0.0", port)).await {
        Ok(listener) => listener,
        Err(e) => {
            eprintln!("FATAL: failed to bind port {}: {}", port, e);
            std::process::exit(1);
        }
    };

    info!(version = env!("CARGO_PKG_VERSION"), port, "edge listening");

    // SIGINT stops the listener; outstanding requests drain naturally,
    // bounded by the per-request deadline.
    let serve = axum::serve(listener, router).with_graceful_shutdown(shutdown_signal());
    if let Err(e) = serve.await {
        eprintln!("FATAL: server error: {}", e);
        std::process::exit(1);
    }
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("shutdown signal received");
}
