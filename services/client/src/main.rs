// outpost: Tunnel client CLI.
//
// `outpost init <url>`  — configure the edge domain
// `outpost status`      — show configured domain and connection state
// `outpost [PORT]`      — open the tunnel for a local port (default 3000)

use chrono::{DateTime, Utc};
use clap::{Args, Parser, Subcommand};
use client::config::{ConfigError, ConfigStore};
use client::reconnect::{BackoffPolicy, ControllerEnd, ReconnectController};
use client::session::SessionConfig;
use tokio::sync::watch;
use tracing::info;

const DEFAULT_LOCAL_PORT: u16 = 3000;

#[derive(Parser)]
#[command(name = "outpost", version)]
#[command(about = "Expose a local HTTP service through a public edge server")]
#[command(args_conflicts_with_subcommands = true)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
    #[command(flatten)]
    run: RunArgs,
}

#[derive(Subcommand)]
enum Command {
    /// Point the client at an edge server and persist the configuration.
    Init {
        /// Public base URL of the edge server (http:// or https://).
        url: String,
    },
    /// Show the configured domain and current connection state.
    Status,
}

#[derive(Args)]
struct RunArgs {
    /// Port of the local HTTP service to expose.
    #[arg(value_name = "PORT")]
    port: Option<u16>,
    /// Same as the positional PORT.
    #[arg(long = "port", value_name = "PORT", conflicts_with = "port")]
    port_flag: Option<u16>,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let store = ConfigStore::open_default();

    let code = match cli.command {
        Some(Command::Init { url }) => cmd_init(&store, &url),
        Some(Command::Status) => cmd_status(&store),
        None => cmd_run(&store, &cli.run).await,
    };
    std::process::exit(code);
}

fn cmd_init(store: &ConfigStore, url: &str) -> i32 {
    match store.init(url) {
        Ok(config) => {
            println!("Tunnel domain set to {}", config.domain);
            0
        }
        Err(e) => {
            eprintln!("error: {}", e);
            1
        }
    }
}

fn cmd_status(store: &ConfigStore) -> i32 {
    let config = match store.load() {
        Ok(config) => config,
        Err(ConfigError::NotConfigured) => {
            println!("Not configured. Run `outpost init <url>` first.");
            return 0;
        }
        Err(e) => {
            eprintln!("error: {}", e);
            return 0;
        }
    };

    println!("Domain:    {}", config.domain);
    match store.read_status() {
        Ok(Some(status)) if status.connected => {
            println!("State:     connected");
            println!("Port:      {}", status.port);
            match DateTime::parse_from_rfc3339(&status.connected_at) {
                Ok(connected_at) => {
                    let uptime = Utc::now().signed_duration_since(connected_at);
                    let seconds = uptime.num_seconds().max(0) as u64;
                    println!("Uptime:    {}", format_uptime(seconds));
                }
                Err(_) => println!("Uptime:    unknown"),
            }
        }
        _ => println!("State:     disconnected"),
    }
    0
}

async fn cmd_run(store: &ConfigStore, run: &RunArgs) -> i32 {
    let config = match store.load() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("error: {}", e);
            return 1;
        }
    };
    let local_port = run.port.or(run.port_flag).unwrap_or(DEFAULT_LOCAL_PORT);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        info!("shutdown signal received");
        let _ = shutdown_tx.send(true);
    });

    let session_config = SessionConfig {
        domain: config.domain,
        local_port,
    };
    let controller = ReconnectController::new(BackoffPolicy::default());
    match controller.run(&session_config, store, shutdown_rx).await {
        ControllerEnd::Shutdown => 0,
        ControllerEnd::GaveUp | ControllerEnd::AlreadyRunning => 1,
    }
}

/// Render seconds as `1h 2m 3s`, dropping leading zero units.
fn format_uptime(total_seconds: u64) -> String {
    let hours = total_seconds / 3600;
    let minutes = (total_seconds % 3600) / 60;
    let seconds = total_seconds % 60;
    if hours > 0 {
        format!("{}h {}m {}s", hours, minutes, seconds)
    } else if minutes > 0 {
        format!("{}m {}s", minutes, seconds)
    } else {
        format!("{}s", seconds)
    }
}
