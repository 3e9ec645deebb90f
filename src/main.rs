#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! # towers-tunnel
//!
//! Relays HTTP requests to devices that have no public address. Each device
//! holds a WebSocket open to the relay and registers an identifier; requests
//! to `/{identifier}/...` are wrapped in JSON envelopes, sent down that
//! socket, and the device's reply is returned to the caller.
//!
//! ## Subcommands
//!
//! - `towers-tunnel serve` (default) — run the relay
//! - `towers-tunnel agent` — run the device side against a local upstream
//!
//! ## HTTP surface
//!
//! | Method | Path                      | Description                              |
//! |--------|---------------------------|------------------------------------------|
//! | GET    | `/`                       | HTML list of registered tunnels          |
//! | ANY    | `/{id}`, `/{id}/{*path}`  | Relayed to device `id` (502 / 504 on failure) |
//! | GET    | any path + `Upgrade: websocket` | Device channel                     |

use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use towers_tunnel::config::{AgentConfig, Config};
use towers_tunnel::tunnel::{agent, relay};

/// HTTP-over-WebSocket relay for devices without a public address.
#[derive(Parser)]
#[command(name = "towers-tunnel", version)]
struct Cli {
    /// Path to TOML config file.
    #[arg(long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the relay (default when no subcommand given).
    Serve,
    /// Connect to a relay and answer its requests from a local service.
    Agent {
        /// Relay WebSocket URL, e.g. `ws://relay:8091/`.
        #[arg(long)]
        url: Option<String>,
        /// Identifier to register under.
        #[arg(long)]
        id: Option<String>,
        /// Local HTTP base URL requests are forwarded to.
        #[arg(long)]
        upstream: Option<String>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match Config::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("towers-tunnel: {e}");
            return ExitCode::FAILURE;
        }
    };

    // Initialize tracing
    let log_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| config.logging.level.clone());
    tracing_subscriber::fmt().with_env_filter(log_filter).init();

    match cli.command {
        None | Some(Commands::Serve) => run_relay(config).await,
        Some(Commands::Agent { url, id, upstream }) => {
            let mut agent_config = config
                .agent
                .unwrap_or_else(|| AgentConfig::new(String::new(), String::new()));
            if let Some(url) = url {
                agent_config.url = url;
            }
            if let Some(id) = id {
                agent_config.id = id;
            }
            if let Some(upstream) = upstream {
                agent_config.upstream = upstream;
            }
            run_agent(agent_config).await
        }
    }
}

async fn run_relay(config: Config) -> ExitCode {
    info!("towers-tunnel v{} starting", env!("CARGO_PKG_VERSION"));
    info!(
        "Request timeout: {}s, max body: {} bytes",
        config.tunnel.request_timeout_secs, config.server.max_body_bytes
    );

    let relay_state = relay::RelayState::from_config(&config);
    let app = relay::relay_router(relay_state.clone()).layer(TraceLayer::new_for_http());

    let listener = match TcpListener::bind(&config.server.listen).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("Failed to bind {}: {e}", config.server.listen);
            return ExitCode::FAILURE;
        }
    };
    info!("Listening on {}", config.server.listen);

    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
    {
        error!("Server error: {e}");
        return ExitCode::FAILURE;
    }

    info!(
        tunnels = relay_state.registry.len(),
        "Shutting down, dropping remaining tunnels"
    );
    info!("Goodbye");
    ExitCode::SUCCESS
}

async fn run_agent(config: AgentConfig) -> ExitCode {
    if config.url.is_empty() || config.id.is_empty() {
        error!("Agent needs a relay url and an id (--url/--id, [agent] or TOWERS_AGENT_*)");
        return ExitCode::FAILURE;
    }
    info!(
        "towers-tunnel agent v{} starting, id {}, upstream {}",
        env!("CARGO_PKG_VERSION"),
        config.id,
        config.upstream
    );

    tokio::select! {
        result = agent::run(config) => match result {
            Ok(()) => ExitCode::SUCCESS,
            Err(e) => {
                error!("Agent stopped: {e}");
                ExitCode::FAILURE
            }
        },
        () = shutdown_signal() => {
            info!("Goodbye");
            ExitCode::SUCCESS
        }
    }
}

/// Resolve on SIGINT, or SIGTERM on unix.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for SIGINT: {e}");
            std::future::pending::<()>().await;
        }
    };
    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    () = ctrl_c => info!("Received SIGINT"),
                    _ = sigterm.recv() => info!("Received SIGTERM"),
                }
            }
            Err(e) => {
                error!("Failed to register SIGTERM: {e}");
                ctrl_c.await;
                info!("Received SIGINT");
            }
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await;
        info!("Received SIGINT");
    }
}
