//! agentmux - terminal session manager for AI coding agents
//!
//! Runs a headless server that hosts PTY-backed shell sessions and serves
//! them to browser/TUI clients over a WebSocket protocol. Sessions outlive
//! their viewers; the catalogue outlives the server process.

use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use agentmux::config::Config;
use agentmux::persist;
use agentmux::registry::Registry;
use agentmux::ws::{self, AppState};

/// agentmux - terminal session manager for AI coding agents
///
/// Hosts long-lived shell sessions that agents and humans share. Start the
/// server with `agentmux serve` (or no subcommand) and point clients at
/// the WebSocket endpoint.
#[derive(Parser, Debug)]
#[command(name = "agentmux", version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Address to bind the HTTP/WebSocket server (overrides config file)
    #[arg(long, env = "AGENTMUX_BIND")]
    bind: Option<SocketAddr>,

    /// Port to bind, keeping the configured address
    #[arg(long)]
    port: Option<u16>,

    /// Path to the config file
    #[arg(long, env = "AGENTMUX_CONFIG")]
    config: Option<PathBuf>,

    /// Directory for the durable session catalogue (overrides config file)
    #[arg(long)]
    state_dir: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the agentmux server (the default when no subcommand is given)
    Serve,

    /// Inspect configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigCommands {
    /// Print the config file path in effect
    Path,
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "agentmux=info,tower_http=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing();

    let config_path = cli
        .config
        .clone()
        .unwrap_or_else(Config::default_path);

    match cli.command {
        Some(Commands::Config {
            command: ConfigCommands::Path,
        }) => {
            println!("{}", config_path.display());
            Ok(())
        }
        Some(Commands::Serve) | None => run_serve(cli, config_path).await,
    }
}

/// Load the config file and fold the CLI overrides in on top.
fn resolve_config(cli: &Cli, config_path: &std::path::Path) -> anyhow::Result<Config> {
    let mut config = Config::load(config_path)
        .with_context(|| format!("loading config from {}", config_path.display()))?
        .unwrap_or_default();
    if let Some(bind) = cli.bind {
        config.bind = bind;
    }
    if let Some(port) = cli.port {
        config.bind.set_port(port);
    }
    if let Some(state_dir) = &cli.state_dir {
        config.state_dir = state_dir.clone();
    }
    Ok(config)
}

async fn run_serve(cli: Cli, config_path: PathBuf) -> anyhow::Result<()> {
    let config = resolve_config(&cli, &config_path)?;
    tracing::info!(
        config = %config_path.display(),
        worktrees_root = %config.worktrees_root.display(),
        "agentmux server starting"
    );

    let catalogue_path = config.catalogue_path();
    let restored = persist::load(&catalogue_path)
        .with_context(|| format!("loading catalogue from {}", catalogue_path.display()))?;

    let persist_tx = persist::spawn_writer(catalogue_path);
    let registry = Registry::new(config.clone(), Some(persist_tx));
    if let Some(catalogue) = restored {
        tracing::info!(
            sessions = catalogue.sessions.len(),
            tabs = catalogue.tabs.len(),
            "restoring catalogue"
        );
        registry.restore(catalogue);
    }

    let shutdown = CancellationToken::new();
    let app = ws::router(AppState::new(registry.clone(), shutdown.clone()));

    let listener = tokio::net::TcpListener::bind(config.bind)
        .await
        .with_context(|| format!("binding {}", config.bind))?;
    tracing::info!(addr = %config.bind, "HTTP/WS server listening");

    let serve_shutdown = shutdown.clone();
    let server_handle = tokio::spawn(async move {
        let result = axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                serve_shutdown.cancelled().await;
            })
            .await;
        if let Err(e) = result {
            tracing::error!(?e, "HTTP server error");
        }
    });

    tokio::signal::ctrl_c()
        .await
        .context("waiting for ctrl-c")?;
    tracing::info!("received ctrl-c, shutting down");

    // Close frames go out to connected clients, then the listener stops.
    shutdown.cancel();
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;

    let escalation = registry.drain();
    if let Err(e) = server_handle.await {
        tracing::warn!(?e, "HTTP server task panicked");
    }
    if let Some(handle) = escalation {
        let _ = handle.await;
    }

    tracing::info!("agentmux exiting");
    Ok(())
}
