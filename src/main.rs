mod config;
mod events;
mod metadata;
mod mpris;
mod plugins;
mod rules;
mod server;
mod transform;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::{Arc, Mutex as StdMutex};

use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::Config;
use crate::mpris::BusListener;
use crate::plugins::PluginRegistry;
use crate::server::SocketServer;
use crate::transform::TransformEngine;

/// Bridge MPRIS players on the session bus to a length-prefixed Unix
/// socket protocol for status bars, overlays, and presence relays.
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Cli {
    /// Path to the configuration file (default:
    /// $XDG_CONFIG_HOME/mpris-relay/config.toml).
    #[arg(long)]
    config: Option<PathBuf>,
    /// Unix socket path override.
    #[arg(long)]
    socket: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(error = %err, "fatal error");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let mut config = Config::load(cli.config.as_deref())?;
    if let Some(socket) = cli.socket {
        config.socket_path = socket;
    }

    let plugins = PluginRegistry::with_builtins();
    for module in &config.plugin_paths {
        if !plugins.has_module(module) {
            warn!(
                module = module.as_str(),
                "configured plugin module is not registered, ignoring"
            );
        }
    }
    let engine = TransformEngine::compile(&config.ruleset, &plugins)?;
    if engine.is_empty() {
        info!("no metadata rules configured, metadata passes through untouched");
    }
    let engine = Arc::new(StdMutex::new(engine));
    if config.discord_rpc {
        info!("rich-presence flag is set; reserved, currently ignored");
    }

    let server = SocketServer::new(&config.socket_path)?;

    let conn = mpris::connection::session_connection().await?;
    let (listener, events_rx) = BusListener::new(
        (*conn).clone(),
        Arc::clone(&server),
        engine,
        config.excluded_players.clone(),
    );
    server.attach_metadata_source(&listener);
    server.start().await?;
    listener.spawn_dispatcher(events_rx);
    listener.watch_name_owners().await?;
    listener.discover_existing().await?;

    info!("application started, global listener active");
    wait_for_shutdown().await?;

    info!("shutting down");
    // Order matters: stop the server, detach the listeners, close the
    // bus last.
    server.stop().await;
    listener.disconnect_all().await;
    drop(conn);
    info!("shutdown complete");
    Ok(())
}

async fn wait_for_shutdown() -> std::io::Result<()> {
    use tokio::signal::unix::{SignalKind, signal};
    let mut sigterm = signal(SignalKind::terminate())?;
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
    Ok(())
}
