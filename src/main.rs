//! Chat Hub Server
//!
//! WebSocket broadcast hub. Every connected participant receives every chat
//! message along with join and leave announcements.

mod config;
mod hub;
mod server;

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use config::{HubConfig, CONFIG_FILE};
use server::WebSocketServer;

/// Chat Hub Server
///
/// WebSocket broadcast hub for chat participants
#[derive(Parser, Debug)]
#[command(name = "chat-hub")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to the TOML configuration file
    #[arg(short, long, default_value = CONFIG_FILE)]
    config: PathBuf,

    /// Port to listen on (overrides the config file)
    #[arg(short, long)]
    port: Option<u16>,

    /// Bind address (overrides the config file)
    #[arg(long)]
    bind: Option<String>,

    /// Enable verbose logging (ignored when RUST_LOG is set)
    #[arg(short, long)]
    verbose: bool,
}

impl Args {
    /// Apply command line overrides on top of the file configuration
    fn apply(&self, mut config: HubConfig) -> HubConfig {
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(bind) = &self.bind {
            config.bind = bind.clone();
        }
        config
    }

    /// Log directive used when RUST_LOG is not set
    fn default_log_directive(&self) -> &'static str {
        if self.verbose {
            "chat_hub=debug,info"
        } else {
            "info"
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(args.default_log_directive()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();

    info!("Chat Hub v{}", env!("CARGO_PKG_VERSION"));

    let config = args.apply(HubConfig::load(&args.config)?);

    let server = Arc::new(WebSocketServer::new(config));
    let server_handle = Arc::clone(&server);

    tokio::spawn(async move {
        let signal = shutdown_signal().await;
        info!("Received {}, disconnecting participants", signal);
        server_handle.shutdown();
    });

    server.run().await?;

    info!("Server shutdown complete");
    Ok(())
}

/// Resolve with the name of the first termination signal received
///
/// A signal that cannot be listened for is logged and never fires.
async fn shutdown_signal() -> &'static str {
    let interrupt = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("Cannot listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!("Cannot listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = interrupt => "SIGINT",
        _ = terminate => "SIGTERM",
    }
}
