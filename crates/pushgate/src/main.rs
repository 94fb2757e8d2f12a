//! # pushgate
//!
//! Push-messaging server binary: loads settings, starts logging and metrics,
//! and serves the WebSocket and send routes until Ctrl-C.

#![deny(unsafe_code)]

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use pushgate_server::config::ServerConfig;
use pushgate_server::server::PushServer;
use pushgate_settings::{PushSettings, ServerSettings};

/// Push-messaging WebSocket server.
#[derive(Parser, Debug)]
#[command(name = "pushgate", about = "Push-messaging WebSocket server")]
struct Cli {
    /// Host to bind (overrides settings).
    #[arg(long)]
    host: Option<String>,

    /// Port to bind, 0 for auto-assign (overrides settings).
    #[arg(long)]
    port: Option<u16>,

    /// Route clients connect to (overrides settings).
    #[arg(long)]
    ws_path: Option<String>,

    /// Route messages are posted to (overrides settings).
    #[arg(long)]
    send_path: Option<String>,

    /// Maximum concurrent connections (overrides settings).
    #[arg(long)]
    max_connections: Option<usize>,

    /// Settings file (default `~/.pushgate/settings.json`).
    #[arg(long)]
    settings: Option<PathBuf>,
}

impl Cli {
    fn apply(&self, server: &mut ServerSettings) {
        if let Some(host) = &self.host {
            server.host.clone_from(host);
        }
        if let Some(port) = self.port {
            server.port = port;
        }
        if let Some(path) = &self.ws_path {
            server.ws_path.clone_from(path);
        }
        if let Some(path) = &self.send_path {
            server.send_path.clone_from(path);
        }
        if let Some(max) = self.max_connections {
            server.max_connections = max;
        }
    }
}

fn server_config(settings: &ServerSettings) -> ServerConfig {
    ServerConfig {
        host: settings.host.clone(),
        port: settings.port,
        ws_path: settings.ws_path.clone(),
        send_path: settings.send_path.clone(),
        max_connections: settings.max_connections,
        heartbeat_interval: Duration::from_millis(settings.heartbeat_interval_ms),
        heartbeat_timeout: Duration::from_millis(settings.heartbeat_timeout_ms),
        write_timeout: Duration::from_millis(settings.write_timeout_ms),
        read_buffer_size: settings.read_buffer_size,
        write_buffer_size: settings.write_buffer_size,
        max_message_size: settings.max_message_size,
        allowed_origins: settings.allowed_origins.clone(),
    }
}

fn load(cli: &Cli) -> Result<PushSettings> {
    let path = cli
        .settings
        .clone()
        .unwrap_or_else(pushgate_settings::settings_path);
    let mut settings = pushgate_settings::load_settings_from_path(&path)
        .with_context(|| format!("Failed to load settings from {}", path.display()))?;
    cli.apply(&mut settings.server);
    Ok(settings)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = load(&cli)?;
    pushgate_logging::init_from_settings(&settings.logging);

    let metrics = pushgate_server::metrics::install_recorder()
        .context("Failed to install metrics recorder")?;
    let server = PushServer::new(server_config(&settings.server), metrics)
        .context("Invalid server configuration")?;
    let (addr, serve) = server.listen().await.context("Failed to start server")?;
    tracing::info!(%addr, "pushgate ready");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    tracing::info!("shutdown signal received");

    let drained = server.shutdown().graceful_shutdown(serve, None).await;
    tracing::info!(
        drained,
        remaining = server.binder().connection_count(),
        "pushgate stopped"
    );
    Ok(())
}
