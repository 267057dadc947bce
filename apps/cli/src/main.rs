//! destproxy - authenticating reverse proxy for JSON-RPC upstreams.
//!
//! Listens for JSON-RPC over HTTP, resolves the request's destination into a
//! bearer token and forwards the call to the destination's service.

use anyhow::Context;
use clap::Parser;
use destproxy_core::{ConfigOverrides, ProxyConfig, ProxyServer};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// Authenticating reverse proxy for destination-scoped JSON-RPC upstreams.
#[derive(Parser, Debug)]
#[command(
    name = "destproxy",
    author,
    version,
    about = "Authenticating reverse proxy for JSON-RPC upstreams",
    long_about = "destproxy resolves the destination named in each request (x-btp-destination) \
                  into a bearer token, injects it and forwards the JSON-RPC call upstream."
)]
struct Args {
    /// Configuration file (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Interface to bind (overrides [server].host)
    #[arg(long)]
    host: Option<String>,

    /// Port to bind (overrides [server].port)
    #[arg(short, long)]
    port: Option<u16>,

    /// Destination applied to every request, taking precedence over headers
    #[arg(short, long)]
    destination: Option<String>,

    /// Target URL applied to every request, taking precedence over headers
    #[arg(long)]
    mcp_url: Option<String>,

    /// Log level (trace, debug, info, warn, error); RUST_LOG takes precedence
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Emit logs as JSON lines
    #[arg(long)]
    log_json: bool,
}

fn init_logging(level: &str, json: bool) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .with_context(|| format!("Invalid log level '{level}'"))?;

    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(false);
    let result = if json { builder.json().try_init() } else { builder.try_init() };
    result.map_err(|e| anyhow::anyhow!("Failed to initialize logging: {e}"))
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(&args.log_level, args.log_json)?;

    let mut config = match &args.config {
        Some(path) => ProxyConfig::load(path)
            .with_context(|| format!("Failed to load configuration from {}", path.display()))?,
        None => ProxyConfig::default(),
    };
    config.apply_overrides(ConfigOverrides {
        host: args.host,
        port: args.port,
        destination: args.destination,
        mcp_url: args.mcp_url,
    });
    config.validate().context("Invalid configuration")?;

    tracing::info!(
        host = %config.server.host,
        port = config.server.port,
        policy = ?config.routing.policy,
        destination = config.routing.destination.as_deref().unwrap_or("-"),
        mcp_url = config.routing.mcp_url.as_deref().unwrap_or("-"),
        "Starting destproxy"
    );

    let mut server = ProxyServer::from_config(&config)?;
    server
        .serve_until(&config.server.host, config.server.port, shutdown_signal())
        .await?;
    Ok(())
}
