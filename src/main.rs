//! secure-server: a health-check service exposed over HTTP and HTTPS.
//!
//! This is the binary entry point. It initializes tracing, loads configuration
//! from a TOML file (with command-line overrides), builds the router, and runs
//! the server until SIGTERM/SIGINT has drained both listeners.

use std::path::Path;

use axum::routing::get;
use axum::Router;
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use secure_server::config::{FileConfig, DEFAULT_CONFIG_PATH, DEFAULT_LOG_FILTER};
use secure_server::{DrainError, SecureServer};

/// secure-server: HTTP and HTTPS with automatic certificates
#[derive(Parser, Debug)]
#[command(name = "secure-server", version, about)]
struct Args {
    /// Path to configuration file (default: config/default.toml, if present)
    #[arg(short, long)]
    config: Option<String>,

    /// Log level filter (e.g., "secure_server=debug,tower_http=info")
    #[arg(short, long)]
    log_level: Option<String>,

    /// Hostname to serve certificates for (repeatable, replaces the file's list)
    #[arg(long = "hostname")]
    hostnames: Vec<String>,

    /// Plain HTTP port, e.g. "80" or ":80"
    #[arg(long)]
    http_port: Option<String>,

    /// HTTPS port, e.g. "443" or ":443"
    #[arg(long)]
    https_port: Option<String>,

    /// Serve plain HTTP only (local development)
    #[arg(long)]
    no_tls: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Parse command line arguments
    let args = Args::parse();

    // An explicit --config must exist; the default path is optional
    let mut config = match &args.config {
        Some(path) => FileConfig::load(path)?,
        None if Path::new(DEFAULT_CONFIG_PATH).exists() => FileConfig::load(DEFAULT_CONFIG_PATH)?,
        None => FileConfig::default(),
    };
    if !args.hostnames.is_empty() {
        config.hostnames = args.hostnames.clone();
    }
    if let Some(port) = args.http_port {
        config.http_port = port;
    }
    if let Some(port) = args.https_port {
        config.https_port = port;
    }
    if args.no_tls {
        config.tls = false;
    }

    // Initialize tracing with priority: CLI > env > default
    let log_filter = args
        .log_level
        .or_else(|| std::env::var("RUST_LOG").ok())
        .unwrap_or_else(|| DEFAULT_LOG_FILTER.to_string());
    let json = config.logging.format == "json";

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(&log_filter))
        .with(json.then(|| tracing_subscriber::fmt::layer().json()))
        .with((!json).then(|| tracing_subscriber::fmt::layer()))
        .init();

    // Used by the ACME client as well as the HTTPS listener
    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

    tracing::info!(
        hosts = ?config.hostnames,
        tls = config.tls,
        production = config.acme.production,
        cache = %config.acme.cache_dir,
        "Loaded configuration"
    );
    if config.tls && !config.acme.production {
        tracing::warn!(
            "Using Let's Encrypt staging environment - certificates will NOT be trusted by browsers. \
             Set acme.production = true for production use."
        );
    }

    let app = Router::new().route("/healthcheck", get(healthcheck));

    let mut server_config = config.into_server_config(app);
    server_config.drain_error_handler = Some(std::sync::Arc::new(|err: &DrainError| {
        tracing::error!(error = %err, "Connections were cut off during shutdown");
    }));

    let server = SecureServer::new(server_config)?;
    server.listen_and_serve().await?;

    tracing::info!("Shutdown complete");
    Ok(())
}

/// Liveness probe.
async fn healthcheck() -> &'static str {
    "Im alive!"
}
