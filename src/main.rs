use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use rescache::server::Server;
use rescache::{CacheConfig, CacheManager};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Caching HTTP/1.1 proxy with versioned, strategy-routed cache namespaces.
#[derive(Debug, Parser)]
#[command(name = "rescache", version, about)]
struct Args {
    /// JSON configuration file. Defaults apply to anything it omits.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Address to listen on.
    #[arg(short, long, default_value = "127.0.0.1:8080")]
    listen: SocketAddr,

    /// Emit logs as JSON lines.
    #[arg(long)]
    json_logs: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if args.json_logs {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    info!("Starting rescache v{}", env!("CARGO_PKG_VERSION"));

    let config = match &args.config {
        Some(path) => CacheConfig::from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => CacheConfig::default(),
    };
    info!(
        app = %config.app_tag,
        version = %config.version,
        origin = %config.origin,
        "configuration loaded"
    );
    config.check_listener(args.listen)?;

    let manager = Arc::new(CacheManager::with_http(config)?);
    if let Err(e) = manager.start().await {
        // Requests still pass through to the network.
        error!(error = %e, "install failed, serving without a cache");
    }
    let control = manager.spawn_control_loop();

    let interrupted = async {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("interrupt received"),
            Err(e) => {
                error!(error = %e, "cannot listen for interrupts");
                std::future::pending::<()>().await;
            }
        }
    };
    let server = Server::bind(args.listen.to_string()).await?;
    server
        .serve_until(Arc::clone(&manager), control, interrupted)
        .await?;

    // Connections are drained; no request can start new background work.
    manager.shutdown().await;
    Ok(())
}
