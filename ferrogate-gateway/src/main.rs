//! # Ferrogate Binary
//!
//! Entry point for the gateway server: parse arguments, initialize
//! logging, load and validate configuration, compose the gateway and serve
//! until a shutdown signal arrives. On shutdown, in-flight requests drain
//! within the configured grace period before the process exits.
//!
//! ```bash
//! ferrogate-gateway --config config.toml
//! ferrogate-gateway --config config.toml --port 8080 --log-level debug
//! ```

use clap::Parser;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

use ferrogate_gateway::config::LogFormat;
use ferrogate_gateway::{build_gateway, GatewayConfig};

/// Command line arguments. Values given here override both the file and
/// the environment.
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the TOML configuration file.
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    /// Override the host address to bind.
    #[arg(long)]
    host: Option<String>,

    /// Override the port to listen on.
    #[arg(short, long)]
    port: Option<u16>,

    /// Override the logging level (trace, debug, info, warn, error).
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = GatewayConfig::load(&args.config)?;
    if let Some(host) = args.host {
        config.server.host = host;
    }
    if let Some(port) = args.port {
        config.server.port = port;
    }
    if let Some(level) = args.log_level {
        config.logging.level = level;
    }

    init_tracing(&config);

    let host = config.server.host.clone();
    let port = config.server.port;
    let (app, orchestrator) = build_gateway(config).await?;

    let addr = SocketAddr::new(host.parse()?, port);
    let listener = match TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(err) => {
            // A port we cannot bind is fatal; everything else already
            // degraded gracefully during startup.
            orchestrator.mark_failed();
            return Err(anyhow::anyhow!("cannot bind {addr}: {err}"));
        }
    };
    tracing::info!(%addr, "ferrogate gateway listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    orchestrator.shutdown().await;
    Ok(())
}

fn init_tracing(config: &GatewayConfig) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.logging.level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match config.logging.format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Pretty => builder.init(),
        LogFormat::Compact => builder.compact().init(),
    }
}

async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_err() {
        tracing::error!("cannot listen for shutdown signal; serving until killed");
        return std::future::pending::<()>().await;
    }
    tracing::info!("shutdown signal received");
}
