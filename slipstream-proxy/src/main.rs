//! Slipstream reverse proxy.
//!
//! A single front door for a pool of weighted upstreams: smooth weighted
//! round-robin balancing, active health checking, per-client rate limiting
//! and TTL response caching.

use std::path::PathBuf;
use std::process::exit;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use slipstream_core::config::{Config, LoggingConfig};
use slipstream_core::Error;
use slipstream_proxy::server::ProxyServer;

/// Weighted reverse proxy with health-checked backends.
#[derive(Parser)]
#[command(name = "slipstream", version, about)]
struct Cli {
    /// Path to the YAML configuration file
    #[arg(short, long, default_value = "config.yaml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if !cli.config.exists() {
        eprintln!("config file not found: {}", cli.config.display());
        exit(1);
    }

    let config = match Config::load(&cli.config) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("failed to load config: {err}");
            exit(1);
        }
    };

    if let Err(err) = init_tracing(&config.logging) {
        eprintln!("failed to initialize logging: {err}");
        exit(1);
    }

    info!(
        version = env!("CARGO_PKG_VERSION"),
        config = %cli.config.display(),
        "starting slipstream"
    );

    let server = match ProxyServer::new(config) {
        Ok(server) => server,
        Err(err) => {
            error!(error = %err, "failed to build server");
            exit(2);
        }
    };

    let cancel = CancellationToken::new();
    let signal_token = cancel.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("received shutdown signal");
        signal_token.cancel();
    });

    if let Err(err) = server.run(cancel).await {
        error!(error = %err, "server error");
        exit(2);
    }

    info!("server stopped gracefully");
}

/// Install the subscriber described by the `logging` config section. An
/// explicit `RUST_LOG` takes precedence over the configured level.
fn init_tracing(config: &LoggingConfig) -> Result<(), Error> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(&config.level))
        .map_err(|e| Error::Config(format!("invalid log level {:?}: {e}", config.level)))?;

    let registry = tracing_subscriber::registry().with(filter);
    if config.format == "json" {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
    Ok(())
}

#[cfg(unix)]
async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(stream) => stream,
        Err(err) => {
            error!(error = %err, "failed to install SIGTERM handler");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
