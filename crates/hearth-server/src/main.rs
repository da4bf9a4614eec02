//! hearth server binary
//!
//! Serves the storage control plane (local shares, network mounts,
//! favorites) as JSON-lines RPC on a local Unix socket.
//!
//! ## Usage
//!
//! ```bash
//! hearth-server                                  # config from $HEARTH_CONFIG or the default path
//! hearth-server --config /etc/hearth/storage.toml
//! hearth-server --socket /run/hearth/storage.sock
//!
//! echo '{"method":"shares.list"}' | socat - UNIX-CONNECT:/run/hearth/storage.sock
//! ```

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use hearth_storage::{StorageConfig, StorageService};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use hearth_server::constants::DEFAULT_LOG_FILTER;

/// Storage control plane for hearth.
#[derive(Parser, Debug)]
#[command(name = "hearth-server")]
#[command(about = "Local RPC server for hearth shares, network mounts and favorites")]
struct Args {
    /// Config file (TOML). Overrides $HEARTH_CONFIG.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// RPC socket path. Overrides `server.socket_path` from the config.
    #[arg(long)]
    socket: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();

    let args = Args::parse();

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> Result<()> {
    let mut config = StorageConfig::load(args.config.as_deref()).context("loading config")?;
    if let Some(socket) = args.socket {
        config.server.socket_path = socket;
    }
    let socket_path = config.server.socket_path.clone();

    let service = Arc::new(StorageService::system(config).context("opening storage")?);
    hearth_server::run(service, &socket_path, shutdown_signal()).await?;
    Ok(())
}

/// Resolves on SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "cannot listen for SIGINT");
            std::future::pending::<()>().await;
        }
    };

    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = ctrl_c => tracing::info!("received SIGINT"),
        _ = terminate => tracing::info!("received SIGTERM"),
    }
}
