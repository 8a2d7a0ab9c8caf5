//! meridian-masterd — service-discovery broker daemon.
//!
//! Binds a unix socket, admits authenticating nodes, and serves the topic
//! directory until SIGINT/SIGTERM.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use meridian_masterd::{Master, MasterConfig};
use tokio::signal::unix::{SignalKind, signal};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Service-discovery broker for meridian nodes.
#[derive(Parser, Debug)]
#[command(name = "meridian-masterd")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to the TOML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Listening socket path (overrides the config file).
    #[arg(long)]
    socket: Option<PathBuf>,

    /// Admission secret (overrides the config file).
    #[arg(long)]
    secret: Option<String>,

    /// Log level filter (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(args.log_level.clone())),
        )
        .init();

    let mut config = match &args.config {
        Some(path) => MasterConfig::load(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => MasterConfig::default(),
    };
    if let Some(socket) = args.socket {
        config.socket_path = socket;
    }
    if let Some(secret) = args.secret {
        config.secret = secret;
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building runtime")?;
    runtime.block_on(serve(config))
}

async fn serve(config: MasterConfig) -> Result<()> {
    let master = Arc::new(Master::new(config));

    let mut runner = {
        let master = Arc::clone(&master);
        tokio::spawn(async move { master.run().await })
    };

    let mut sigint = signal(SignalKind::interrupt()).context("installing SIGINT handler")?;
    let mut sigterm = signal(SignalKind::terminate()).context("installing SIGTERM handler")?;
    tokio::select! {
        _ = sigint.recv() => info!("SIGINT received; shutting down"),
        _ = sigterm.recv() => info!("SIGTERM received; shutting down"),
        // The broker stopping on its own (e.g. a bind failure) is the
        // other way out.
        result = &mut runner => return flatten(result),
    }

    master.shutdown();
    flatten(runner.await)
}

fn flatten(
    result: std::result::Result<std::result::Result<(), meridian_masterd::MasterError>, tokio::task::JoinError>,
) -> Result<()> {
    match result {
        Ok(Ok(())) => Ok(()),
        Ok(Err(err)) => {
            error!(error = %err, "master exited with an error");
            Err(err.into())
        }
        Err(join_err) => Err(anyhow::anyhow!("master task panicked: {join_err}")),
    }
}
