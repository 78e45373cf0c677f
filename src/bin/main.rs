//! hyprmirror binary.
//!
//! Runs the cluster-local image mirror on a node.

use anyhow::Context;
use clap::{Parser, Subcommand};
use hyprmirror_core::config::RegistryArgs;
use hyprmirror_core::{init_tracing, MirrorConfig, MirrorService};
use tokio_util::sync::CancellationToken;
use tracing::info;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the mirror: overlay router, state tracker and registry endpoint
    Registry(RegistryArgs),
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Registry(args) => {
            let config = MirrorConfig::load(&args).context("failed to load configuration")?;
            init_tracing(&config.log_level).context("failed to initialize logging")?;
            info!(version = hyprmirror_core::VERSION, "hyprmirror starting up");

            let service = MirrorService::new(config);
            let cancel = service.cancellation_token();
            tokio::spawn(shutdown_on_signal(cancel));

            service.run().await.context("mirror failed")?;
        }
    }

    Ok(())
}

/// Cancel `cancel` on Ctrl-C or SIGTERM
async fn shutdown_on_signal(cancel: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received Ctrl-C"),
        _ = terminate => info!("received SIGTERM"),
    }
    cancel.cancel();
}
