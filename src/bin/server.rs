use anyhow::Context;
use clap::Parser;
use outpost::config::{LoggingConfig, OutpostConfig};
use outpost::start_server_with_config;
use std::path::PathBuf;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "outpost", version, about = "Authenticating reverse proxy")]
struct Args {
    /// Configuration file (TOML or YAML)
    #[arg(short, long)]
    config: Option<PathBuf>,
}

fn init_tracing(logging: &LoggingConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));
    let registry = tracing_subscriber::registry().with(filter);
    if logging.json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = OutpostConfig::load(args.config.as_deref()).context("failed to load configuration")?;
    init_tracing(&config.logging);

    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel();
    let mut server_task = tokio::spawn(start_server_with_config(config, shutdown_rx));

    tokio::select! {
        res = &mut server_task => {
            return res.context("server task panicked")?;
        }
        res = tokio::signal::ctrl_c() => {
            res.context("failed to listen for ctrl-c")?;
            tracing::info!("shutdown requested, stopping server...");
            let _ = shutdown_tx.send(());
        }
    }

    server_task.await.context("server task panicked")??;
    tracing::info!("server stopped");
    Ok(())
}
