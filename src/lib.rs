use anyhow::Context;
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::{debug, info};

pub mod application;
pub mod auth;
pub mod claims;
pub mod config;
pub mod credentials;
pub mod database;
pub mod error;
pub mod middleware;
pub mod scheduler;
pub mod server;
pub mod session;

use application::Application;
use config::OutpostConfig;
use server::ProxyServer;

/// Build one application per configured provider
pub async fn build_applications(config: &OutpostConfig) -> anyhow::Result<Vec<Application>> {
    let mut applications = Vec::with_capacity(config.providers.len());
    for provider in &config.providers {
        debug!(
            provider = %provider.name,
            mode = ?provider.mode,
            backend = ?config.storage.backend,
            "Creating application"
        );
        let app = Application::new(provider.clone(), &config.outpost, &config.storage)
            .await
            .with_context(|| format!("failed to set up provider {}", provider.name))?;
        applications.push(app);
    }
    Ok(applications)
}

/// Build the front door for `config`
pub async fn build_server(config: &OutpostConfig) -> anyhow::Result<Arc<ProxyServer>> {
    let server = Arc::new(ProxyServer::new());
    server.set_providers(build_applications(config).await?).await;
    Ok(server)
}

/// Run the outpost until `shutdown_rx` fires
pub async fn start_server_with_config(
    config: OutpostConfig,
    shutdown_rx: oneshot::Receiver<()>,
) -> anyhow::Result<()> {
    let addr = config
        .server
        .listen_addr()
        .context("invalid listen address")?;
    let server = build_server(&config).await?;
    info!(
        outpost = %config.outpost.name,
        providers = config.providers.len(),
        "Outpost configured"
    );
    server.serve(addr, shutdown_rx).await
}
