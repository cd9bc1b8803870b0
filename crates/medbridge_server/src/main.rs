//! MedBridge sync service binary.
//!
//! Wires the engine to its durable stores, starts the background sweep
//! scheduler, and serves the sync API until ctrl-c.

use anyhow::Context;
use clap::Parser;
use medbridge_engine::stores::{RestSecondaryStore, SqlitePrimaryStore};
use medbridge_engine::{EngineConfig, MappingCatalog, StateStore, SyncEngine};
use medbridge_server::{build_router, spawn_sweeper, AppState, ServerConfig, WebhookVerifier};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// MedBridge clinic-to-portal sync service.
#[derive(Parser)]
#[command(name = "medbridge")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the service configuration file
    #[arg(short, long, default_value = "medbridge.toml")]
    config: PathBuf,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = ServerConfig::load(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    config.validate()?;

    let catalog = Arc::new(
        MappingCatalog::load(&config.mapping_file)
            .with_context(|| format!("loading {}", config.mapping_file.display()))?,
    );
    let primary = Arc::new(SqlitePrimaryStore::open(&config.primary_db).await?);
    let secondary = Arc::new(RestSecondaryStore::new(
        config.portal_url.clone(),
        config.portal_api_key.clone(),
    )?);
    let state_store = Arc::new(StateStore::open(&config.state_db).await?);

    let engine = Arc::new(SyncEngine::new(
        primary,
        secondary,
        state_store,
        catalog,
        EngineConfig::new(),
    ));

    let verifier = match &config.webhook_secret {
        Some(secret) => WebhookVerifier::new(secret.clone().into_bytes()),
        None => WebhookVerifier::unsigned(),
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let sweeper = spawn_sweeper(engine.clone(), config.sweep_interval, shutdown_rx);

    let router = build_router(AppState {
        engine: engine.clone(),
        verifier,
    });

    let listener = tokio::net::TcpListener::bind(config.bind_addr).await?;
    info!(addr = %config.bind_addr, "medbridge listening");
    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    let _ = shutdown_tx.send(true);
    let _ = sweeper.await;
    engine.close().await;
    info!("medbridge stopped");
    Ok(())
}
