//! Main Entrypoint for the Chat Bridge
//!
//! This binary is responsible for:
//! 1. Loading configuration from the environment.
//! 2. Connecting to the directory database and resetting every agent to offline.
//! 3. Building the vendor API client and the bus connection.
//! 4. Starting the orchestrator and feeding it from the bus subscriptions.
//! 5. Draining every session on shutdown.

use anyhow::Context;
use chatbridge::{
    bus::{NatsBus, pump_commands, pump_lifecycle},
    config::Config,
    db::Db,
    orchestrator::Orchestrator,
    state::BridgeState,
    vendor::VendorApi,
    ws::TungsteniteConnector,
};
use chatbridge_core::{directory::Directory, protocol::ClientIdentity};
use secrecy::ExposeSecret;
use sqlx::mysql::MySqlPoolOptions;
use std::sync::Arc;
use tracing::info;

/// Listens for the `Ctrl+C` signal to shut down gracefully.
async fn shutdown_signal() {
    tokio::signal::ctrl_c()
        .await
        .expect("Failed to install Ctrl+C handler");
    info!("Received shutdown signal. Draining sessions...");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // --- 1. Load Configuration ---
    let config = Config::from_env().context("Failed to load configuration")?;

    // --- 2. Initialize Logging ---
    tracing_subscriber::fmt()
        .with_max_level(config.log_level)
        .with_timer(tracing_subscriber::fmt::time::ChronoLocal::rfc_3339())
        .init();
    info!("Configuration loaded. Initializing bridge...");

    // --- 3. Initialize Directory ---
    let pool = MySqlPoolOptions::new()
        .connect(config.database_url.expose_secret())
        .await
        .context("Failed to connect to database")?;
    let db = Arc::new(Db::new(pool));
    db.mark_all_offline()
        .await
        .context("Failed to reset agent statuses")?;
    info!("Database connection established and all agents marked offline.");

    // --- 4. Initialize Vendor Client and Bus ---
    let vendor = Arc::new(VendorApi::new(config.vendor.clone())?);
    let bus = Arc::new(NatsBus::connect(&config.nats_url, config.subjects.outbound.clone()).await?);

    let state = Arc::new(BridgeState {
        directory: db,
        identity: vendor.clone(),
        media: vendor,
        publisher: bus.clone(),
        connector: Arc::new(TungsteniteConnector::new(config.session.socket_path.clone())),
        settings: Arc::new(config.session.clone()),
        client_identity: ClientIdentity::default(),
    });

    // --- 5. Start Orchestrator and Bus Consumers ---
    let (orchestrator, handle) = Orchestrator::new(state);
    let control_loop = tokio::spawn(orchestrator.run());

    let lifecycle = bus.payloads(&config.subjects.lifecycle).await?;
    let commands = bus.payloads(&config.subjects.command).await?;
    tokio::spawn(pump_lifecycle(lifecycle, handle.clone()));
    tokio::spawn(pump_commands(commands, handle.clone()));

    info!(
        nats = %config.nats_url,
        site_id = config.vendor.site_id,
        "Bridge started. Waiting for agents..."
    );

    // --- 6. Drain on Shutdown ---
    shutdown_signal().await;
    handle.shutdown().await?;
    control_loop.await?;

    info!("Bridge has shut down.");
    Ok(())
}
