//! # Muster Server
//!
//! Fleet inventory synchronization daemon.
//!
//! ## Overview
//!
//! Muster keeps a local picture of every device managed by a set of MDM
//! fleet servers:
//!
//! - **Scheduled Sync**: Per-server cron jobs pull device inventory on two
//!   cadences, a cheap listing pass and a full detail pass
//! - **Dual Storage**: Relational summaries land in PostgreSQL, full
//!   inventory snapshots in MongoDB
//! - **Command Dispatch**: Remote lock and wipe commands fan out to the
//!   servers that own the targeted devices
//! - **Credential Vault**: Server credentials are encrypted at rest and
//!   decrypted only on their way into a request

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use muster_core::store::mongo::DocumentStore;
use muster_core::store::postgres::RelationalStore;
use muster_core::{CredentialVault, FetchOptions, SyncEngine};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod config;

use crate::config::Settings;

/// CLI entry point
#[derive(Parser, Debug)]
#[command(name = "muster-server")]
#[command(about = "Inventory synchronization and command dispatch for MDM fleet servers")]
struct Cli {
    /// Path to a TOML configuration file
    #[arg(long, env = "MUSTER_CONFIG")]
    config: Option<PathBuf>,

    /// PostgreSQL URL (overrides config)
    #[arg(long, env = "MUSTER_DATABASE_URL")]
    database_url: Option<String>,

    /// MongoDB URI (overrides config)
    #[arg(long, env = "MUSTER_DOCUMENTS_URL")]
    documents_url: Option<String>,

    /// Vault passphrase (overrides config)
    #[arg(long, env = "MUSTER_VAULT_KEY", hide_env_values = true)]
    vault_key: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                // Quieter HTTP internals by default. Override via RUST_LOG.
                "info,hyper_util=warn,reqwest=warn".into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut settings = Settings::load(cli.config.as_deref())
        .context("failed to load configuration")?;
    if let Some(url) = cli.database_url {
        settings.database.url = url;
    }
    if let Some(url) = cli.documents_url {
        settings.documents.url = url;
    }
    if let Some(key) = cli.vault_key {
        settings.vault.key = key;
    }

    let relational = RelationalStore::connect(
        &settings.database.url,
        settings.database.max_connections,
        settings.acquire_timeout(),
    )
    .await
    .context("failed to connect to PostgreSQL")?;
    relational
        .health_check()
        .await
        .context("PostgreSQL health check failed")?;
    info!(
        max_connections = settings.database.max_connections,
        "connected to PostgreSQL"
    );

    let documents = DocumentStore::connect(&settings.documents.url, &settings.documents.database)
        .await
        .context("failed to connect to MongoDB")?;
    documents
        .health_check()
        .await
        .context("MongoDB ping failed")?;
    info!(database = %settings.documents.database, "connected to MongoDB");

    let engine = SyncEngine::builder()
        .with_vault(CredentialVault::new(&settings.vault.key))
        .with_server_store(Arc::new(relational.servers()))
        .with_device_store(Arc::new(relational.devices()))
        .with_snapshot_store(Arc::new(documents.snapshots()))
        .with_fetch_options(FetchOptions {
            concurrency: settings.fetch.concurrency,
            timeout: settings.fetch_timeout(),
        })
        .build()
        .context("failed to assemble sync engine")?;

    let report = engine
        .rebuild_schedule()
        .await
        .context("failed to build the initial sync schedule")?;
    info!(scheduled = report.scheduled.len(), "sync schedule built");
    for skip in &report.skipped {
        warn!(
            server_id = skip.server_id,
            url = %skip.url,
            reason = %skip.reason,
            "fleet server left unscheduled"
        );
    }

    info!("muster-server running; press Ctrl-C to stop");
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;

    info!("shutdown signal received, stopping sync jobs");
    engine.shutdown().await;
    info!("shutdown complete");
    Ok(())
}
