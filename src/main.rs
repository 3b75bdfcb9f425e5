//! Herald event delivery gateway.
//!
//! Main entry point for the herald server. Loads configuration, restores
//! pending events from the journal, starts the delivery manager and serves
//! the admin API until a shutdown signal arrives.

use std::{path::Path, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use herald_api::{AppState, Config};
use herald_core::RealClock;
use herald_delivery::{
    DeliveryJournal, DeliveryManager, DisabledBroker, FileJournal, NoopJournal,
};
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load()?;
    init_tracing(&config)?;

    info!("Starting herald event delivery gateway");

    let manager_config = config.to_manager_config()?;
    let destinations = config.to_destinations();
    info!(
        tenants = destinations.len(),
        global_webhook = manager_config.global_webhook_url.is_some(),
        max_retries = manager_config.retry_policy.max_retries,
        backoff = %manager_config.retry_policy.strategy,
        "Configuration loaded"
    );

    let journal = open_journal(config.journal_path.as_deref()).await?;

    let manager = DeliveryManager::new(
        manager_config,
        Arc::new(destinations),
        Arc::new(DisabledBroker),
        Arc::new(RealClock::new()),
        journal,
    )
    .await
    .context("Failed to create delivery manager")?;
    manager.start().await;

    let addr = config.parse_server_addr()?;
    let mut state = AppState::new(manager.clone());
    if let Some(dir) = config.attachment_dir.as_deref().map(str::trim).filter(|d| !d.is_empty()) {
        info!(dir, "Attachments enabled");
        state = state.with_attachment_dir(dir);
    }
    let request_timeout = Duration::from_secs(config.request_timeout);

    info!(addr = %addr, "Herald is ready to accept events");

    if let Err(e) =
        herald_api::start_server(state, addr, request_timeout, herald_api::shutdown_signal()).await
    {
        error!(error = %e, "Server failed");
    }

    manager.shutdown().await.context("Delivery manager did not shut down cleanly")?;

    info!("Herald shutdown complete");
    Ok(())
}

/// Initializes tracing from the configured filter and output format.
fn init_tracing(config: &Config) -> Result<()> {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_new(&config.rust_log).context("Invalid RUST_LOG directives")?;
    let registry = tracing_subscriber::registry().with(filter);

    if config.json_logs() {
        registry
            .with(fmt::layer().json().with_target(true).with_current_span(true))
            .try_init()
            .context("Failed to install tracing subscriber")?;
    } else {
        registry
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_thread_ids(true)
                    .with_file(true)
                    .with_line_number(true),
            )
            .try_init()
            .context("Failed to install tracing subscriber")?;
    }

    Ok(())
}

/// Opens the file journal when a path is configured.
async fn open_journal(path: Option<&str>) -> Result<Arc<dyn DeliveryJournal>> {
    match path.map(str::trim).filter(|p| !p.is_empty()) {
        Some(path) => {
            let journal = FileJournal::open(Path::new(path))
                .await
                .with_context(|| format!("Failed to open delivery journal at {path}"))?;
            info!(path, "Delivery journal opened");
            Ok(Arc::new(journal))
        },
        None => {
            info!("No journal configured, pending events are kept in memory only");
            Ok(Arc::new(NoopJournal))
        },
    }
}
