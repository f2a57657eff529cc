//! The Hadron flow runtime.

use std::io::Write;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::broadcast;
use tracing_subscriber::prelude::*;

use hadron_flow::app::App;
use hadron_flow::config::Config;
use hadron_flow::server::get_metrics_recorder;

#[tokio::main]
async fn main() -> Result<()> {
    // Setup tracing/logging system.
    tracing_subscriber::registry()
        // Filter spans based on the RUST_LOG env var.
        .with(tracing_subscriber::EnvFilter::from_default_env())
        // Send a copy of all spans to stdout in compact form.
        .with(
            tracing_subscriber::fmt::layer()
                .compact()
                .with_target(true)
                .with_level(true)
                .with_ansi(true),
        )
        // Install this registry as the global tracing registry.
        .try_init()
        .context("error initializing logging/tracing system")?;

    let cfg = Arc::new(Config::new()?);
    metrics::set_recorder(get_metrics_recorder(&cfg)).context("error setting prometheus metrics recorder")?;

    tracing::info!(
        namespace = %cfg.namespace,
        application = %cfg.application,
        flow = %cfg.flow,
        storage_data_path = %cfg.storage_data_path,
        "starting Hadron flow runtime",
    );
    let (shutdown_tx, _) = broadcast::channel(1);
    if let Err(err) = App::new(cfg, shutdown_tx).await?.spawn().await {
        tracing::error!(error = ?err);
    }

    // Ensure any pending output is flushed.
    let _ = std::io::stdout().flush();
    let _ = std::io::stderr().flush();

    Ok(())
}
