//! Replicator service binary.
//!
//! Loads the configuration, initializes tracing and metrics, then runs one binlog pipeline
//! until it stops or the process receives a shutdown signal.

use config::environment::Environment;
use config::shared::ReplicatorConfig;
use telemetry::metrics::init_metrics;
use telemetry::tracing::init_tracing;
use tracing::{error, info};

use crate::core::start_replicator_with_config;
use crate::settings::load_replicator_config;

mod core;
mod replay;
mod settings;

fn main() -> anyhow::Result<()> {
    let replicator_config = load_replicator_config()?;

    init_tracing(env!("CARGO_BIN_NAME"), Environment::load()?)?;

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(async_main(replicator_config))
}

async fn async_main(replicator_config: ReplicatorConfig) -> anyhow::Result<()> {
    // The Prometheus listener runs as a task, so the recorder is installed inside the runtime.
    init_metrics(Some(&replicator_config.pipeline.name))?;

    if let Err(err) = start_replicator_with_config(replicator_config).await {
        error!("{err:#}");
        return Err(err);
    }

    info!("replicator exited cleanly");

    Ok(())
}
