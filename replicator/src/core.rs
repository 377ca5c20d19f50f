use config::shared::{CheckpointStoreConfig, ReplicatorConfig};
use etl::binlog::BinlogSource;
use etl::destination::Destination;
use etl::export::{BulkExporter, MySqlTableScanner};
use etl::pipeline::Pipeline;
use etl::rule::RuleRegistry;
use etl::state::RuntimeRegistry;
use etl::store::{MemoryStore, PositionStore, SqliteStore};
use etl_destinations::{AnyDestination, build_destination};
use mysql::connection::connect_to_source_database;
use sqlx::MySqlPool;
use tokio::signal::unix::{SignalKind, signal};
use tracing::{error, info, warn};

use crate::replay::ReplaySource;

/// Connections kept open to the source outside of bulk exports.
const MIN_SOURCE_CONNECTIONS: u32 = 1;

/// Starts the replicator with the provided configuration.
///
/// Builds the destination selected by the endpoint, the checkpoint store and the binlog source,
/// then runs one pipeline until it stops or a shutdown signal arrives.
pub async fn start_replicator_with_config(config: ReplicatorConfig) -> anyhow::Result<()> {
    info!("starting replicator service");
    log_config(&config);

    let destination = build_destination(&config.endpoint)?;

    let pool = connect_to_source_database(
        &config.pipeline.source,
        MIN_SOURCE_CONNECTIONS,
        config.pipeline.export.max_connections.max(MIN_SOURCE_CONNECTIONS),
    )
    .await?;

    let Some(replay_file) = config.replay_file.clone() else {
        anyhow::bail!("no binlog source configured, set `replay_file` to replay decoded events");
    };
    let source = ReplaySource::new(replay_file, pool.clone());

    match config.checkpoint_store.clone() {
        CheckpointStoreConfig::Memory => {
            warn!("checkpoints are kept in memory and will be lost on restart");
            start_pipeline(config, source, destination, MemoryStore::new(), pool).await
        }
        CheckpointStoreConfig::Sqlite { path } => {
            let store = SqliteStore::open(&path).await?;
            start_pipeline(config, source, destination, store, pool).await
        }
    }
}

fn log_config(config: &ReplicatorConfig) {
    info!(
        pipeline_id = config.pipeline.id,
        pipeline_name = %config.pipeline.name,
        source_host = %config.pipeline.source.host,
        source_port = config.pipeline.source.port,
        destination = config.endpoint.kind(),
        rules = config.rules.len(),
        batch_max_size = config.pipeline.batch.max_size,
        batch_max_fill_ms = config.pipeline.batch.max_fill_ms,
        export_on_start = config.pipeline.export.on_start,
        "replicator configuration"
    );
}

/// Starts a pipeline and handles graceful shutdown signals.
///
/// When `pipeline.export.on_start` is set, every rule with an order column is exported while
/// the binlog stream already runs.
async fn start_pipeline<Src, S>(
    config: ReplicatorConfig,
    source: Src,
    destination: AnyDestination,
    store: S,
    pool: MySqlPool,
) -> anyhow::Result<()>
where
    Src: BinlogSource + Clone + Send + Sync + 'static,
    S: PositionStore + Clone + Send + Sync + 'static,
{
    let pipeline_id = config.pipeline.id;
    let registry = RuleRegistry::new();
    let runtimes = RuntimeRegistry::new();

    let mut pipeline = Pipeline::new(
        config.pipeline.clone(),
        config.rules.clone(),
        source,
        destination.clone(),
        store,
        registry.clone(),
        runtimes.clone(),
    );
    pipeline.start().await?;

    let shutdown_tx = pipeline.shutdown_tx();
    let shutdown_handle = tokio::spawn(async move {
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(sigterm) => sigterm,
            Err(err) => {
                warn!(error = %err, "failed to register sigterm handler");
                let _ = tokio::signal::ctrl_c().await;
                let _ = shutdown_tx.shutdown();
                return;
            }
        };

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("sigint (ctrl+c) received, shutting down pipeline");
            }
            _ = sigterm.recv() => {
                info!("sigterm received, shutting down pipeline");
            }
        }

        if let Err(err) = shutdown_tx.shutdown() {
            warn!(error = ?err, "failed to send shutdown signal");
        }
    });

    if config.pipeline.export.on_start {
        let exporter = BulkExporter::new(
            pipeline_id,
            config.pipeline.export.clone(),
            MySqlTableScanner::new(pool),
            destination,
            pipeline.runtime(),
        );

        match exporter.export_all(&registry.contexts(pipeline_id)).await {
            Ok(reports) => {
                for report in reports {
                    info!(
                        table = %report.table,
                        total_rows = report.total_rows,
                        imported_rows = report.imported_rows,
                        complete = report.is_complete(),
                        "export finished"
                    );
                }
            }
            Err(err) => {
                error!(error = %err, "initial export failed, stopping pipeline");
                pipeline.shutdown();
            }
        }
    }

    let result = pipeline.wait().await;

    shutdown_handle.abort();
    let _ = shutdown_handle.await;

    if let Some(runtime) = runtimes.get(pipeline_id) {
        let snapshot = runtime.snapshot();
        info!(
            status = %snapshot.status,
            inserts = snapshot.inserts,
            updates = snapshot.updates,
            deletes = snapshot.deletes,
            position = ?snapshot.position,
            "pipeline stopped"
        );
    }
    info!(destination = AnyDestination::name(), "replicator service stopped");

    result?;

    Ok(())
}
