//! The pipeline controller.
//!
//! A [`Pipeline`] connects the destination, compiles the rules, spawns the flush loop and the
//! binlog reader, and then hands both to a supervisor task. The supervisor owns the status
//! state machine:
//!
//! ```text
//! Initial -> Running -> Fault -> Running
//!               |         |
//!               +---------+--> Close | Panic | Fail
//! ```
//!
//! A destination fault stops the reader and starts pinging the destination at a fixed
//! interval. Once a ping succeeds the destination is reconnected and the reader restarts from
//! the last persisted position.

use std::sync::Arc;
use std::time::Duration;

use config::shared::{PipelineConfig, RuleConfig};
use mysql::types::{BinlogPosition, TableName};
use rhai::Engine;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{Instrument, error, info, warn};

use crate::binlog::{BinlogSource, ChannelSink, Message, StreamEventHandler};
use crate::concurrency::shutdown::{ShutdownRx, ShutdownTx, create_shutdown_channel};
use crate::destination::Destination;
use crate::error::{ErrorKind, EtlError, EtlResult};
use crate::etl_error;
use crate::metrics::register_metrics;
use crate::rule::{RuleContext, RuleRegistry};
use crate::script::new_engine;
use crate::state::{PipelineRuntime, PipelineStatus, RuntimeRegistry};
use crate::store::PositionStore;
use crate::types::PipelineId;
use crate::workers::reader::ReaderHandle;
use crate::workers::stream::{StreamShared, StreamWorker, StreamWorkerHandle};

/// Bound of the join on the flush loop during shutdown.
const STREAM_WORKER_STOP_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug)]
enum PipelineState {
    NotStarted,
    Started {
        supervisor: JoinHandle<EtlResult<()>>,
    },
}

/// One replication pipeline: a binlog source, its rules, a checkpoint store and a destination.
#[derive(Debug)]
pub struct Pipeline<Src, D, S> {
    config: Arc<PipelineConfig>,
    rules: Vec<RuleConfig>,
    source: Src,
    destination: D,
    store: S,
    registry: RuleRegistry,
    runtimes: RuntimeRegistry,
    state: PipelineState,
    shutdown_tx: ShutdownTx,
}

impl<Src, D, S> Pipeline<Src, D, S>
where
    Src: BinlogSource + Clone + Send + Sync + 'static,
    D: Destination + Clone + Send + Sync + 'static,
    S: PositionStore + Clone + Send + Sync + 'static,
{
    #[expect(clippy::too_many_arguments)]
    pub fn new(
        config: PipelineConfig,
        rules: Vec<RuleConfig>,
        source: Src,
        destination: D,
        store: S,
        registry: RuleRegistry,
        runtimes: RuntimeRegistry,
    ) -> Self {
        let (shutdown_tx, _) = create_shutdown_channel();

        Self {
            config: Arc::new(config),
            rules,
            source,
            destination,
            store,
            registry,
            runtimes,
            state: PipelineState::NotStarted,
            shutdown_tx,
        }
    }

    pub fn id(&self) -> PipelineId {
        self.config.id
    }

    pub fn shutdown_tx(&self) -> ShutdownTx {
        self.shutdown_tx.clone()
    }

    /// The runtime record of this pipeline.
    pub fn runtime(&self) -> Arc<PipelineRuntime> {
        self.runtimes.get_or_create(self.config.id)
    }

    /// Starts replication.
    ///
    /// Returns once the binlog subscription survived the start grace period. Failures before
    /// that point leave the pipeline in [`PipelineStatus::Fail`].
    pub async fn start(&mut self) -> EtlResult<()> {
        info!(
            pipeline_id = self.config.id,
            pipeline_name = %self.config.name,
            destination = D::name(),
            "starting pipeline"
        );
        register_metrics();

        let runtime = self.runtime();
        runtime.set_status(PipelineStatus::Initial);

        match self.start_inner(&runtime).await {
            Ok(supervisor) => {
                runtime.set_status(PipelineStatus::Running);
                self.state = PipelineState::Started { supervisor };

                Ok(())
            }
            Err(err) => {
                error!(pipeline_id = self.config.id, error = %err, "pipeline failed to start");
                runtime.set_status_with_message(PipelineStatus::Fail, err.to_string());
                self.registry.remove_pipeline(self.config.id);

                Err(err)
            }
        }
    }

    async fn start_inner(
        &mut self,
        runtime: &Arc<PipelineRuntime>,
    ) -> EtlResult<JoinHandle<EtlResult<()>>> {
        self.destination.connect().await?;

        match self.launch(runtime).await {
            Ok(handle) => Ok(handle),
            Err(err) => {
                if let Err(close_err) = self.destination.close().await {
                    warn!(error = %close_err, "failed to close the destination");
                }

                Err(err)
            }
        }
    }

    /// Builds the rule contexts and spawns the flush loop, the reader and the supervisor.
    async fn launch(
        &mut self,
        runtime: &Arc<PipelineRuntime>,
    ) -> EtlResult<JoinHandle<EtlResult<()>>> {
        let engine = Arc::new(new_engine());
        self.build_contexts(&engine).await?;

        let stored = self.store.load_position(self.config.id).await?;
        if let Some(position) = &stored {
            runtime.set_position(position.clone());
        }
        let start_position = stored.clone().unwrap_or_else(BinlogPosition::start);
        info!(pipeline_id = self.config.id, position = %start_position, "resolved start position");

        let (tx, rx) = mpsc::channel(self.config.batch.channel_capacity);
        let (fault_tx, fault_rx) = mpsc::channel(1);
        let shared = StreamShared::new();

        let mut stream_worker = StreamWorker::new(
            self.config.id,
            self.config.batch.clone(),
            self.store.clone(),
            self.destination.clone(),
            runtime.clone(),
            shared.clone(),
            rx,
            fault_tx,
            self.shutdown_tx.subscribe(),
            stored,
        )
        .spawn();

        let supervisor = Supervisor {
            config: self.config.clone(),
            source: self.source.clone(),
            destination: self.destination.clone(),
            store: self.store.clone(),
            registry: self.registry.clone(),
            runtime: runtime.clone(),
            runtimes: self.runtimes.clone(),
            engine,
            shared,
            tx,
        };

        let mut reader = supervisor.spawn_reader(start_position);

        // The source gives no readiness signal, so a subscription that survives the grace
        // period counts as live.
        let grace = Duration::from_millis(self.config.start_grace_ms);
        let reader = match tokio::time::timeout(grace, reader.joined()).await {
            Err(_) => Some(reader),
            Ok(Ok(())) => {
                info!(pipeline_id = self.config.id, "binlog source finished during start");
                None
            }
            Ok(Err(err)) => {
                stream_worker.abort();

                return Err(err);
            }
        };

        let shutdown_rx = self.shutdown_tx.subscribe();
        let span = tracing::info_span!("pipeline_supervisor", pipeline_id = self.config.id);
        let handle = tokio::spawn(
            supervisor
                .run(reader, stream_worker, fault_rx, shutdown_rx)
                .instrument(span.or_current()),
        );

        Ok(handle)
    }

    /// Compiles every rule against the current metadata of its table.
    async fn build_contexts(&self, engine: &Arc<Engine>) -> EtlResult<()> {
        for rule in &self.rules {
            let table_name = TableName::new(rule.schema.clone(), rule.table.clone());
            let table = self.source.table_schema(&table_name).await?;

            let context = RuleContext::build(
                self.config.id,
                &self.config.name,
                Arc::new(rule.clone()),
                Arc::new(table),
                engine.clone(),
                true,
            )?;
            self.registry.insert(Arc::new(context));
        }

        info!(
            pipeline_id = self.config.id,
            rules = self.rules.len(),
            "compiled rule contexts"
        );

        Ok(())
    }

    /// Waits for the pipeline to stop and returns the reason it stopped for.
    pub async fn wait(self) -> EtlResult<()> {
        let PipelineState::Started { supervisor } = self.state else {
            info!("pipeline was not started, nothing to wait for");

            return Ok(());
        };

        supervisor.await.map_err(|err| {
            etl_error!(
                ErrorKind::StreamWorkerPanic,
                "Pipeline supervisor panicked",
                err
            )
        })?
    }

    pub fn shutdown(&self) {
        info!(pipeline_id = self.config.id, "trying to shut down the pipeline");

        if let Err(err) = self.shutdown_tx.shutdown() {
            error!("failed to send shutdown signal to the pipeline: {}", err);
            return;
        }

        info!("shut down signal successfully sent to all workers");
    }

    pub async fn shutdown_and_wait(self) -> EtlResult<()> {
        self.shutdown();
        self.wait().await
    }
}

/// What ended the supervision loop.
enum Outcome {
    Shutdown,
    StreamWorkerFailed(EtlError),
    StreamWorkerStopped,
    ReaderFailed(EtlError),
}

/// Task owning the reader and the flush loop of a started pipeline.
struct Supervisor<Src, D, S> {
    config: Arc<PipelineConfig>,
    source: Src,
    destination: D,
    store: S,
    registry: RuleRegistry,
    runtime: Arc<PipelineRuntime>,
    runtimes: RuntimeRegistry,
    engine: Arc<Engine>,
    shared: StreamShared,
    tx: mpsc::Sender<Message>,
}

impl<Src, D, S> Supervisor<Src, D, S>
where
    Src: BinlogSource + Clone + Send + Sync + 'static,
    D: Destination + Clone + Send + Sync + 'static,
    S: PositionStore + Clone + Send + Sync + 'static,
{
    fn spawn_reader(&self, from: BinlogPosition) -> ReaderHandle {
        let handler = StreamEventHandler::new(
            self.config.id,
            Arc::from(self.config.name.as_str()),
            self.registry.clone(),
            self.engine.clone(),
            self.runtime.clone(),
            ChannelSink::new(self.tx.clone(), self.shared.current_epoch()),
        );

        ReaderHandle::spawn(self.config.id, self.source.clone(), from, handler)
    }

    async fn run(
        self,
        mut reader: Option<ReaderHandle>,
        mut stream_worker: StreamWorkerHandle,
        mut fault_rx: mpsc::Receiver<EtlError>,
        mut shutdown_rx: ShutdownRx,
    ) -> EtlResult<()> {
        let outcome = loop {
            tokio::select! {
                biased;

                _ = shutdown_rx.changed() => break Outcome::Shutdown,

                result = stream_worker.joined() => match result {
                    Ok(()) => break Outcome::StreamWorkerStopped,
                    Err(err) => break Outcome::StreamWorkerFailed(err),
                },

                Some(fault) = fault_rx.recv() => {
                    if let Some(reader) = reader.take()
                        && let Err(err) = reader.stop().await
                    {
                        warn!(error = %err, "binlog reader stopped with an error");
                    }

                    match self.recover(fault, &mut shutdown_rx).await {
                        Some(restarted) => reader = Some(restarted),
                        None => break Outcome::Shutdown,
                    }
                }

                result = join_optional_reader(&mut reader) => match result {
                    Ok(()) => {
                        info!("binlog source finished");
                        reader = None;
                    }
                    Err(err) => break Outcome::ReaderFailed(err),
                },
            }
        };

        if let Some(reader) = reader.take()
            && let Err(err) = reader.stop().await
        {
            warn!(error = %err, "binlog reader stopped with an error");
        }

        match outcome {
            Outcome::Shutdown | Outcome::StreamWorkerStopped => {
                // The flush loop sees the same shutdown signal and drains its queue.
                if tokio::time::timeout(STREAM_WORKER_STOP_TIMEOUT, stream_worker.joined())
                    .await
                    .is_err()
                {
                    warn!("stream worker did not stop in time, aborting it");
                    stream_worker.abort();
                }

                self.close().await;
                self.runtime.set_status(PipelineStatus::Close);
                self.runtimes.remove(self.config.id);
                info!("pipeline closed");

                Ok(())
            }
            Outcome::StreamWorkerFailed(err) => {
                error!(error = %err, "stream worker failed, stopping the pipeline");
                self.close().await;
                self.runtime
                    .set_status_with_message(PipelineStatus::Panic, err.to_string());

                Err(err)
            }
            Outcome::ReaderFailed(err) => {
                error!(error = %err, "binlog subscription failed, stopping the pipeline");
                stream_worker.abort();
                self.close().await;
                self.runtime
                    .set_status_with_message(PipelineStatus::Fail, err.to_string());

                Err(err)
            }
        }
    }

    /// Pings the destination until it answers, then restarts the subscription from the
    /// persisted position. Returns [`None`] when shutdown arrived first.
    async fn recover(&self, fault: EtlError, shutdown_rx: &mut ShutdownRx) -> Option<ReaderHandle> {
        warn!(error = %fault, "pipeline faulted, monitoring destination health");
        self.runtime
            .set_status_with_message(PipelineStatus::Fault, fault.to_string());

        let interval = Duration::from_millis(self.config.health_check_interval_ms);
        let span = tracing::info_span!("health_monitor", pipeline_id = self.config.id);

        async {
            loop {
                tokio::select! {
                    biased;

                    _ = shutdown_rx.changed() => return None,

                    _ = tokio::time::sleep(interval) => {}
                }

                if let Err(err) = self.destination.ping().await {
                    warn!(error = %err, "destination is still unreachable");
                    continue;
                }
                if let Err(err) = self.destination.connect().await {
                    warn!(error = %err, "destination answered but reconnecting failed");
                    continue;
                }

                let position = match self.store.load_position(self.config.id).await {
                    Ok(position) => position.unwrap_or_else(BinlogPosition::start),
                    Err(err) => {
                        warn!(error = %err, "failed to load the resume position");
                        continue;
                    }
                };

                let epoch = self.shared.recover();
                info!(epoch, %position, "destination recovered, restarting binlog subscription");
                let reader = self.spawn_reader(position);
                self.runtime.set_status(PipelineStatus::Running);

                return Some(reader);
            }
        }
        .instrument(span.or_current())
        .await
    }

    async fn close(&self) {
        if let Err(err) = self.destination.close().await {
            warn!(error = %err, "failed to close the destination");
        }

        // Dropping the contexts drops their interpreters.
        let removed = self.registry.remove_pipeline(self.config.id);
        info!(rules = removed, "removed pipeline rules");
    }
}

async fn join_optional_reader(reader: &mut Option<ReaderHandle>) -> EtlResult<()> {
    match reader {
        Some(reader) => reader.joined().await,
        None => std::future::pending().await,
    }
}
