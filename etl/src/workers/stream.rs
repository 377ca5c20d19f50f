use std::mem;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use config::shared::BatchConfig;
use metrics::{counter, histogram};
use mysql::types::BinlogPosition;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{Instrument, debug, error, info, warn};

use crate::binlog::{Message, MessageKind};
use crate::concurrency::shutdown::ShutdownRx;
use crate::destination::Destination;
use crate::error::{ErrorKind, EtlError, EtlResult};
use crate::etl_error;
use crate::metrics::{
    ETL_BATCH_SIZE, ETL_BATCH_WRITE_DURATION_SECONDS, ETL_CHECKPOINT_SAVES_TOTAL,
    ETL_SINK_FAULTS_TOTAL, PIPELINE_ID_LABEL,
};
use crate::state::PipelineRuntime;
use crate::store::PositionStore;
use crate::types::{PipelineId, RowEventRequest};

/// Time after the last save after which any position marker is persisted.
pub const POSITION_SAVE_INTERVAL: Duration = Duration::from_secs(3);

/// Consecutive failures that are not destination faults after which the pipeline stops instead
/// of faulting.
pub const MAX_CONSECUTIVE_ROW_FAILURES: u32 = 3;

/// State shared between the flush loop and the pipeline supervisor.
#[derive(Debug, Clone)]
pub struct StreamShared {
    /// Whether the destination accepted the last write. Rows are dropped while unhealthy and
    /// replayed from the persisted position once the subscription restarts.
    pub healthy: Arc<AtomicBool>,
    /// Generation of the current binlog subscription.
    pub epoch: Arc<AtomicU64>,
}

impl StreamShared {
    pub fn new() -> Self {
        Self {
            healthy: Arc::new(AtomicBool::new(true)),
            epoch: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Acquire)
    }

    pub fn current_epoch(&self) -> u64 {
        self.epoch.load(Ordering::Acquire)
    }

    /// Starts a new subscription generation and marks the destination healthy again.
    ///
    /// Returns the new epoch.
    pub fn recover(&self) -> u64 {
        let epoch = self.epoch.fetch_add(1, Ordering::AcqRel) + 1;
        self.healthy.store(true, Ordering::Release);

        epoch
    }
}

impl Default for StreamShared {
    fn default() -> Self {
        Self::new()
    }
}

/// Handle of a running flush loop.
#[derive(Debug)]
pub struct StreamWorkerHandle {
    handle: Option<JoinHandle<EtlResult<()>>>,
}

impl StreamWorkerHandle {
    /// Waits for the flush loop to exit.
    pub async fn wait(mut self) -> EtlResult<()> {
        let Some(handle) = self.handle.take() else {
            return Ok(());
        };

        join_stream_worker(handle).await
    }

    /// Waits for the flush loop without consuming the handle. Pending forever once joined.
    pub async fn joined(&mut self) -> EtlResult<()> {
        match self.handle.as_mut() {
            Some(handle) => {
                let result = join_stream_worker(handle).await;
                self.handle = None;
                result
            }
            None => std::future::pending().await,
        }
    }

    pub fn abort(&self) {
        if let Some(handle) = &self.handle {
            handle.abort();
        }
    }
}

async fn join_stream_worker(
    handle: impl std::future::Future<Output = Result<EtlResult<()>, tokio::task::JoinError>>,
) -> EtlResult<()> {
    handle.await.map_err(|err| {
        if err.is_cancelled() {
            etl_error!(
                ErrorKind::InvalidState,
                "Stream worker was cancelled",
                err
            )
        } else {
            etl_error!(ErrorKind::StreamWorkerPanic, "Stream worker panicked", err)
        }
    })?
}

/// The flush loop of one pipeline.
///
/// Buffers rows coming from the binlog handler and writes them to the destination when the
/// buffer is full, when the periodic timer fires, or before a position marker is persisted.
/// A position is saved only after every row received before it was written while the
/// destination is healthy, so a restart can only replay rows, never skip them.
#[derive(Debug)]
pub struct StreamWorker<S, D> {
    pipeline_id: PipelineId,
    batch: BatchConfig,
    store: S,
    destination: D,
    runtime: Arc<PipelineRuntime>,
    shared: StreamShared,
    rx: mpsc::Receiver<Message>,
    fault_tx: mpsc::Sender<EtlError>,
    shutdown_rx: ShutdownRx,
    /// Last persisted position. Markers behind it are ignored.
    last_saved: Option<BinlogPosition>,
}

impl<S, D> StreamWorker<S, D>
where
    S: PositionStore + Clone + Send + Sync + 'static,
    D: Destination + Clone + Send + Sync + 'static,
{
    #[expect(clippy::too_many_arguments)]
    pub fn new(
        pipeline_id: PipelineId,
        batch: BatchConfig,
        store: S,
        destination: D,
        runtime: Arc<PipelineRuntime>,
        shared: StreamShared,
        rx: mpsc::Receiver<Message>,
        fault_tx: mpsc::Sender<EtlError>,
        shutdown_rx: ShutdownRx,
        last_saved: Option<BinlogPosition>,
    ) -> Self {
        Self {
            pipeline_id,
            batch,
            store,
            destination,
            runtime,
            shared,
            rx,
            fault_tx,
            shutdown_rx,
            last_saved,
        }
    }

    pub fn spawn(self) -> StreamWorkerHandle {
        let span = tracing::info_span!("stream_worker", pipeline_id = self.pipeline_id);
        let handle = tokio::spawn(self.run().instrument(span.or_current()));

        StreamWorkerHandle {
            handle: Some(handle),
        }
    }

    async fn run(mut self) -> EtlResult<()> {
        info!(
            max_size = self.batch.max_size,
            max_fill_ms = self.batch.max_fill_ms,
            "starting stream worker"
        );

        let mut state = FlushState {
            buffer: Vec::with_capacity(self.batch.max_size),
            pending: None,
            last_save_at: Instant::now(),
            row_failures: 0,
        };
        let mut ticker = tokio::time::interval(Duration::from_millis(self.batch.max_fill_ms));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown_rx.changed() => {
                    info!("shutting down stream worker");

                    // Messages already queued are still applied so their markers can be saved.
                    while let Ok(message) = self.rx.try_recv() {
                        self.handle_message(&mut state, message).await?;
                    }
                    if let Err(err) = self.flush_rows(&mut state).await {
                        error!(error = %err, "final flush failed");
                        return Ok(());
                    }
                    if let Some(position) = state.pending.take() {
                        self.save_position(&mut state, position).await?;
                    }

                    return Ok(());
                }

                message = self.rx.recv() => {
                    let Some(message) = message else {
                        info!("event channel closed, stopping stream worker");
                        self.flush_rows(&mut state).await?;

                        return Ok(());
                    };

                    self.handle_message(&mut state, message).await?;
                }

                _ = ticker.tick() => {
                    self.flush_rows(&mut state).await?;

                    if state.last_save_at.elapsed() >= POSITION_SAVE_INTERVAL
                        && let Some(position) = state.pending.take()
                    {
                        self.save_position(&mut state, position).await?;
                    }
                }
            }
        }
    }

    async fn handle_message(&mut self, state: &mut FlushState, message: Message) -> EtlResult<()> {
        if message.epoch < self.shared.current_epoch() {
            debug!(epoch = message.epoch, "discarding message of a stopped subscription");
            return Ok(());
        }

        match message.kind {
            MessageKind::Rows(requests) => {
                if !self.shared.is_healthy() {
                    return Ok(());
                }

                state.buffer.extend(requests);
                if state.buffer.len() >= self.batch.max_size {
                    self.flush_rows(state).await?;
                }
            }
            MessageKind::Position { position, force } => {
                // Rows before this marker were dropped, so it must never become a checkpoint.
                if !self.shared.is_healthy() {
                    return Ok(());
                }

                if self
                    .last_saved
                    .as_ref()
                    .is_some_and(|last_saved| &position < last_saved)
                {
                    debug!(%position, "ignoring position behind the last saved one");
                    return Ok(());
                }

                if force || state.last_save_at.elapsed() >= POSITION_SAVE_INTERVAL {
                    self.flush_rows(state).await?;
                    state.pending = None;
                    self.save_position(state, position).await?;
                } else {
                    state.pending = Some(position);
                }
            }
        }

        Ok(())
    }

    /// Writes the buffered rows.
    ///
    /// A failure is reported to the supervisor and the buffer is dropped. Failures that are not
    /// destination faults come back with the replayed rows, so after
    /// [`MAX_CONSECUTIVE_ROW_FAILURES`] of them in a row the loop ends with the error.
    async fn flush_rows(&mut self, state: &mut FlushState) -> EtlResult<()> {
        if state.buffer.is_empty() {
            return Ok(());
        }
        if !self.shared.is_healthy() {
            state.buffer.clear();
            return Ok(());
        }

        let batch: Vec<RowEventRequest> = mem::take(&mut state.buffer);
        let batch_size = batch.len();
        let started = Instant::now();

        match self.destination.write_rows(batch).await {
            Ok(()) => {
                state.row_failures = 0;

                let labels = [(PIPELINE_ID_LABEL, self.pipeline_id.to_string())];
                histogram!(ETL_BATCH_SIZE, &labels).record(batch_size as f64);
                histogram!(ETL_BATCH_WRITE_DURATION_SECONDS, &labels)
                    .record(started.elapsed().as_secs_f64());
                debug!(batch_size, "flushed rows");

                Ok(())
            }
            Err(err) if err.kind().is_destination_fault() => {
                self.report_fault(state, err);

                Ok(())
            }
            Err(err) => {
                state.row_failures += 1;
                if state.row_failures >= MAX_CONSECUTIVE_ROW_FAILURES {
                    error!(error = %err, "rows failed repeatedly, stopping the pipeline");
                    return Err(err);
                }

                self.report_fault(state, err);

                Ok(())
            }
        }
    }

    fn report_fault(&mut self, state: &mut FlushState, err: EtlError) {
        warn!(error = %err, "destination write failed, faulting the pipeline");

        self.shared.healthy.store(false, Ordering::Release);
        state.buffer.clear();
        state.pending = None;
        self.runtime.set_message(err.to_string());
        counter!(ETL_SINK_FAULTS_TOTAL, PIPELINE_ID_LABEL => self.pipeline_id.to_string())
            .increment(1);

        // A full channel means a fault is already pending.
        if self.fault_tx.try_send(err).is_err() {
            debug!("a fault is already pending");
        }
    }

    /// Persists `position` if the destination is healthy. Store failures are fatal.
    async fn save_position(
        &mut self,
        state: &mut FlushState,
        position: BinlogPosition,
    ) -> EtlResult<()> {
        if !self.shared.is_healthy() {
            return Ok(());
        }

        if let Err(err) = self
            .store
            .save_position(self.pipeline_id, position.clone())
            .await
        {
            error!(error = %err, %position, "failed to persist binlog position");
            return Err(err);
        }

        debug!(%position, "persisted binlog position");
        state.last_save_at = Instant::now();
        self.runtime.set_position(position.clone());
        self.last_saved = Some(position);
        counter!(ETL_CHECKPOINT_SAVES_TOTAL, PIPELINE_ID_LABEL => self.pipeline_id.to_string())
            .increment(1);

        Ok(())
    }
}

#[derive(Debug)]
struct FlushState {
    buffer: Vec<RowEventRequest>,
    /// Newest marker that arrived too soon after the last save.
    pending: Option<BinlogPosition>,
    last_save_at: Instant,
    /// Consecutive writes rejected for reasons a replay cannot fix.
    row_failures: u32,
}

#[cfg(test)]
mod tests {
    use config::shared::RuleConfig;

    use super::*;
    use crate::binlog::{ChannelSink, EventSink};
    use crate::concurrency::shutdown::create_shutdown_channel;
    use crate::destination::memory::MemoryDestination;
    use crate::rule::RuleContext;
    use crate::script::new_engine;
    use crate::store::MemoryStore;
    use crate::test_utils::destination::FlakyDestination;
    use crate::test_utils::schema::users_table_schema;
    use crate::types::RowAction;

    struct Harness {
        tx: mpsc::Sender<Message>,
        sink: ChannelSink,
        store: MemoryStore,
        destination: FlakyDestination,
        shared: StreamShared,
        fault_rx: mpsc::Receiver<EtlError>,
        handle: StreamWorkerHandle,
        shutdown_tx: crate::concurrency::shutdown::ShutdownTx,
        context: Arc<RuleContext>,
    }

    fn harness(max_size: usize, max_fill_ms: u64) -> Harness {
        harness_with_rule(max_size, max_fill_ms, RuleConfig::new("shop", "users"))
    }

    fn harness_with_rule(max_size: usize, max_fill_ms: u64, rule: RuleConfig) -> Harness {
        let (tx, rx) = mpsc::channel(64);
        let (fault_tx, fault_rx) = mpsc::channel(1);
        let (shutdown_tx, shutdown_rx) = create_shutdown_channel();
        let store = MemoryStore::new();
        let destination = FlakyDestination::new(MemoryDestination::new());
        let shared = StreamShared::new();

        let handle = StreamWorker::new(
            1,
            BatchConfig {
                max_size,
                max_fill_ms,
                channel_capacity: 64,
            },
            store.clone(),
            destination.clone(),
            Arc::new(PipelineRuntime::new(1)),
            shared.clone(),
            rx,
            fault_tx,
            shutdown_rx,
            None,
        )
        .spawn();

        let context = Arc::new(
            RuleContext::build(
                1,
                "test",
                Arc::new(rule),
                Arc::new(users_table_schema()),
                Arc::new(new_engine()),
                false,
            )
            .unwrap(),
        );

        Harness {
            tx: tx.clone(),
            sink: ChannelSink::new(tx, 0),
            store,
            destination,
            shared,
            fault_rx,
            handle,
            shutdown_tx,
            context,
        }
    }

    fn rows(context: &Arc<RuleContext>, ids: std::ops::Range<i64>) -> Vec<RowEventRequest> {
        ids.map(|id| {
            RowEventRequest::new(
                context.clone(),
                RowAction::Insert,
                0,
                vec![id.into(), format!("user {id}").into()],
            )
        })
        .collect()
    }

    #[tokio::test]
    async fn forced_marker_flushes_rows_before_saving() {
        let harness = harness(100, 60_000);

        harness
            .sink
            .send_rows(rows(&harness.context, 0..3))
            .await
            .unwrap();
        harness
            .sink
            .send_position(BinlogPosition::new("mysql-bin.000001", 500), true)
            .await
            .unwrap();
        harness.shutdown_tx.shutdown().unwrap();
        harness.handle.wait().await.unwrap();

        assert_eq!(harness.destination.inner().records().await.len(), 3);
        assert_eq!(
            harness.store.load_position(1).await.unwrap(),
            Some(BinlogPosition::new("mysql-bin.000001", 500))
        );
    }

    #[tokio::test]
    async fn full_buffer_flushes_without_saving() {
        let harness = harness(2, 60_000);

        harness
            .sink
            .send_rows(rows(&harness.context, 0..2))
            .await
            .unwrap();
        harness
            .sink
            .send_position(BinlogPosition::new("mysql-bin.000001", 500), false)
            .await
            .unwrap();
        assert!(
            harness
                .destination
                .inner()
                .wait_for_records(2, Duration::from_secs(5))
                .await
        );

        assert_eq!(harness.store.load_position(1).await.unwrap(), None);

        harness.shutdown_tx.shutdown().unwrap();
        harness.handle.wait().await.unwrap();
    }

    #[tokio::test]
    async fn pending_marker_is_saved_on_shutdown() {
        let harness = harness(100, 60_000);

        harness
            .sink
            .send_rows(rows(&harness.context, 0..2))
            .await
            .unwrap();
        harness
            .sink
            .send_position(BinlogPosition::new("mysql-bin.000001", 700), false)
            .await
            .unwrap();
        harness.shutdown_tx.shutdown().unwrap();
        harness.handle.wait().await.unwrap();

        assert_eq!(harness.destination.inner().records().await.len(), 2);
        assert_eq!(
            harness.store.load_position(1).await.unwrap(),
            Some(BinlogPosition::new("mysql-bin.000001", 700))
        );
    }

    #[tokio::test]
    async fn markers_behind_the_last_save_are_ignored() {
        let harness = harness(100, 60_000);

        for offset in [900, 400, 1_200] {
            harness
                .sink
                .send_position(BinlogPosition::new("mysql-bin.000001", offset), true)
                .await
                .unwrap();
        }
        harness.shutdown_tx.shutdown().unwrap();
        harness.handle.wait().await.unwrap();

        let offsets: Vec<u64> = harness
            .store
            .history(1)
            .await
            .into_iter()
            .map(|position| position.offset)
            .collect();
        assert_eq!(offsets, vec![900, 1_200]);
    }

    #[tokio::test]
    async fn write_failure_faults_and_blocks_checkpoints() {
        let mut harness = harness(100, 60_000);
        harness.destination.set_failing(true);

        harness
            .sink
            .send_rows(rows(&harness.context, 0..3))
            .await
            .unwrap();
        harness
            .sink
            .send_position(BinlogPosition::new("mysql-bin.000001", 500), true)
            .await
            .unwrap();

        let fault = harness.fault_rx.recv().await.unwrap();
        assert_eq!(fault.kind(), ErrorKind::DestinationConnectionFailed);
        assert!(!harness.shared.is_healthy());

        harness.shutdown_tx.shutdown().unwrap();
        harness.handle.wait().await.unwrap();
        assert_eq!(harness.store.load_position(1).await.unwrap(), None);
    }

    #[tokio::test]
    async fn stale_epochs_are_discarded_after_recovery() {
        let harness = harness(100, 60_000);
        harness.shared.recover();

        harness
            .sink
            .send_rows(rows(&harness.context, 0..3))
            .await
            .unwrap();
        harness
            .sink
            .send_position(BinlogPosition::new("mysql-bin.000001", 500), true)
            .await
            .unwrap();
        harness.shutdown_tx.shutdown().unwrap();
        harness.handle.wait().await.unwrap();

        assert!(harness.destination.inner().records().await.is_empty());
        assert_eq!(harness.store.load_position(1).await.unwrap(), None);
    }

    #[tokio::test]
    async fn destination_faults_never_stop_the_loop() {
        let mut harness = harness(1, 60_000);
        harness.destination.set_failing(true);

        for _ in 0..=MAX_CONSECUTIVE_ROW_FAILURES {
            let epoch = harness.shared.recover();
            ChannelSink::new(harness.tx.clone(), epoch)
                .send_rows(rows(&harness.context, 0..1))
                .await
                .unwrap();

            let fault = harness.fault_rx.recv().await.unwrap();
            assert!(fault.kind().is_destination_fault());
        }

        harness.shutdown_tx.shutdown().unwrap();
        harness.handle.wait().await.unwrap();
    }

    #[tokio::test]
    async fn repeated_row_failures_stop_the_loop() {
        let mut rule = RuleConfig::new("shop", "users");
        rule.script = Some(r#"fn handle(event) { throw "bad row"; }"#.to_string());
        let mut harness = harness_with_rule(1, 60_000, rule);

        for _ in 1..MAX_CONSECUTIVE_ROW_FAILURES {
            let epoch = harness.shared.recover();
            ChannelSink::new(harness.tx.clone(), epoch)
                .send_rows(rows(&harness.context, 0..1))
                .await
                .unwrap();

            let fault = harness.fault_rx.recv().await.unwrap();
            assert_eq!(fault.kind(), ErrorKind::ScriptRuntimeError);
        }

        let epoch = harness.shared.recover();
        ChannelSink::new(harness.tx.clone(), epoch)
            .send_rows(rows(&harness.context, 0..1))
            .await
            .unwrap();

        let err = harness.handle.wait().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ScriptRuntimeError);
        assert!(harness.destination.inner().records().await.is_empty());
    }
}
