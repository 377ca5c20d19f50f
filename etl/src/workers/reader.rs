use std::time::Duration;

use mysql::types::BinlogPosition;
use tokio::task::JoinHandle;
use tracing::{Instrument, info, warn};

use crate::binlog::{BinlogHandler, BinlogSource};
use crate::concurrency::shutdown::{ShutdownTx, create_shutdown_channel};
use crate::error::{ErrorKind, EtlResult};
use crate::etl_error;
use crate::types::PipelineId;

/// How long a stopping reader may take before its task is aborted.
pub const READER_STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// Handle of one binlog subscription.
///
/// Every subscription has its own stop signal so a faulted pipeline can stop reading without
/// shutting down its other tasks.
#[derive(Debug)]
pub struct ReaderHandle {
    from: BinlogPosition,
    stop_tx: ShutdownTx,
    handle: Option<JoinHandle<EtlResult<()>>>,
}

impl ReaderHandle {
    /// Starts `source` from `from` on a new task.
    pub fn spawn<Src, H>(
        pipeline_id: PipelineId,
        source: Src,
        from: BinlogPosition,
        handler: H,
    ) -> Self
    where
        Src: BinlogSource + Send + Sync + 'static,
        H: BinlogHandler + Send + Sync + 'static,
    {
        let (stop_tx, stop_rx) = create_shutdown_channel();
        let span = tracing::info_span!("binlog_reader", pipeline_id, position = %from);

        let start = from.clone();
        let reader = async move {
            info!("starting binlog subscription");
            source.run(start, handler, stop_rx).await
        }
        .instrument(span.or_current());

        Self {
            from,
            stop_tx,
            handle: Some(tokio::spawn(reader)),
        }
    }

    /// Position the subscription started from.
    pub fn from(&self) -> &BinlogPosition {
        &self.from
    }

    pub fn is_finished(&self) -> bool {
        self.handle
            .as_ref()
            .is_none_or(|handle| handle.is_finished())
    }

    /// Waits for the subscription to end on its own. Pending forever once joined.
    pub async fn joined(&mut self) -> EtlResult<()> {
        match self.handle.as_mut() {
            Some(handle) => {
                let result = join_reader(handle).await;
                self.handle = None;
                result
            }
            None => std::future::pending().await,
        }
    }

    /// Signals the subscription to stop and waits for it with a bounded join.
    pub async fn stop(mut self) -> EtlResult<()> {
        let Some(mut handle) = self.handle.take() else {
            return Ok(());
        };

        // The reader may already be gone, in which case there is no receiver left.
        let _ = self.stop_tx.shutdown();

        match tokio::time::timeout(READER_STOP_TIMEOUT, &mut handle).await {
            Ok(result) => flatten(result),
            Err(_) => {
                warn!("binlog reader did not stop in time, aborting it");
                handle.abort();

                Ok(())
            }
        }
    }
}

async fn join_reader(handle: &mut JoinHandle<EtlResult<()>>) -> EtlResult<()> {
    flatten(handle.await)
}

fn flatten(result: Result<EtlResult<()>, tokio::task::JoinError>) -> EtlResult<()> {
    result.map_err(|err| {
        if err.is_cancelled() {
            etl_error!(
                ErrorKind::InvalidState,
                "Binlog reader was cancelled",
                err
            )
        } else {
            etl_error!(ErrorKind::ReaderWorkerPanic, "Binlog reader panicked", err)
        }
    })?
}

#[cfg(test)]
mod tests {
    use mysql::types::{TableName, TableSchema};

    use super::*;
    use crate::bail;
    use crate::concurrency::shutdown::ShutdownRx;
    use crate::types::RowsEvent;

    struct IgnoringHandler;

    impl BinlogHandler for IgnoringHandler {
        async fn on_row(&self, _event: RowsEvent) -> EtlResult<()> {
            Ok(())
        }

        async fn on_rotate(&self, _next: BinlogPosition) -> EtlResult<()> {
            Ok(())
        }

        async fn on_ddl(
            &self,
            _position: BinlogPosition,
            _schema: &str,
            _query: &str,
        ) -> EtlResult<()> {
            Ok(())
        }

        async fn on_xid(&self, _position: BinlogPosition) -> EtlResult<()> {
            Ok(())
        }

        async fn on_gtid(&self, _gtid: &str) -> EtlResult<()> {
            Ok(())
        }

        async fn on_table_changed(&self, _schema: &str, _table: &str) -> EtlResult<()> {
            Ok(())
        }

        async fn on_pos_synced(&self, _position: BinlogPosition, _force: bool) -> EtlResult<()> {
            Ok(())
        }
    }

    /// Waits for the stop signal, then fails like a client losing its connection on close.
    struct FailingOnStopSource;

    impl BinlogSource for FailingOnStopSource {
        async fn table_schema(&self, table: &TableName) -> EtlResult<TableSchema> {
            bail!(ErrorKind::MissingTableSchema, "Unknown table", table);
        }

        async fn run<H>(
            &self,
            _from: BinlogPosition,
            _handler: H,
            mut shutdown_rx: ShutdownRx,
        ) -> EtlResult<()>
        where
            H: BinlogHandler + Send + Sync + 'static,
        {
            let _ = shutdown_rx.changed().await;
            bail!(
                ErrorKind::SourceConnectionFailed,
                "Binlog connection closed uncleanly"
            );
        }
    }

    #[tokio::test]
    async fn stop_returns_the_source_error() {
        let reader = ReaderHandle::spawn(
            1,
            FailingOnStopSource,
            BinlogPosition::new("mysql-bin.000001", 4),
            IgnoringHandler,
        );
        assert!(!reader.is_finished());

        let err = reader.stop().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SourceConnectionFailed);
    }
}
