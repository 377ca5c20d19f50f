use std::future::Future;

use mysql::types::{BinlogPosition, TableName, TableSchema};

use crate::concurrency::shutdown::ShutdownRx;
use crate::error::EtlResult;
use crate::types::RowsEvent;

/// Callbacks of a binlog subscription.
///
/// [`BinlogHandler::on_row`] is the only callback producing data. The others are position or
/// schema signals. An error returned by a callback stops the subscription.
pub trait BinlogHandler {
    fn on_row(&self, event: RowsEvent) -> impl Future<Output = EtlResult<()>> + Send;

    /// The source switched to a new log file. `next` is the first position of that file.
    fn on_rotate(&self, next: BinlogPosition) -> impl Future<Output = EtlResult<()>> + Send;

    /// A DDL statement was applied at `position`.
    fn on_ddl(
        &self,
        position: BinlogPosition,
        schema: &str,
        query: &str,
    ) -> impl Future<Output = EtlResult<()>> + Send;

    /// A transaction committed; `position` follows its last event.
    fn on_xid(&self, position: BinlogPosition) -> impl Future<Output = EtlResult<()>> + Send;

    fn on_gtid(&self, gtid: &str) -> impl Future<Output = EtlResult<()>> + Send;

    /// The metadata of a table changed and cached layouts must not be trusted anymore.
    fn on_table_changed(
        &self,
        schema: &str,
        table: &str,
    ) -> impl Future<Output = EtlResult<()>> + Send;

    /// The client reports that everything up to `position` was delivered.
    fn on_pos_synced(
        &self,
        position: BinlogPosition,
        force: bool,
    ) -> impl Future<Output = EtlResult<()>> + Send;
}

/// A binlog subscription that can be (re)started from any position.
///
/// Implementations are cheap to clone; the pipeline clones the source for every restart.
pub trait BinlogSource {
    /// Current metadata of `table`, as the binlog decoder will see it.
    fn table_schema(
        &self,
        table: &TableName,
    ) -> impl Future<Output = EtlResult<TableSchema>> + Send;

    /// Streams events from `from` into `handler` until `shutdown_rx` fires or the subscription
    /// fails.
    ///
    /// The client gives no readiness signal: a subscription is considered live once it has not
    /// failed for a short grace period.
    fn run<H>(
        &self,
        from: BinlogPosition,
        handler: H,
        shutdown_rx: ShutdownRx,
    ) -> impl Future<Output = EtlResult<()>> + Send
    where
        H: BinlogHandler + Send + Sync + 'static;
}
