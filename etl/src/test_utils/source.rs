use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use mysql::types::{BinlogPosition, BinlogValue, TableName, TableSchema};
use tokio::sync::Notify;

use crate::binlog::{BinlogHandler, BinlogSource};
use crate::concurrency::shutdown::ShutdownRx;
use crate::error::{ErrorKind, EtlError, EtlResult};
use crate::etl_error;
use crate::test_utils::notify::TimedNotify;
use crate::types::{RowAction, RowsEvent};

/// One scripted binlog event.
#[derive(Debug, Clone)]
pub enum SourceEvent {
    /// A rows event followed by the commit of its transaction at the event's position.
    Rows(RowsEvent),
    Rotate,
    Ddl { schema: String, query: String },
    /// The table metadata changed; the new layout is served from then on.
    TableChanged(TableSchema),
}

#[derive(Debug, Default)]
struct Inner {
    events: Vec<(BinlogPosition, SourceEvent)>,
    tables: HashMap<TableName, TableSchema>,
    fail_next_start: Option<EtlError>,
    starts: Vec<BinlogPosition>,
    next_offset: u64,
}

/// A [`BinlogSource`] replaying scripted events.
///
/// Every event gets a strictly increasing position in `mysql-bin.000001`. A subscription
/// started from `from` delivers every event positioned after `from`, then waits for more events
/// until it is stopped.
#[derive(Debug, Clone, Default)]
pub struct FakeBinlogSource {
    inner: Arc<Mutex<Inner>>,
    pushed: Arc<Notify>,
    started: Arc<Notify>,
}

pub const FAKE_LOG_FILE: &str = "mysql-bin.000001";

impl FakeBinlogSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tables(tables: Vec<TableSchema>) -> Self {
        let source = Self::new();
        for table in tables {
            source.set_table_schema(table);
        }

        source
    }

    /// Serves `table` from [`BinlogSource::table_schema`] without emitting an event.
    pub fn set_table_schema(&self, table: TableSchema) {
        self.lock().tables.insert(table.name.clone(), table);
    }

    /// Appends a rows event and returns the position of its commit.
    pub fn push_rows(
        &self,
        table: &TableSchema,
        action: RowAction,
        rows: Vec<Vec<BinlogValue>>,
    ) -> BinlogPosition {
        let event = RowsEvent {
            table: Arc::new(table.clone()),
            action,
            timestamp: 1_700_000_000,
            rows,
        };

        self.push(SourceEvent::Rows(event))
    }

    /// Appends any event and returns its position.
    pub fn push(&self, event: SourceEvent) -> BinlogPosition {
        let mut inner = self.lock();
        if let SourceEvent::TableChanged(table) = &event {
            inner.tables.insert(table.name.clone(), table.clone());
        }
        inner.next_offset += 100;
        let position = BinlogPosition::new(FAKE_LOG_FILE, inner.next_offset);
        inner.events.push((position.clone(), event));
        drop(inner);

        self.pushed.notify_one();

        position
    }

    /// Makes the next subscription fail right away with `err`.
    pub fn fail_next_start(&self, err: EtlError) {
        self.lock().fail_next_start = Some(err);
    }

    /// Positions every subscription started from, in order.
    pub fn starts(&self) -> Vec<BinlogPosition> {
        self.lock().starts.clone()
    }

    /// Notified every time a subscription starts.
    pub fn started_notify(&self) -> TimedNotify {
        TimedNotify::new(self.started.clone())
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn pending_after(&self, from: &BinlogPosition) -> Vec<(BinlogPosition, SourceEvent)> {
        self.lock()
            .events
            .iter()
            .filter(|(position, _)| position > from)
            .cloned()
            .collect()
    }

    async fn deliver<H>(
        &self,
        handler: &H,
        position: BinlogPosition,
        event: SourceEvent,
    ) -> EtlResult<()>
    where
        H: BinlogHandler + Send + Sync,
    {
        match event {
            SourceEvent::Rows(event) => {
                handler.on_row(event).await?;
                handler.on_xid(position).await
            }
            SourceEvent::Rotate => handler.on_rotate(position).await,
            SourceEvent::Ddl { schema, query } => handler.on_ddl(position, &schema, &query).await,
            SourceEvent::TableChanged(table) => {
                handler
                    .on_table_changed(&table.name.schema, &table.name.name)
                    .await?;
                handler.on_pos_synced(position, true).await
            }
        }
    }
}

impl BinlogSource for FakeBinlogSource {
    async fn table_schema(&self, table: &TableName) -> EtlResult<TableSchema> {
        self.lock().tables.get(table).cloned().ok_or_else(|| {
            etl_error!(
                ErrorKind::MissingTableSchema,
                "Table not found",
                format!("The source has no table {table}")
            )
        })
    }

    async fn run<H>(
        &self,
        from: BinlogPosition,
        handler: H,
        mut shutdown_rx: ShutdownRx,
    ) -> EtlResult<()>
    where
        H: BinlogHandler + Send + Sync + 'static,
    {
        let failure = {
            let mut inner = self.lock();
            inner.starts.push(from.clone());
            inner.fail_next_start.take()
        };
        self.started.notify_one();

        if let Some(err) = failure {
            return Err(err);
        }

        let mut cursor = from;
        loop {
            for (position, event) in self.pending_after(&cursor) {
                if shutdown_rx.has_changed().unwrap_or(true) {
                    return Ok(());
                }

                self.deliver(&handler, position.clone(), event).await?;
                cursor = position;
            }

            tokio::select! {
                biased;

                _ = shutdown_rx.changed() => return Ok(()),

                _ = self.pushed.notified() => {}
            }
        }
    }
}
