use std::future::Future;
use std::sync::Arc;

use metrics::counter;
use mysql::types::{BinlogPosition, BinlogValue, TableName, TableSchema};
use rhai::Engine;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::binlog::base::BinlogHandler;
use crate::error::{ErrorKind, EtlResult};
use crate::etl_error;
use crate::metrics::{ACTION_LABEL, ETL_EVENTS_RECEIVED_TOTAL, PIPELINE_ID_LABEL};
use crate::rule::{RuleContext, RuleRegistry};
use crate::state::PipelineRuntime;
use crate::types::{PipelineId, RowAction, RowEventRequest, RowsEvent};

/// Payload of a [`Message`].
#[derive(Debug)]
pub enum MessageKind {
    Rows(Vec<RowEventRequest>),
    /// Replication progress. Forced markers (rotation, DDL) flush immediately.
    Position {
        position: BinlogPosition,
        force: bool,
    },
}

/// One item of the channel between the binlog handler and the flush loop.
#[derive(Debug)]
pub struct Message {
    /// Generation of the subscription that produced the message. The flush loop discards
    /// messages of subscriptions stopped by a fault.
    pub epoch: u64,
    pub kind: MessageKind,
}

/// Where the handler puts rows and position markers.
pub trait EventSink {
    fn send_rows(
        &self,
        requests: Vec<RowEventRequest>,
    ) -> impl Future<Output = EtlResult<()>> + Send;

    fn send_position(
        &self,
        position: BinlogPosition,
        force: bool,
    ) -> impl Future<Output = EtlResult<()>> + Send;
}

/// [`EventSink`] backed by the bounded channel of the flush loop.
///
/// A full channel suspends the sender, which suspends the binlog reader.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::Sender<Message>,
    epoch: u64,
}

impl ChannelSink {
    pub fn new(tx: mpsc::Sender<Message>, epoch: u64) -> Self {
        Self { tx, epoch }
    }

    async fn send(&self, kind: MessageKind) -> EtlResult<()> {
        let message = Message {
            epoch: self.epoch,
            kind,
        };

        self.tx.send(message).await.map_err(|_| {
            etl_error!(
                ErrorKind::InvalidState,
                "Flush loop is not running",
                "The channel to the flush loop was closed"
            )
        })
    }
}

impl EventSink for ChannelSink {
    async fn send_rows(&self, requests: Vec<RowEventRequest>) -> EtlResult<()> {
        self.send(MessageKind::Rows(requests)).await
    }

    async fn send_position(&self, position: BinlogPosition, force: bool) -> EtlResult<()> {
        self.send(MessageKind::Position { position, force }).await
    }
}

/// Handler turning binlog callbacks into messages for the flush loop.
#[derive(Debug)]
pub struct StreamEventHandler<E> {
    pipeline_id: PipelineId,
    pipeline_name: Arc<str>,
    registry: RuleRegistry,
    engine: Arc<Engine>,
    runtime: Arc<PipelineRuntime>,
    sink: E,
}

impl<E> StreamEventHandler<E>
where
    E: EventSink,
{
    pub fn new(
        pipeline_id: PipelineId,
        pipeline_name: Arc<str>,
        registry: RuleRegistry,
        engine: Arc<Engine>,
        runtime: Arc<PipelineRuntime>,
        sink: E,
    ) -> Self {
        Self {
            pipeline_id,
            pipeline_name,
            registry,
            engine,
            runtime,
            sink,
        }
    }

    /// Resolves the context of a table, rebuilding it from `table` when it was invalidated.
    ///
    /// Returns [`None`] for tables without a rule.
    fn resolve_context(&self, table: &Arc<TableSchema>) -> EtlResult<Option<Arc<RuleContext>>> {
        if let Some(context) = self.registry.get(self.pipeline_id, &table.name) {
            return Ok(Some(context));
        }

        let Some(rule) = self.registry.rule(self.pipeline_id, &table.name) else {
            return Ok(None);
        };

        info!(
            pipeline_id = self.pipeline_id,
            table = %table.name,
            "rebuilding rule context from the current table metadata"
        );
        let context = Arc::new(RuleContext::build(
            self.pipeline_id,
            &self.pipeline_name,
            rule,
            table.clone(),
            self.engine.clone(),
            true,
        )?);
        self.registry.insert(context.clone());

        Ok(Some(context))
    }

    fn build_requests(
        &self,
        context: &Arc<RuleContext>,
        action: RowAction,
        timestamp: u32,
        rows: Vec<Vec<BinlogValue>>,
    ) -> Vec<RowEventRequest> {
        let expected = context.table().num_columns();
        let retain_previous = context.rule().retain_previous_row;
        let mut requests = Vec::with_capacity(rows.len());
        let mut skipped = 0usize;

        if action == RowAction::Update {
            let mut images = rows.into_iter();
            while let (Some(before), Some(after)) = (images.next(), images.next()) {
                if before.len() != expected || after.len() != expected {
                    skipped += 1;
                    continue;
                }

                let request = RowEventRequest::new(context.clone(), action, timestamp, after);
                requests.push(if retain_previous {
                    request.with_previous(before)
                } else {
                    request
                });
            }
        } else {
            for values in rows {
                if values.len() != expected {
                    skipped += 1;
                    continue;
                }

                requests.push(RowEventRequest::new(
                    context.clone(),
                    action,
                    timestamp,
                    values,
                ));
            }
        }

        if skipped > 0 {
            warn!(
                pipeline_id = self.pipeline_id,
                table = %context.table_name(),
                skipped,
                expected_columns = expected,
                "skipping rows whose width does not match the table metadata"
            );
        }

        requests
    }

    fn table_name(schema: &str, table: &str) -> TableName {
        TableName::new(schema, table)
    }
}

impl<E> BinlogHandler for StreamEventHandler<E>
where
    E: EventSink + Send + Sync,
{
    async fn on_row(&self, event: RowsEvent) -> EtlResult<()> {
        let Some(context) = self.resolve_context(&event.table)? else {
            return Ok(());
        };

        let RowsEvent {
            action,
            timestamp,
            rows,
            ..
        } = event;
        let requests = self.build_requests(&context, action, timestamp, rows);
        if requests.is_empty() {
            return Ok(());
        }

        let count = requests.len() as u64;
        self.runtime.record_intake(action, count);
        counter!(
            ETL_EVENTS_RECEIVED_TOTAL,
            PIPELINE_ID_LABEL => self.pipeline_id.to_string(),
            ACTION_LABEL => action.as_str()
        )
        .increment(count);

        self.sink.send_rows(requests).await
    }

    async fn on_rotate(&self, next: BinlogPosition) -> EtlResult<()> {
        debug!(pipeline_id = self.pipeline_id, position = %next, "binlog rotated");

        self.sink.send_position(next, true).await
    }

    async fn on_ddl(&self, position: BinlogPosition, schema: &str, query: &str) -> EtlResult<()> {
        debug!(
            pipeline_id = self.pipeline_id,
            schema,
            query,
            "ddl statement replicated"
        );

        self.sink.send_position(position, true).await
    }

    async fn on_xid(&self, position: BinlogPosition) -> EtlResult<()> {
        self.sink.send_position(position, false).await
    }

    async fn on_gtid(&self, _gtid: &str) -> EtlResult<()> {
        Ok(())
    }

    async fn on_table_changed(&self, schema: &str, table: &str) -> EtlResult<()> {
        self.registry
            .invalidate(self.pipeline_id, &Self::table_name(schema, table));

        Ok(())
    }

    async fn on_pos_synced(&self, position: BinlogPosition, force: bool) -> EtlResult<()> {
        self.sink.send_position(position, force).await
    }
}

#[cfg(test)]
mod tests {
    use config::shared::RuleConfig;
    use mysql::types::{ColumnSchema, ColumnType};

    use super::*;
    use crate::script::new_engine;
    use crate::test_utils::schema::users_table_schema;

    fn handler(
        rule: RuleConfig,
    ) -> (
        StreamEventHandler<ChannelSink>,
        mpsc::Receiver<Message>,
        Arc<PipelineRuntime>,
    ) {
        let registry = RuleRegistry::new();
        registry.register(1, rule);
        let runtime = Arc::new(PipelineRuntime::new(1));
        let (tx, rx) = mpsc::channel(16);

        let handler = StreamEventHandler::new(
            1,
            Arc::from("test"),
            registry,
            Arc::new(new_engine()),
            runtime.clone(),
            ChannelSink::new(tx, 3),
        );

        (handler, rx, runtime)
    }

    fn rows_event(table: TableSchema, action: RowAction, rows: Vec<Vec<BinlogValue>>) -> RowsEvent {
        RowsEvent {
            table: Arc::new(table),
            action,
            timestamp: 10,
            rows,
        }
    }

    #[tokio::test]
    async fn updates_pair_images_and_count_intake() {
        let mut rule = RuleConfig::new("shop", "users");
        rule.retain_previous_row = true;
        let (handler, mut rx, runtime) = handler(rule);

        handler
            .on_row(rows_event(
                users_table_schema(),
                RowAction::Update,
                vec![
                    vec![1i64.into(), "a".into()],
                    vec![1i64.into(), "b".into()],
                    vec![2i64.into(), "c".into()],
                    vec![2i64.into(), "d".into()],
                ],
            ))
            .await
            .unwrap();

        let message = rx.recv().await.unwrap();
        assert_eq!(message.epoch, 3);
        let MessageKind::Rows(requests) = message.kind else {
            panic!("expected rows");
        };
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[0].values[1], BinlogValue::from("b"));
        assert_eq!(
            requests[0].previous.as_ref().unwrap()[1],
            BinlogValue::from("a")
        );
        assert_eq!(runtime.intake(RowAction::Update), 2);
    }

    #[tokio::test]
    async fn rows_of_unknown_tables_are_ignored() {
        let (handler, mut rx, runtime) = handler(RuleConfig::new("shop", "orders"));

        handler
            .on_row(rows_event(
                users_table_schema(),
                RowAction::Insert,
                vec![vec![1i64.into(), "a".into()]],
            ))
            .await
            .unwrap();

        assert!(rx.try_recv().is_err());
        assert_eq!(runtime.intake(RowAction::Insert), 0);
    }

    #[tokio::test]
    async fn drifted_rows_are_skipped_until_the_table_changes() {
        let (handler, mut rx, runtime) = handler(RuleConfig::new("shop", "users"));

        handler
            .on_row(rows_event(
                users_table_schema(),
                RowAction::Insert,
                vec![vec![1i64.into(), "a".into()]],
            ))
            .await
            .unwrap();
        assert!(matches!(rx.recv().await.unwrap().kind, MessageKind::Rows(_)));

        let mut widened = users_table_schema();
        widened
            .column_schemas
            .push(ColumnSchema::new("email", ColumnType::String));
        let widened_row = vec![2i64.into(), "b".into(), "b@example.com".into()];

        handler
            .on_row(rows_event(
                widened.clone(),
                RowAction::Insert,
                vec![widened_row.clone()],
            ))
            .await
            .unwrap();
        assert!(rx.try_recv().is_err());
        assert_eq!(runtime.intake(RowAction::Insert), 1);

        handler.on_table_changed("shop", "users").await.unwrap();
        handler
            .on_row(rows_event(widened, RowAction::Insert, vec![widened_row]))
            .await
            .unwrap();

        let MessageKind::Rows(requests) = rx.recv().await.unwrap().kind else {
            panic!("expected rows");
        };
        assert_eq!(requests[0].context.row_width(), 3);
    }

    #[tokio::test]
    async fn position_signals_become_markers() {
        let (handler, mut rx, _) = handler(RuleConfig::new("shop", "users"));

        handler
            .on_xid(BinlogPosition::new("mysql-bin.000001", 300))
            .await
            .unwrap();
        handler
            .on_rotate(BinlogPosition::new("mysql-bin.000002", 4))
            .await
            .unwrap();
        handler.on_gtid("3E11FA47-71CA-11E1-9E33-C80AA9429562:23").await.unwrap();

        let forces: Vec<bool> = [rx.recv().await.unwrap(), rx.recv().await.unwrap()]
            .into_iter()
            .map(|message| match message.kind {
                MessageKind::Position { force, .. } => force,
                MessageKind::Rows(_) => panic!("expected a position"),
            })
            .collect();
        assert_eq!(forces, vec![false, true]);
        assert!(rx.try_recv().is_err());
    }
}
