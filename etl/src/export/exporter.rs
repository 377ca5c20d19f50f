use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use chrono::Utc;
use config::shared::ExportConfig;
use metrics::counter;
use mysql::types::TableName;
use tokio::task::JoinSet;
use tracing::{Instrument, error, info, warn};

use crate::destination::Destination;
use crate::error::{ErrorKind, EtlError, EtlResult};
use crate::etl_error;
use crate::export::scanner::TableScanner;
use crate::metrics::{ETL_EXPORT_ROWS_TOTAL, PIPELINE_ID_LABEL, TABLE_NAME_LABEL};
use crate::rule::RuleContext;
use crate::script::{InterpreterPool, ScriptSession};
use crate::state::{PipelineRuntime, PipelineStatus};
use crate::types::{PipelineId, RowAction, RowEventRequest};

/// Outcome of one table export.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportReport {
    pub table: TableName,
    pub total_rows: u64,
    pub imported_rows: u64,
    pub pages: u64,
}

impl ExportReport {
    /// Whether every counted row reached the destination.
    pub fn is_complete(&self) -> bool {
        self.total_rows == self.imported_rows
    }
}

/// Copies whole tables through their rules into a destination.
#[derive(Debug)]
pub struct BulkExporter<T, D> {
    pipeline_id: PipelineId,
    config: ExportConfig,
    scanner: T,
    destination: D,
    runtime: Arc<PipelineRuntime>,
    interpreters: Arc<InterpreterPool>,
}

impl<T, D> BulkExporter<T, D>
where
    T: TableScanner + Clone + Send + Sync + 'static,
    D: Destination + Clone + Send + Sync + 'static,
{
    pub fn new(
        pipeline_id: PipelineId,
        config: ExportConfig,
        scanner: T,
        destination: D,
        runtime: Arc<PipelineRuntime>,
    ) -> Self {
        Self {
            pipeline_id,
            config,
            scanner,
            destination,
            runtime,
            interpreters: Arc::new(InterpreterPool::new()),
        }
    }

    /// Exports every context whose rule names an order column, one table after the other.
    pub async fn export_all(&self, contexts: &[Arc<RuleContext>]) -> EtlResult<Vec<ExportReport>> {
        let mut reports = Vec::new();
        for context in contexts {
            if context.rule().order_column.is_none() {
                info!(table = %context.table_name(), "rule has no order column, skipping export");
                continue;
            }

            reports.push(self.export_table(context.clone()).await?);
        }

        Ok(reports)
    }

    /// Exports one table.
    ///
    /// The status moves through `Batching` and `BatchEnd` only when no binlog subscription
    /// shares the runtime record.
    ///
    /// The first failing page stops every worker before it claims its next page. Pages already
    /// in flight finish, so a failed export may still have written part of the table.
    pub async fn export_table(&self, context: Arc<RuleContext>) -> EtlResult<ExportReport> {
        let table_name = context.table_name().clone();
        let Some(order_column) = context.rule().order_column.clone() else {
            return Err(etl_error!(
                ErrorKind::MissingOrderColumn,
                "Bulk export requires an order column",
                format!("The rule of table {table_name} has no order_column")
            ));
        };

        self.runtime.set_export_status(PipelineStatus::Batching);

        match self.run_export(context, order_column).await {
            Ok(report) => {
                if !report.is_complete() {
                    warn!(
                        table = %report.table,
                        total_rows = report.total_rows,
                        imported_rows = report.imported_rows,
                        "exported row count differs from the counted total"
                    );
                }
                info!(
                    table = %report.table,
                    imported_rows = report.imported_rows,
                    pages = report.pages,
                    "table export finished"
                );
                self.runtime.set_export_status(PipelineStatus::BatchEnd);

                Ok(report)
            }
            Err(err) => {
                error!(table = %table_name, error = %err, "table export failed");
                self.runtime.set_message(err.to_string());
                self.runtime.set_export_status(PipelineStatus::Fail);

                Err(err)
            }
        }
    }

    async fn run_export(
        &self,
        context: Arc<RuleContext>,
        order_column: String,
    ) -> EtlResult<ExportReport> {
        let table_name = context.table_name().clone();
        let total_rows = self.scanner.count(context.table()).await?;
        let page_size = self.config.page_size.max(1);
        let pages = total_rows.div_ceil(page_size);

        self.runtime.start_export(table_name.clone(), total_rows);
        info!(
            table = %table_name,
            total_rows,
            pages,
            workers = self.config.workers,
            "starting table export"
        );

        let next_page = Arc::new(AtomicU64::new(0));
        let shutoff = Arc::new(AtomicBool::new(false));
        let order_column: Arc<str> = Arc::from(order_column);

        let mut join_set = JoinSet::new();
        for worker in 0..usize::from(self.config.workers.max(1)) {
            let page_worker = PageWorker {
                pipeline_id: self.pipeline_id,
                worker,
                pages,
                page_size,
                order_column: order_column.clone(),
                context: context.clone(),
                scanner: self.scanner.clone(),
                destination: self.destination.clone(),
                runtime: self.runtime.clone(),
                interpreters: self.interpreters.clone(),
                next_page: next_page.clone(),
                shutoff: shutoff.clone(),
            };

            let span = tracing::info_span!("export_worker", table = %table_name, worker);
            join_set.spawn(page_worker.run().instrument(span.or_current()));
        }

        let mut errors: Vec<EtlError> = Vec::new();
        let mut processed_pages = 0;
        let mut imported_rows = 0;
        while let Some(result) = join_set.join_next().await {
            match result {
                Ok(Ok(progress)) => {
                    processed_pages += progress.pages;
                    imported_rows += progress.rows;
                }
                Ok(Err(err)) => errors.push(err),
                Err(join_err) => {
                    shutoff.store(true, Ordering::Release);
                    errors.push(etl_error!(
                        ErrorKind::ExportWorkerPanic,
                        "Export worker panicked",
                        join_err
                    ));
                }
            }
        }

        if !errors.is_empty() {
            return Err(errors.into());
        }

        Ok(ExportReport {
            table: table_name,
            total_rows,
            imported_rows,
            pages: processed_pages,
        })
    }
}

#[derive(Debug, Default)]
struct WorkerProgress {
    pages: u64,
    rows: u64,
}

struct PageWorker<T, D> {
    pipeline_id: PipelineId,
    worker: usize,
    pages: u64,
    page_size: u64,
    order_column: Arc<str>,
    context: Arc<RuleContext>,
    scanner: T,
    destination: D,
    runtime: Arc<PipelineRuntime>,
    interpreters: Arc<InterpreterPool>,
    next_page: Arc<AtomicU64>,
    shutoff: Arc<AtomicBool>,
}

impl<T, D> PageWorker<T, D>
where
    T: TableScanner,
    D: Destination,
{
    async fn run(self) -> EtlResult<WorkerProgress> {
        let mut session = self.interpreters.checkout(&self.context, self.worker);
        let mut progress = WorkerProgress::default();

        let result = loop {
            if self.shutoff.load(Ordering::Acquire) {
                break Ok(());
            }

            let page = self.next_page.fetch_add(1, Ordering::AcqRel);
            if page >= self.pages {
                break Ok(());
            }

            match self.export_page(page, session.as_mut()).await {
                Ok(rows) => {
                    progress.pages += 1;
                    progress.rows += rows;
                }
                Err(err) => {
                    self.shutoff.store(true, Ordering::Release);
                    break Err(err);
                }
            }
        };

        if let Some(session) = session {
            self.interpreters
                .checkin(self.context.table_name().clone(), self.worker, session);
        }

        result.map(|()| progress)
    }

    async fn export_page(
        &self,
        page: u64,
        session: Option<&mut ScriptSession>,
    ) -> EtlResult<u64> {
        let offset = page * self.page_size;
        let rows = self
            .scanner
            .fetch_page(
                self.context.table(),
                &self.order_column,
                offset,
                self.page_size,
            )
            .await?;
        if rows.is_empty() {
            return Ok(0);
        }

        let timestamp = u32::try_from(Utc::now().timestamp()).unwrap_or_default();
        let requests = rows
            .into_iter()
            .map(|values| {
                RowEventRequest::new(self.context.clone(), RowAction::Insert, timestamp, values)
            })
            .collect();

        let written = self
            .destination
            .write_batch(&self.context, requests, session)
            .await?;
        let written = written as u64;

        let table_name = self.context.table_name();
        self.runtime.add_imported(table_name, written);
        counter!(
            ETL_EXPORT_ROWS_TOTAL,
            PIPELINE_ID_LABEL => self.pipeline_id.to_string(),
            TABLE_NAME_LABEL => table_name.to_string()
        )
        .increment(written);

        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use config::shared::RuleConfig;
    use mysql::types::BinlogValue;

    use super::*;
    use crate::destination::memory::MemoryDestination;
    use crate::script::new_engine;
    use crate::test_utils::scanner::MemoryTableScanner;
    use crate::test_utils::schema::users_table_schema;

    fn users_context(order_column: Option<&str>) -> Arc<RuleContext> {
        let mut rule = RuleConfig::new("shop", "users");
        rule.order_column = order_column.map(str::to_string);

        Arc::new(
            RuleContext::build(
                1,
                "test",
                Arc::new(rule),
                Arc::new(users_table_schema()),
                Arc::new(new_engine()),
                false,
            )
            .unwrap(),
        )
    }

    fn user_rows(count: i64) -> Vec<Vec<BinlogValue>> {
        (1..=count)
            .map(|id| vec![id.into(), format!("user-{id}").into()])
            .collect()
    }

    fn export_config(workers: u16, page_size: u64) -> ExportConfig {
        ExportConfig {
            workers,
            page_size,
            ..ExportConfig::default()
        }
    }

    #[tokio::test]
    async fn rule_without_order_column_is_rejected() {
        let exporter = BulkExporter::new(
            1,
            export_config(2, 10),
            MemoryTableScanner::new(),
            MemoryDestination::new(),
            Arc::new(PipelineRuntime::new(1)),
        );

        let err = exporter.export_table(users_context(None)).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MissingOrderColumn);
    }

    #[tokio::test]
    async fn small_table_is_exported_in_pages() {
        let scanner = MemoryTableScanner::new();
        scanner.insert_rows(users_table_schema().name, user_rows(25));
        let destination = MemoryDestination::new();
        let runtime = Arc::new(PipelineRuntime::new(1));
        let exporter = BulkExporter::new(
            1,
            export_config(3, 10),
            scanner.clone(),
            destination.clone(),
            runtime.clone(),
        );

        let report = exporter.export_table(users_context(Some("id"))).await.unwrap();

        assert_eq!(report.pages, 3);
        assert_eq!(report.total_rows, 25);
        assert!(report.is_complete());
        assert_eq!(destination.records().await.len(), 25);
        assert_eq!(destination.export_batches().await, 3);
        assert_eq!(runtime.snapshot().status, PipelineStatus::BatchEnd);
        let progress = runtime.export_progress(&report.table).unwrap();
        assert_eq!(progress.total_rows, 25);
        assert_eq!(progress.imported_rows, 25);
    }

    #[tokio::test]
    async fn failing_page_stops_the_export() {
        let scanner = MemoryTableScanner::new();
        scanner.insert_rows(users_table_schema().name, user_rows(50));
        scanner.fail_at_offset(20);
        let runtime = Arc::new(PipelineRuntime::new(1));
        let exporter = BulkExporter::new(
            1,
            export_config(1, 10),
            scanner.clone(),
            MemoryDestination::new(),
            runtime.clone(),
        );

        let err = exporter
            .export_table(users_context(Some("id")))
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::SourceQueryFailed);
        // A single worker stops right after the failing page.
        assert_eq!(scanner.fetched_offsets(), vec![0, 10, 20]);
        assert_eq!(runtime.snapshot().status, PipelineStatus::Fail);
        let progress = runtime
            .export_progress(&users_table_schema().name)
            .unwrap();
        assert_eq!(progress.total_rows, 50);
        assert_eq!(progress.imported_rows, 20);
    }
}
