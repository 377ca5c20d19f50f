use std::sync::Arc;
use std::time::Duration;

use mysql::types::TableName;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::info;

use crate::destination::Destination;
use crate::error::EtlResult;
use crate::rule::{RowMap, RuleContext};
use crate::script::{ScriptOutput, ScriptSession};
use crate::types::{RowAction, RowEventRequest};

/// One row as the memory destination received it.
#[derive(Debug, Clone, PartialEq)]
pub struct MemoryRecord {
    pub table: TableName,
    pub action: RowAction,
    pub row: RowMap,
    pub previous: Option<RowMap>,
    /// Writes requested by the rule's script. Empty for declarative rules.
    pub outputs: Vec<ScriptOutput>,
}

#[derive(Debug, Default)]
struct Inner {
    records: Vec<MemoryRecord>,
    stream_batches: usize,
    export_batches: usize,
    connects: usize,
    closed: bool,
}

/// In-memory destination for tests and dry runs.
///
/// Rows are transformed exactly like network destinations transform them, then kept in arrival
/// order.
#[derive(Debug, Clone, Default)]
pub struct MemoryDestination {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryDestination {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn records(&self) -> Vec<MemoryRecord> {
        self.inner.lock().await.records.clone()
    }

    /// Records of one table, in arrival order.
    pub async fn table_records(&self, table: &TableName) -> Vec<MemoryRecord> {
        let inner = self.inner.lock().await;
        inner
            .records
            .iter()
            .filter(|record| &record.table == table)
            .cloned()
            .collect()
    }

    /// Waits until at least `count` records arrived. Returns `false` on timeout.
    pub async fn wait_for_records(&self, count: usize, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.inner.lock().await.records.len() >= count {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }

            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    pub async fn stream_batches(&self) -> usize {
        self.inner.lock().await.stream_batches
    }

    pub async fn export_batches(&self) -> usize {
        self.inner.lock().await.export_batches
    }

    pub async fn connects(&self) -> usize {
        self.inner.lock().await.connects
    }

    pub async fn is_closed(&self) -> bool {
        self.inner.lock().await.closed
    }

    pub async fn clear(&self) {
        let mut inner = self.inner.lock().await;
        inner.records.clear();
        inner.stream_batches = 0;
        inner.export_batches = 0;
    }
}

fn build_record(
    context: &RuleContext,
    request: &RowEventRequest,
    session: Option<&mut ScriptSession>,
) -> EtlResult<MemoryRecord> {
    let outputs = if context.is_script() {
        context.run_script(request, session)?
    } else {
        Vec::new()
    };

    Ok(MemoryRecord {
        table: context.table_name().clone(),
        action: request.action,
        row: context.row(request),
        previous: context.previous_row(request),
        outputs,
    })
}

impl Destination for MemoryDestination {
    fn name() -> &'static str {
        "memory"
    }

    async fn connect(&self) -> EtlResult<()> {
        let mut inner = self.inner.lock().await;
        inner.connects += 1;
        inner.closed = false;

        Ok(())
    }

    async fn ping(&self) -> EtlResult<()> {
        Ok(())
    }

    async fn close(&self) -> EtlResult<()> {
        self.inner.lock().await.closed = true;

        Ok(())
    }

    async fn write_rows(&self, requests: Vec<RowEventRequest>) -> EtlResult<()> {
        let records = requests
            .iter()
            .map(|request| build_record(&request.context, request, None))
            .collect::<EtlResult<Vec<_>>>()?;

        let mut inner = self.inner.lock().await;
        info!(rows = records.len(), "writing rows to memory destination");
        inner.records.extend(records);
        inner.stream_batches += 1;

        Ok(())
    }

    async fn write_batch(
        &self,
        context: &RuleContext,
        requests: Vec<RowEventRequest>,
        mut session: Option<&mut ScriptSession>,
    ) -> EtlResult<usize> {
        let records = requests
            .iter()
            .map(|request| build_record(context, request, session.as_deref_mut()))
            .collect::<EtlResult<Vec<_>>>()?;
        let written = records.len();

        let mut inner = self.inner.lock().await;
        inner.records.extend(records);
        inner.export_batches += 1;

        Ok(written)
    }
}
