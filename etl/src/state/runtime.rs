use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Utc};
use metrics::gauge;
use mysql::types::{BinlogPosition, TableName};
use serde::Serialize;

use crate::metrics::{ETL_PIPELINE_STATUS, PIPELINE_ID_LABEL};
use crate::types::{PipelineId, RowAction};

/// Lifecycle status of a pipeline.
///
/// `Initial`, `Running`, `Fault`, `Close`, `Panic` and `Fail` describe the stream, while
/// `Batching` and `BatchEnd` describe a bulk export sharing the same record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStatus {
    Initial,
    Running,
    /// The destination failed; the binlog subscription is stopped until a ping succeeds.
    Fault,
    Close,
    /// Stopped on an unrecoverable error. Needs an explicit restart.
    Panic,
    Batching,
    BatchEnd,
    /// The binlog subscription could not be started.
    Fail,
}

impl PipelineStatus {
    /// Numeric code reported through the status gauge.
    pub fn code(&self) -> u8 {
        match self {
            PipelineStatus::Initial => 0,
            PipelineStatus::Running => 1,
            PipelineStatus::Fault => 2,
            PipelineStatus::Close => 3,
            PipelineStatus::Panic => 4,
            PipelineStatus::Batching => 5,
            PipelineStatus::BatchEnd => 6,
            PipelineStatus::Fail => 7,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineStatus::Initial => "initial",
            PipelineStatus::Running => "running",
            PipelineStatus::Fault => "fault",
            PipelineStatus::Close => "close",
            PipelineStatus::Panic => "panic",
            PipelineStatus::Batching => "batching",
            PipelineStatus::BatchEnd => "batch_end",
            PipelineStatus::Fail => "fail",
        }
    }

    /// Whether a binlog subscription is live or recovering.
    pub fn is_streaming(&self) -> bool {
        matches!(self, PipelineStatus::Running | PipelineStatus::Fault)
    }

    /// Whether the status ends the pipeline.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PipelineStatus::Close | PipelineStatus::Panic | PipelineStatus::Fail
        )
    }
}

impl fmt::Display for PipelineStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Row counters of one exported table.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ExportProgress {
    pub total_rows: u64,
    pub imported_rows: u64,
}

#[derive(Debug)]
struct RuntimeInner {
    status: PipelineStatus,
    started_at: Option<DateTime<Utc>>,
    updated_at: DateTime<Utc>,
    position: Option<BinlogPosition>,
    message: Option<String>,
    exports: BTreeMap<TableName, ExportProgress>,
}

/// Mutable status record of one pipeline.
///
/// Intake counters are atomics because they are bumped for every row. Everything else sits
/// behind a mutex that is only held for the duration of a field update.
#[derive(Debug)]
pub struct PipelineRuntime {
    pipeline_id: PipelineId,
    inserts: AtomicU64,
    updates: AtomicU64,
    deletes: AtomicU64,
    inner: Mutex<RuntimeInner>,
}

impl PipelineRuntime {
    pub fn new(pipeline_id: PipelineId) -> Self {
        Self {
            pipeline_id,
            inserts: AtomicU64::new(0),
            updates: AtomicU64::new(0),
            deletes: AtomicU64::new(0),
            inner: Mutex::new(RuntimeInner {
                status: PipelineStatus::Initial,
                started_at: None,
                updated_at: Utc::now(),
                position: None,
                message: None,
                exports: BTreeMap::new(),
            }),
        }
    }

    pub fn pipeline_id(&self) -> PipelineId {
        self.pipeline_id
    }

    pub fn status(&self) -> PipelineStatus {
        self.lock().status
    }

    pub fn set_status(&self, status: PipelineStatus) {
        let mut inner = self.lock();
        if status == PipelineStatus::Running && inner.started_at.is_none() {
            inner.started_at = Some(Utc::now());
        }
        inner.status = status;
        inner.updated_at = Utc::now();
        drop(inner);

        gauge!(ETL_PIPELINE_STATUS, PIPELINE_ID_LABEL => self.pipeline_id.to_string())
            .set(status.code() as f64);
    }

    /// Sets a bulk export status unless a live binlog subscription owns the record.
    ///
    /// While the stream is `Running` or in `Fault` an export only shows up in its per-table
    /// counters. Returns whether the status changed.
    pub fn set_export_status(&self, status: PipelineStatus) -> bool {
        let mut inner = self.lock();
        if inner.status.is_streaming() {
            return false;
        }
        inner.status = status;
        inner.updated_at = Utc::now();
        drop(inner);

        gauge!(ETL_PIPELINE_STATUS, PIPELINE_ID_LABEL => self.pipeline_id.to_string())
            .set(status.code() as f64);

        true
    }

    /// Sets the status together with the message explaining it.
    pub fn set_status_with_message(&self, status: PipelineStatus, message: impl Into<String>) {
        self.set_message(message);
        self.set_status(status);
    }

    pub fn set_message(&self, message: impl Into<String>) {
        let mut inner = self.lock();
        inner.message = Some(message.into());
        inner.updated_at = Utc::now();
    }

    pub fn message(&self) -> Option<String> {
        self.lock().message.clone()
    }

    pub fn position(&self) -> Option<BinlogPosition> {
        self.lock().position.clone()
    }

    /// Records the last persisted position.
    pub fn set_position(&self, position: BinlogPosition) {
        let mut inner = self.lock();
        inner.position = Some(position);
        inner.updated_at = Utc::now();
    }

    /// Counts `count` rows of `action` taken from the source.
    pub fn record_intake(&self, action: RowAction, count: u64) {
        let counter = match action {
            RowAction::Insert => &self.inserts,
            RowAction::Update => &self.updates,
            RowAction::Delete => &self.deletes,
        };
        counter.fetch_add(count, Ordering::Relaxed);
    }

    pub fn intake(&self, action: RowAction) -> u64 {
        match action {
            RowAction::Insert => self.inserts.load(Ordering::Relaxed),
            RowAction::Update => self.updates.load(Ordering::Relaxed),
            RowAction::Delete => self.deletes.load(Ordering::Relaxed),
        }
    }

    /// Starts tracking an export of `table` with its real row count.
    pub fn start_export(&self, table: TableName, total_rows: u64) {
        let mut inner = self.lock();
        inner.exports.insert(
            table,
            ExportProgress {
                total_rows,
                imported_rows: 0,
            },
        );
        inner.updated_at = Utc::now();
    }

    pub fn add_imported(&self, table: &TableName, rows: u64) {
        let mut inner = self.lock();
        if let Some(progress) = inner.exports.get_mut(table) {
            progress.imported_rows += rows;
        }
    }

    pub fn export_progress(&self, table: &TableName) -> Option<ExportProgress> {
        self.lock().exports.get(table).copied()
    }

    pub fn snapshot(&self) -> RuntimeSnapshot {
        let inner = self.lock();

        RuntimeSnapshot {
            pipeline_id: self.pipeline_id,
            status: inner.status,
            started_at: inner.started_at,
            updated_at: inner.updated_at,
            position: inner.position.clone(),
            inserts: self.inserts.load(Ordering::Relaxed),
            updates: self.updates.load(Ordering::Relaxed),
            deletes: self.deletes.load(Ordering::Relaxed),
            message: inner.message.clone(),
            exports: inner
                .exports
                .iter()
                .map(|(table, progress)| (table.to_string(), *progress))
                .collect(),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, RuntimeInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Read-only copy of a [`PipelineRuntime`], serializable for status endpoints.
#[derive(Debug, Clone, Serialize)]
pub struct RuntimeSnapshot {
    pub pipeline_id: PipelineId,
    pub status: PipelineStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
    pub position: Option<BinlogPosition>,
    pub inserts: u64,
    pub updates: u64,
    pub deletes: u64,
    pub message: Option<String>,
    pub exports: BTreeMap<String, ExportProgress>,
}
