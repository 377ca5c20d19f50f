use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use mysql::types::{BinlogValue, TableName, TableSchema};

use crate::bail;
use crate::error::{ErrorKind, EtlResult};
use crate::export::TableScanner;

#[derive(Debug, Default)]
struct Inner {
    tables: HashMap<TableName, Vec<Vec<BinlogValue>>>,
    fail_at_offset: Option<u64>,
    fetched_offsets: Vec<u64>,
}

/// [`TableScanner`] serving rows from memory.
///
/// Rows are returned in insertion order, which stands in for the order column.
#[derive(Debug, Clone, Default)]
pub struct MemoryTableScanner {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryTableScanner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_rows(&self, table: TableName, rows: Vec<Vec<BinlogValue>>) {
        self.lock().tables.entry(table).or_default().extend(rows);
    }

    /// Makes the page starting at `offset` fail with [`ErrorKind::SourceQueryFailed`].
    pub fn fail_at_offset(&self, offset: u64) {
        self.lock().fail_at_offset = Some(offset);
    }

    /// Offsets of every fetched page, sorted.
    pub fn fetched_offsets(&self) -> Vec<u64> {
        let mut offsets = self.lock().fetched_offsets.clone();
        offsets.sort_unstable();

        offsets
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl TableScanner for MemoryTableScanner {
    async fn count(&self, table: &TableSchema) -> EtlResult<u64> {
        let inner = self.lock();
        let rows = inner.tables.get(&table.name).map_or(0, Vec::len);

        Ok(rows as u64)
    }

    async fn fetch_page(
        &self,
        table: &TableSchema,
        _order_column: &str,
        offset: u64,
        limit: u64,
    ) -> EtlResult<Vec<Vec<BinlogValue>>> {
        let mut inner = self.lock();
        inner.fetched_offsets.push(offset);

        if inner.fail_at_offset == Some(offset) {
            bail!(
                ErrorKind::SourceQueryFailed,
                "Page query failed",
                format!("Injected failure at offset {offset}")
            );
        }

        let Some(rows) = inner.tables.get(&table.name) else {
            return Ok(Vec::new());
        };
        let start = usize::try_from(offset).unwrap_or(usize::MAX).min(rows.len());
        let end = start
            .saturating_add(usize::try_from(limit).unwrap_or(usize::MAX))
            .min(rows.len());

        Ok(rows[start..end].to_vec())
    }
}
