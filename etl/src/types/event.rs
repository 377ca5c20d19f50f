use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use mysql::types::{BinlogValue, TableName, TableSchema};
use serde::{Deserialize, Serialize};

use crate::bail;
use crate::error::{ErrorKind, EtlError, EtlResult};
use crate::rule::RuleContext;

/// Kind of row mutation carried by a binlog rows event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RowAction {
    Insert,
    Update,
    Delete,
}

impl RowAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            RowAction::Insert => "insert",
            RowAction::Update => "update",
            RowAction::Delete => "delete",
        }
    }
}

impl fmt::Display for RowAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RowAction {
    type Err = EtlError;

    fn from_str(s: &str) -> EtlResult<Self> {
        match s {
            "insert" => Ok(RowAction::Insert),
            "update" => Ok(RowAction::Update),
            "delete" => Ok(RowAction::Delete),
            _ => bail!(
                ErrorKind::InvalidData,
                "Unknown row action",
                format!("The action '{s}' is not one of insert, update or delete")
            ),
        }
    }
}

/// A decoded rows event as delivered by the binlog client.
///
/// The client resolves the table metadata at decode time, so [`RowsEvent::table`] always
/// describes the layout the rows were written with.
#[derive(Debug, Clone)]
pub struct RowsEvent {
    pub table: Arc<TableSchema>,
    pub action: RowAction,
    /// Event timestamp in seconds since the epoch.
    pub timestamp: u32,
    /// Row images. For updates, before and after images alternate.
    pub rows: Vec<Vec<BinlogValue>>,
}

impl RowsEvent {
    pub fn table_name(&self) -> &TableName {
        &self.table.name
    }
}

/// One row mutation bound to the rule that transforms it.
///
/// Requests own their value vectors, which are moved out of the decoded [`RowsEvent`] without
/// copying and dropped once the destination has consumed the batch.
#[derive(Debug, Clone)]
pub struct RowEventRequest {
    pub context: Arc<RuleContext>,
    pub action: RowAction,
    pub timestamp: u32,
    pub values: Vec<BinlogValue>,
    /// Before-image of an update, kept only when the rule retains previous rows.
    pub previous: Option<Vec<BinlogValue>>,
}

impl RowEventRequest {
    pub fn new(
        context: Arc<RuleContext>,
        action: RowAction,
        timestamp: u32,
        values: Vec<BinlogValue>,
    ) -> Self {
        Self {
            context,
            action,
            timestamp,
            values,
            previous: None,
        }
    }

    pub fn with_previous(mut self, previous: Vec<BinlogValue>) -> Self {
        self.previous = Some(previous);
        self
    }

    pub fn table_name(&self) -> &TableName {
        self.context.table_name()
    }
}
