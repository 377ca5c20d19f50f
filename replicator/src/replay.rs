//! A [`BinlogSource`] that replays decoded binlog events from a JSON-lines file.
//!
//! Each line holds one event and the position that follows it, e.g.
//!
//! ```json
//! {"position":{"file":"mysql-bin.000001","offset":420},"event":{"type":"rows","schema":"shop","table":"users","action":"insert","timestamp":1700000000,"rows":[[{"type":"signed","value":1},{"type":"text","value":"ada"}]]}}
//! {"position":{"file":"mysql-bin.000001","offset":451},"event":{"type":"xid"}}
//! ```
//!
//! Table metadata comes from the source database. Once the file is exhausted the subscription
//! idles until shutdown, like a live subscription that caught up.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use etl::binlog::{BinlogHandler, BinlogSource};
use etl::concurrency::shutdown::ShutdownRx;
use etl::error::{ErrorKind, EtlError, EtlResult};
use etl::etl_error;
use etl::types::{RowAction, RowsEvent};
use mysql::schema::get_table_schema;
use mysql::types::{BinlogPosition, BinlogValue, TableName, TableSchema};
use serde::Deserialize;
use sqlx::MySqlPool;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::Mutex;
use tracing::{debug, info};

/// One line of a replay file.
#[derive(Debug, Clone, Deserialize)]
pub struct ReplayLine {
    pub position: BinlogPosition,
    pub event: ReplayEvent,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum ReplayEvent {
    Rows {
        schema: String,
        table: String,
        action: RowAction,
        #[serde(default)]
        timestamp: u32,
        rows: Vec<Vec<BinlogValue>>,
    },
    Rotate,
    Ddl {
        schema: String,
        query: String,
    },
    Xid,
    Gtid {
        gtid: String,
    },
    TableChanged {
        schema: String,
        table: String,
    },
}

/// Parses one line of a replay file. Blank lines yield `None`.
pub fn parse_line(line: &str) -> EtlResult<Option<ReplayLine>> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }

    serde_json::from_str(line).map(Some).map_err(|err| {
        EtlError::from((
            ErrorKind::InvalidData,
            "Malformed replay event",
            err.to_string(),
        ))
    })
}

/// Replays a JSON-lines event file through the binlog callbacks.
#[derive(Debug, Clone)]
pub struct ReplaySource {
    path: Arc<PathBuf>,
    pool: MySqlPool,
    schemas: Arc<Mutex<HashMap<TableName, TableSchema>>>,
}

impl ReplaySource {
    pub fn new(path: PathBuf, pool: MySqlPool) -> Self {
        Self {
            path: Arc::new(path),
            pool,
            schemas: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    async fn cached_schema(&self, table: &TableName) -> EtlResult<TableSchema> {
        if let Some(schema) = self.schemas.lock().await.get(table) {
            return Ok(schema.clone());
        }

        let schema = get_table_schema(&self.pool, table).await?;
        self.schemas
            .lock()
            .await
            .insert(table.clone(), schema.clone());

        Ok(schema)
    }

    async fn deliver<H>(&self, handler: &H, line: ReplayLine) -> EtlResult<()>
    where
        H: BinlogHandler + Send + Sync,
    {
        match line.event {
            ReplayEvent::Rows {
                schema,
                table,
                action,
                timestamp,
                rows,
            } => {
                let table = self.cached_schema(&TableName::new(schema, table)).await?;
                handler
                    .on_row(RowsEvent {
                        table: Arc::new(table),
                        action,
                        timestamp,
                        rows,
                    })
                    .await
            }
            ReplayEvent::Rotate => handler.on_rotate(line.position).await,
            ReplayEvent::Ddl { schema, query } => {
                handler.on_ddl(line.position, &schema, &query).await
            }
            ReplayEvent::Xid => handler.on_xid(line.position).await,
            ReplayEvent::Gtid { gtid } => handler.on_gtid(&gtid).await,
            ReplayEvent::TableChanged { schema, table } => {
                self.schemas
                    .lock()
                    .await
                    .remove(&TableName::new(schema.clone(), table.clone()));
                handler.on_table_changed(&schema, &table).await
            }
        }
    }
}

impl BinlogSource for ReplaySource {
    async fn table_schema(&self, table: &TableName) -> EtlResult<TableSchema> {
        self.cached_schema(table).await
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
        let file = tokio::fs::File::open(self.path.as_ref())
            .await
            .map_err(|err| {
                etl_error!(
                    ErrorKind::IoError,
                    "Cannot open the replay file",
                    format!("{}: {err}", self.path.display())
                )
            })?;
        info!(path = %self.path.display(), from = %from, "replaying binlog events");

        let mut lines = BufReader::new(file).lines();
        let mut last = None;
        let mut replayed = 0u64;

        loop {
            let line = tokio::select! {
                biased;

                _ = shutdown_rx.changed() => return Ok(()),

                line = lines.next_line() => line?,
            };
            let Some(line) = line else {
                break;
            };
            let Some(line) = parse_line(&line)? else {
                continue;
            };
            if line.position <= from {
                continue;
            }

            last = Some(line.position.clone());
            self.deliver(&handler, line).await?;
            replayed += 1;
        }

        if let Some(position) = last {
            handler.on_pos_synced(position, true).await?;
        }
        debug!(events = replayed, "replay file exhausted");

        let _ = shutdown_rx.changed().await;

        Ok(())
    }
}
