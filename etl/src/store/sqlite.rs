use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use mysql::types::BinlogPosition;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::{ErrorKind, EtlError, EtlResult};
use crate::store::base::PositionStore;
use crate::types::PipelineId;

const CREATE_TABLE_QUERY: &str = r#"
    CREATE TABLE IF NOT EXISTS binlog_positions (
        pipeline_id INTEGER PRIMARY KEY NOT NULL,
        file TEXT NOT NULL,
        log_offset INTEGER NOT NULL,
        updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
    )
"#;

const UPSERT_QUERY: &str = r#"
    INSERT INTO binlog_positions (pipeline_id, file, log_offset, updated_at)
    VALUES (?, ?, ?, CURRENT_TIMESTAMP)
    ON CONFLICT (pipeline_id) DO UPDATE SET
        file = excluded.file,
        log_offset = excluded.log_offset,
        updated_at = excluded.updated_at
"#;

/// Positions kept in an embedded SQLite database, one row per pipeline.
///
/// Writes go to the database first and then to the in-memory cache, so a crash between the two
/// leaves the database as the source of truth for the next start.
#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
    cache: Arc<Mutex<HashMap<PipelineId, BinlogPosition>>>,
}

impl SqliteStore {
    /// Opens (or creates) the database file at `path`.
    pub async fn open(path: impl AsRef<Path>) -> EtlResult<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path.as_ref())
            .create_if_missing(true);

        info!(path = %path.as_ref().display(), "opening checkpoint store");

        Self::connect(options).await
    }

    /// Opens a private in-memory database.
    pub async fn in_memory() -> EtlResult<Self> {
        Self::connect(SqliteConnectOptions::new().in_memory(true)).await
    }

    async fn connect(options: SqliteConnectOptions) -> EtlResult<Self> {
        // One connection serializes writers and keeps an in-memory database alive.
        let pool = SqlitePoolOptions::new()
            .min_connections(1)
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
            .map_err(checkpoint_error)?;

        sqlx::query(CREATE_TABLE_QUERY)
            .execute(&pool)
            .await
            .map_err(checkpoint_error)?;

        Ok(Self {
            pool,
            cache: Arc::new(Mutex::new(HashMap::new())),
        })
    }
}

impl PositionStore for SqliteStore {
    async fn load_position(&self, pipeline_id: PipelineId) -> EtlResult<Option<BinlogPosition>> {
        if let Some(position) = self.cache.lock().await.get(&pipeline_id) {
            return Ok(Some(position.clone()));
        }

        let row = sqlx::query("SELECT file, log_offset FROM binlog_positions WHERE pipeline_id = ?")
            .bind(pipeline_id as i64)
            .fetch_optional(&self.pool)
            .await
            .map_err(checkpoint_error)?;

        let Some(row) = row else {
            return Ok(None);
        };

        let file: String = row.try_get("file").map_err(checkpoint_error)?;
        let offset: i64 = row.try_get("log_offset").map_err(checkpoint_error)?;
        let position = BinlogPosition::new(file, offset as u64);

        debug!(pipeline_id, %position, "loaded binlog position");
        self.cache
            .lock()
            .await
            .insert(pipeline_id, position.clone());

        Ok(Some(position))
    }

    async fn save_position(
        &self,
        pipeline_id: PipelineId,
        position: BinlogPosition,
    ) -> EtlResult<()> {
        sqlx::query(UPSERT_QUERY)
            .bind(pipeline_id as i64)
            .bind(&position.file)
            .bind(position.offset as i64)
            .execute(&self.pool)
            .await
            .map_err(checkpoint_error)?;

        self.cache.lock().await.insert(pipeline_id, position);

        Ok(())
    }

    async fn delete_position(&self, pipeline_id: PipelineId) -> EtlResult<()> {
        sqlx::query("DELETE FROM binlog_positions WHERE pipeline_id = ?")
            .bind(pipeline_id as i64)
            .execute(&self.pool)
            .await
            .map_err(checkpoint_error)?;

        self.cache.lock().await.remove(&pipeline_id);

        Ok(())
    }
}

fn checkpoint_error(err: sqlx::Error) -> EtlError {
    EtlError::from((
        ErrorKind::CheckpointError,
        "Checkpoint store operation failed",
        err.to_string(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn upserts_one_row_per_pipeline() {
        let store = SqliteStore::in_memory().await.unwrap();
        assert_eq!(store.load_position(7).await.unwrap(), None);

        store
            .save_position(7, BinlogPosition::new("mysql-bin.000003", 120))
            .await
            .unwrap();
        store
            .save_position(7, BinlogPosition::new("mysql-bin.000004", 4))
            .await
            .unwrap();

        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM binlog_positions")
            .fetch_one(&store.pool)
            .await
            .unwrap();
        assert_eq!(count, 1);

        store.cache.lock().await.clear();
        assert_eq!(
            store.load_position(7).await.unwrap(),
            Some(BinlogPosition::new("mysql-bin.000004", 4))
        );
    }

    #[tokio::test]
    async fn delete_resets_to_missing() {
        let store = SqliteStore::in_memory().await.unwrap();
        store
            .save_position(1, BinlogPosition::new("mysql-bin.000001", 4))
            .await
            .unwrap();

        store.delete_position(1).await.unwrap();

        assert_eq!(store.load_position(1).await.unwrap(), None);
    }
}
