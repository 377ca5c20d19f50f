use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Where replication checkpoints are persisted.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum CheckpointStoreConfig {
    /// Positions are kept in memory and lost on restart.
    #[default]
    Memory,
    /// Positions are kept in an embedded SQLite database file.
    Sqlite { path: PathBuf },
}
