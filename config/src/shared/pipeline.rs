use serde::Deserialize;

use crate::shared::{BatchConfig, MySqlConnectionConfig, ValidationError};

/// Configuration of one replication pipeline.
///
/// This intentionally does not implement [`serde::Serialize`] because the source connection
/// carries a password.
#[derive(Clone, Debug, Deserialize)]
pub struct PipelineConfig {
    /// Unique identifier. Checkpoints and runtime counters are keyed by it.
    pub id: u64,
    /// Human readable name used in logs.
    pub name: String,
    /// The MySQL server whose binlog is replicated.
    pub source: MySqlConnectionConfig,
    #[serde(default)]
    pub batch: BatchConfig,
    /// Interval between two sink pings while the pipeline is faulted.
    #[serde(default = "default_health_check_interval_ms")]
    pub health_check_interval_ms: u64,
    /// How long a freshly started binlog subscription must survive before it counts as live.
    #[serde(default = "default_start_grace_ms")]
    pub start_grace_ms: u64,
    #[serde(default)]
    pub export: ExportConfig,
}

impl PipelineConfig {
    pub const DEFAULT_HEALTH_CHECK_INTERVAL_MS: u64 = 5_000;

    pub const DEFAULT_START_GRACE_MS: u64 = 500;

    pub fn validate(&self) -> Result<(), ValidationError> {
        self.source.validate()?;
        self.batch.validate()?;
        self.export.validate()?;

        if self.health_check_interval_ms == 0 {
            return Err(ValidationError::InvalidFieldValue {
                field: "pipeline.health_check_interval_ms".to_string(),
                constraint: "must be greater than 0".to_string(),
            });
        }

        Ok(())
    }
}

fn default_health_check_interval_ms() -> u64 {
    PipelineConfig::DEFAULT_HEALTH_CHECK_INTERVAL_MS
}

fn default_start_grace_ms() -> u64 {
    PipelineConfig::DEFAULT_START_GRACE_MS
}

/// Settings of the bulk export used for full table loads.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct ExportConfig {
    /// Number of concurrent page workers per table.
    #[serde(default = "default_export_workers")]
    pub workers: u16,
    /// Rows fetched per page.
    #[serde(default = "default_export_page_size")]
    pub page_size: u64,
    /// Upper bound of the source connection pool used by the export.
    #[serde(default = "default_export_max_connections")]
    pub max_connections: u32,
    /// Export every rule that has an order column before streaming starts.
    #[serde(default)]
    pub on_start: bool,
}

impl ExportConfig {
    pub const DEFAULT_WORKERS: u16 = 4;

    pub const DEFAULT_PAGE_SIZE: u64 = 1_000;

    pub const DEFAULT_MAX_CONNECTIONS: u32 = 8;

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.workers == 0 {
            return Err(ValidationError::InvalidFieldValue {
                field: "pipeline.export.workers".to_string(),
                constraint: "must be greater than 0".to_string(),
            });
        }

        if self.page_size == 0 {
            return Err(ValidationError::InvalidFieldValue {
                field: "pipeline.export.page_size".to_string(),
                constraint: "must be greater than 0".to_string(),
            });
        }

        Ok(())
    }
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            workers: default_export_workers(),
            page_size: default_export_page_size(),
            max_connections: default_export_max_connections(),
            on_start: false,
        }
    }
}

fn default_export_workers() -> u16 {
    ExportConfig::DEFAULT_WORKERS
}

fn default_export_page_size() -> u64 {
    ExportConfig::DEFAULT_PAGE_SIZE
}

fn default_export_max_connections() -> u32 {
    ExportConfig::DEFAULT_MAX_CONNECTIONS
}
