use std::time::Duration;

use config::shared::{
    BatchConfig, ExportConfig, MySqlConnectionConfig, PipelineConfig, RuleConfig,
};
use mysql::types::BinlogPosition;
use tokio::time::Instant;

use crate::pipeline::Pipeline;
use crate::rule::RuleRegistry;
use crate::state::{PipelineRuntime, PipelineStatus, RuntimeRegistry};
use crate::store::{MemoryStore, PositionStore};
use crate::test_utils::destination::FlakyDestination;
use crate::test_utils::source::FakeBinlogSource;
use crate::types::PipelineId;

pub type TestPipeline = Pipeline<FakeBinlogSource, FlakyDestination, MemoryStore>;

/// A pipeline configuration with short timers so tests stay fast.
pub fn test_pipeline_config(id: PipelineId) -> PipelineConfig {
    PipelineConfig {
        id,
        name: format!("test-pipeline-{id}"),
        source: MySqlConnectionConfig {
            host: "localhost".to_string(),
            port: 3306,
            name: "shop".to_string(),
            username: "replicator".to_string(),
            password: None,
            server_id: MySqlConnectionConfig::DEFAULT_SERVER_ID,
            tls: false,
        },
        batch: BatchConfig {
            max_size: 100,
            max_fill_ms: 20,
            channel_capacity: 256,
        },
        health_check_interval_ms: 20,
        start_grace_ms: 50,
        export: ExportConfig::default(),
    }
}

pub fn create_pipeline(
    config: PipelineConfig,
    rules: Vec<RuleConfig>,
    source: FakeBinlogSource,
    destination: FlakyDestination,
    store: MemoryStore,
) -> TestPipeline {
    Pipeline::new(
        config,
        rules,
        source,
        destination,
        store,
        RuleRegistry::new(),
        RuntimeRegistry::new(),
    )
}

/// Polls `runtime` until it reports `status`. Returns `false` on timeout.
pub async fn wait_for_status(
    runtime: &PipelineRuntime,
    status: PipelineStatus,
    timeout: Duration,
) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if runtime.status() == status {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }

        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Polls `store` until the position of `pipeline_id` is at least `position`. Returns `false` on
/// timeout.
pub async fn wait_for_position(
    store: &MemoryStore,
    pipeline_id: PipelineId,
    position: &BinlogPosition,
    timeout: Duration,
) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if let Ok(Some(saved)) = store.load_position(pipeline_id).await
            && &saved >= position
        {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }

        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
