use std::time::Duration;

use etl::destination::memory::MemoryDestination;
use etl::state::PipelineStatus;
use etl::store::{MemoryStore, PositionStore};
use etl::test_utils::destination::FlakyDestination;
use etl::test_utils::pipeline::{
    create_pipeline, test_pipeline_config, wait_for_position, wait_for_status,
};
use etl::test_utils::schema::{rule_for, users_table_schema};
use etl::test_utils::source::{FakeBinlogSource, SourceEvent};
use etl::types::{PipelineId, RowAction};
use mysql::types::BinlogPosition;
use rand::random;
use serde_json::json;
use telemetry::tracing::init_test_tracing;

const TIMEOUT: Duration = Duration::from_secs(5);

fn pipeline_id() -> PipelineId {
    random::<u32>() as PipelineId
}

#[tokio::test(flavor = "multi_thread")]
async fn saved_positions_never_move_backwards() {
    init_test_tracing();

    let users = users_table_schema();
    let source = FakeBinlogSource::with_tables(vec![users.clone()]);
    let store = MemoryStore::new();
    let id = pipeline_id();

    let mut pipeline = create_pipeline(
        test_pipeline_config(id),
        vec![rule_for(&users)],
        source.clone(),
        FlakyDestination::new(MemoryDestination::new()),
        store.clone(),
    );
    pipeline.start().await.unwrap();

    let mut last = BinlogPosition::start();
    for row in 0..10i64 {
        source.push_rows(
            &users,
            RowAction::Insert,
            vec![vec![row.into(), "user".into()]],
        );
        if row % 3 == 0 {
            last = source.push(SourceEvent::Ddl {
                schema: "shop".to_string(),
                query: "ANALYZE TABLE users".to_string(),
            });
        }
    }
    assert!(wait_for_position(&store, id, &last, TIMEOUT).await);

    pipeline.shutdown_and_wait().await.unwrap();

    let history = store.history(id).await;
    assert!(history.len() >= 4);
    assert!(
        history.windows(2).all(|pair| pair[0] <= pair[1]),
        "positions went backwards: {history:?}"
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn restart_replays_rows_after_the_last_checkpoint() {
    init_test_tracing();

    let users = users_table_schema();
    let source = FakeBinlogSource::with_tables(vec![users.clone()]);
    let store = MemoryStore::new();
    let id = pipeline_id();

    // First run: rows 1 and 2 are checkpointed, row 3 never reaches the destination.
    let first = FlakyDestination::new(MemoryDestination::new());
    let mut pipeline = create_pipeline(
        test_pipeline_config(id),
        vec![rule_for(&users)],
        source.clone(),
        first.clone(),
        store.clone(),
    );
    let runtime = pipeline.runtime();
    pipeline.start().await.unwrap();

    source.push_rows(
        &users,
        RowAction::Insert,
        vec![vec![1i64.into(), "ann".into()], vec![2i64.into(), "bob".into()]],
    );
    let checkpoint = source.push(SourceEvent::Rotate);
    assert!(wait_for_position(&store, id, &checkpoint, TIMEOUT).await);

    first.set_failing(true);
    source.push_rows(
        &users,
        RowAction::Insert,
        vec![vec![3i64.into(), "cid".into()]],
    );
    assert!(wait_for_status(&runtime, PipelineStatus::Fault, TIMEOUT).await);
    pipeline.shutdown_and_wait().await.unwrap();

    assert_eq!(store.load_position(id).await.unwrap(), Some(checkpoint.clone()));
    assert_eq!(first.inner().records().await.len(), 2);

    // Second run: resumes from the checkpoint and receives row 3 only.
    let second = FlakyDestination::new(MemoryDestination::new());
    let mut pipeline = create_pipeline(
        test_pipeline_config(id),
        vec![rule_for(&users)],
        source.clone(),
        second.clone(),
        store.clone(),
    );
    pipeline.start().await.unwrap();

    assert!(second.inner().wait_for_records(1, TIMEOUT).await);
    let records = second.inner().records().await;
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].row["id"], json!(3));
    assert_eq!(source.starts().last(), Some(&checkpoint));

    pipeline.shutdown_and_wait().await.unwrap();
}
