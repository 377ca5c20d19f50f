use std::time::Duration;

use etl::destination::memory::MemoryDestination;
use etl::error::ErrorKind;
use etl::etl_error;
use etl::state::PipelineStatus;
use etl::store::MemoryStore;
use etl::test_utils::destination::FlakyDestination;
use etl::test_utils::pipeline::{
    create_pipeline, test_pipeline_config, wait_for_position, wait_for_status,
};
use etl::test_utils::schema::{rule_for, users_table_schema, users_table_schema_with_email};
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
async fn rows_are_delivered_in_binlog_order() {
    init_test_tracing();

    let users = users_table_schema();
    let source = FakeBinlogSource::with_tables(vec![users.clone()]);
    let destination = FlakyDestination::new(MemoryDestination::new());
    let mut rule = rule_for(&users);
    rule.retain_previous_row = true;

    let id = pipeline_id();
    let mut pipeline = create_pipeline(
        test_pipeline_config(id),
        vec![rule],
        source.clone(),
        destination.clone(),
        MemoryStore::new(),
    );
    let runtime = pipeline.runtime();
    pipeline.start().await.unwrap();
    assert_eq!(runtime.status(), PipelineStatus::Running);

    source.push_rows(
        &users,
        RowAction::Insert,
        vec![vec![1i64.into(), "ann".into()], vec![2i64.into(), "bob".into()]],
    );
    source.push_rows(
        &users,
        RowAction::Update,
        vec![
            vec![1i64.into(), "ann".into()],
            vec![1i64.into(), "anna".into()],
        ],
    );
    source.push_rows(
        &users,
        RowAction::Delete,
        vec![vec![2i64.into(), "bob".into()]],
    );

    assert!(destination.inner().wait_for_records(4, TIMEOUT).await);
    let records = destination.inner().records().await;
    let actions: Vec<RowAction> = records.iter().map(|record| record.action).collect();
    assert_eq!(
        actions,
        vec![
            RowAction::Insert,
            RowAction::Insert,
            RowAction::Update,
            RowAction::Delete
        ]
    );
    assert_eq!(records[2].row["name"], json!("anna"));
    assert_eq!(records[2].previous.as_ref().unwrap()["name"], json!("ann"));
    assert_eq!(runtime.intake(RowAction::Insert), 2);
    assert_eq!(runtime.intake(RowAction::Update), 1);
    assert_eq!(runtime.intake(RowAction::Delete), 1);

    pipeline.shutdown_and_wait().await.unwrap();

    assert_eq!(runtime.status(), PipelineStatus::Close);
    assert!(destination.inner().is_closed().await);
}

#[tokio::test(flavor = "multi_thread")]
async fn unknown_tables_are_ignored() {
    init_test_tracing();

    let mut other = users_table_schema();
    other.name.name = "audit".to_string();
    let source = FakeBinlogSource::with_tables(vec![users_table_schema()]);
    let destination = FlakyDestination::new(MemoryDestination::new());

    let mut pipeline = create_pipeline(
        test_pipeline_config(pipeline_id()),
        vec![rule_for(&users_table_schema())],
        source.clone(),
        destination.clone(),
        MemoryStore::new(),
    );
    pipeline.start().await.unwrap();

    source.push_rows(
        &other,
        RowAction::Insert,
        vec![vec![7i64.into(), "ignored".into()]],
    );
    source.push_rows(
        &users_table_schema(),
        RowAction::Insert,
        vec![vec![8i64.into(), "kept".into()]],
    );

    assert!(destination.inner().wait_for_records(1, TIMEOUT).await);
    let records = destination.inner().records().await;
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].row["id"], json!(8));

    pipeline.shutdown_and_wait().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn schema_drift_skips_rows_until_the_table_change() {
    init_test_tracing();

    let users = users_table_schema();
    let users_with_email = users_table_schema_with_email();
    let source = FakeBinlogSource::with_tables(vec![users.clone()]);
    let destination = FlakyDestination::new(MemoryDestination::new());

    let mut pipeline = create_pipeline(
        test_pipeline_config(pipeline_id()),
        vec![rule_for(&users)],
        source.clone(),
        destination.clone(),
        MemoryStore::new(),
    );
    pipeline.start().await.unwrap();

    source.push_rows(
        &users,
        RowAction::Insert,
        vec![vec![1i64.into(), "ann".into()]],
    );
    // The column was added but the table change was not signalled yet.
    source.push_rows(
        &users_with_email,
        RowAction::Insert,
        vec![vec![2i64.into(), "bob".into(), "bob@example.com".into()]],
    );
    source.push(SourceEvent::TableChanged(users_with_email.clone()));
    source.push_rows(
        &users_with_email,
        RowAction::Insert,
        vec![vec![3i64.into(), "cid".into(), "cid@example.com".into()]],
    );

    assert!(destination.inner().wait_for_records(2, TIMEOUT).await);
    let records = destination.inner().records().await;
    let ids: Vec<_> = records.iter().map(|record| record.row["id"].clone()).collect();
    assert_eq!(ids, vec![json!(1), json!(3)]);
    assert!(!records[0].row.contains_key("email"));
    assert_eq!(records[1].row["email"], json!("cid@example.com"));

    pipeline.shutdown_and_wait().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn destination_fault_recovers_and_resumes_from_checkpoint() {
    init_test_tracing();

    let users = users_table_schema();
    let source = FakeBinlogSource::with_tables(vec![users.clone()]);
    let destination = FlakyDestination::new(MemoryDestination::new());
    let store = MemoryStore::new();
    let started = source.started_notify();

    let id = pipeline_id();
    let mut pipeline = create_pipeline(
        test_pipeline_config(id),
        vec![rule_for(&users)],
        source.clone(),
        destination.clone(),
        store.clone(),
    );
    let runtime = pipeline.runtime();
    pipeline.start().await.unwrap();
    started.notified().await;

    source.push_rows(
        &users,
        RowAction::Insert,
        (1..=3i64)
            .map(|id| vec![id.into(), format!("user-{id}").into()])
            .collect(),
    );
    let checkpoint = source.push(SourceEvent::Rotate);
    assert!(wait_for_position(&store, id, &checkpoint, TIMEOUT).await);
    assert!(destination.inner().wait_for_records(3, TIMEOUT).await);

    destination.set_failing(true);
    source.push_rows(
        &users,
        RowAction::Insert,
        (4..=5i64)
            .map(|id| vec![id.into(), format!("user-{id}").into()])
            .collect(),
    );
    assert!(wait_for_status(&runtime, PipelineStatus::Fault, TIMEOUT).await);
    assert!(runtime.message().is_some());

    destination.set_failing(false);
    started.notified().await;
    assert!(wait_for_status(&runtime, PipelineStatus::Running, TIMEOUT).await);

    assert!(destination.inner().wait_for_records(5, TIMEOUT).await);
    let ids: Vec<_> = destination
        .inner()
        .records()
        .await
        .iter()
        .map(|record| record.row["id"].clone())
        .collect();
    assert_eq!(ids, vec![json!(1), json!(2), json!(3), json!(4), json!(5)]);
    assert_eq!(source.starts(), vec![BinlogPosition::start(), checkpoint]);
    assert!(destination.pings() >= 1);
    assert!(destination.inner().connects().await >= 2);

    pipeline.shutdown_and_wait().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn failing_subscription_fails_the_start() {
    init_test_tracing();

    let users = users_table_schema();
    let source = FakeBinlogSource::with_tables(vec![users.clone()]);
    source.fail_next_start(etl_error!(
        ErrorKind::SourceConnectionFailed,
        "Source is unreachable"
    ));
    let destination = FlakyDestination::new(MemoryDestination::new());

    let mut pipeline = create_pipeline(
        test_pipeline_config(pipeline_id()),
        vec![rule_for(&users)],
        source,
        destination.clone(),
        MemoryStore::new(),
    );
    let runtime = pipeline.runtime();

    let err = pipeline.start().await.unwrap_err();

    assert_eq!(err.kind(), ErrorKind::SourceConnectionFailed);
    assert_eq!(runtime.status(), PipelineStatus::Fail);
    assert!(destination.inner().is_closed().await);
}

#[tokio::test(flavor = "multi_thread")]
async fn missing_source_table_fails_the_start() {
    init_test_tracing();

    let destination = FlakyDestination::new(MemoryDestination::new());
    let mut pipeline = create_pipeline(
        test_pipeline_config(pipeline_id()),
        vec![rule_for(&users_table_schema())],
        FakeBinlogSource::new(),
        destination.clone(),
        MemoryStore::new(),
    );
    let runtime = pipeline.runtime();

    let err = pipeline.start().await.unwrap_err();

    assert_eq!(err.kind(), ErrorKind::MissingTableSchema);
    assert_eq!(runtime.status(), PipelineStatus::Fail);
    assert_eq!(destination.inner().connects().await, 1);
    assert!(destination.inner().is_closed().await);
}

#[tokio::test(flavor = "multi_thread")]
async fn invalid_script_fails_the_start_and_closes_the_destination() {
    init_test_tracing();

    let users = users_table_schema();
    let mut rule = rule_for(&users);
    rule.script = Some("fn handle(event) {".to_string());
    let destination = FlakyDestination::new(MemoryDestination::new());
    let mut pipeline = create_pipeline(
        test_pipeline_config(pipeline_id()),
        vec![rule],
        FakeBinlogSource::with_tables(vec![users]),
        destination.clone(),
        MemoryStore::new(),
    );

    let err = pipeline.start().await.unwrap_err();

    assert_eq!(err.kind(), ErrorKind::ScriptCompileError);
    assert!(destination.inner().is_closed().await);
}

#[tokio::test(flavor = "multi_thread")]
async fn repeated_script_failures_panic_the_pipeline() {
    init_test_tracing();

    let users = users_table_schema();
    let source = FakeBinlogSource::with_tables(vec![users.clone()]);
    let mut rule = rule_for(&users);
    rule.script =
        Some(r#"fn handle(event) { throw "cannot map row " + event.Row.id; }"#.to_string());

    let mut pipeline = create_pipeline(
        test_pipeline_config(pipeline_id()),
        vec![rule],
        source.clone(),
        FlakyDestination::new(MemoryDestination::new()),
        MemoryStore::new(),
    );
    let runtime = pipeline.runtime();
    pipeline.start().await.unwrap();

    source.push_rows(
        &users,
        RowAction::Insert,
        vec![vec![1i64.into(), "ann".into()]],
    );

    let err = tokio::time::timeout(TIMEOUT, pipeline.wait())
        .await
        .unwrap()
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ScriptRuntimeError);
    assert_eq!(runtime.status(), PipelineStatus::Panic);
}
