use std::collections::BTreeSet;
use std::sync::Arc;

use config::shared::ExportConfig;
use etl::destination::memory::MemoryDestination;
use etl::export::BulkExporter;
use etl::rule::RuleContext;
use etl::script::new_engine;
use etl::state::{PipelineRuntime, PipelineStatus};
use etl::store::MemoryStore;
use etl::test_utils::destination::FlakyDestination;
use etl::test_utils::pipeline::{create_pipeline, test_pipeline_config};
use etl::test_utils::scanner::MemoryTableScanner;
use etl::test_utils::schema::{rule_for, users_table_schema};
use etl::test_utils::source::FakeBinlogSource;
use etl::types::RowAction;
use mysql::types::BinlogValue;
use serde_json::json;
use telemetry::tracing::init_test_tracing;

fn user_rows(count: i64) -> Vec<Vec<BinlogValue>> {
    (1..=count)
        .map(|id| vec![id.into(), format!("user-{id}").into()])
        .collect()
}

fn users_context(script: Option<&str>) -> Arc<RuleContext> {
    let mut rule = rule_for(&users_table_schema());
    rule.order_column = Some("id".to_string());
    rule.script = script.map(str::to_string);

    Arc::new(
        RuleContext::build(
            1,
            "export",
            Arc::new(rule),
            Arc::new(users_table_schema()),
            Arc::new(new_engine()),
            false,
        )
        .unwrap(),
    )
}

#[tokio::test(flavor = "multi_thread")]
async fn large_table_is_split_into_every_page_exactly_once() {
    init_test_tracing();

    let scanner = MemoryTableScanner::new();
    scanner.insert_rows(users_table_schema().name, user_rows(10_050));
    let destination = MemoryDestination::new();
    let runtime = Arc::new(PipelineRuntime::new(1));
    let exporter = BulkExporter::new(
        1,
        ExportConfig {
            workers: 4,
            page_size: 100,
            ..ExportConfig::default()
        },
        scanner.clone(),
        destination.clone(),
        runtime.clone(),
    );

    let report = exporter.export_table(users_context(None)).await.unwrap();

    assert_eq!(report.pages, 101);
    assert_eq!(report.total_rows, 10_050);
    assert_eq!(report.imported_rows, 10_050);
    let offsets = scanner.fetched_offsets();
    assert_eq!(offsets.len(), 101);
    assert_eq!(
        offsets.iter().copied().collect::<BTreeSet<_>>().len(),
        101,
        "a page was fetched twice"
    );
    assert_eq!(destination.export_batches().await, 101);
    assert_eq!(destination.records().await.len(), 10_050);
    assert_eq!(runtime.status(), PipelineStatus::BatchEnd);
}

#[tokio::test(flavor = "multi_thread")]
async fn script_rules_run_through_pooled_interpreters() {
    init_test_tracing();

    let scanner = MemoryTableScanner::new();
    scanner.insert_rows(users_table_schema().name, user_rows(40));
    let destination = MemoryDestination::new();
    let exporter = BulkExporter::new(
        1,
        ExportConfig {
            workers: 2,
            page_size: 10,
            ..ExportConfig::default()
        },
        scanner,
        destination.clone(),
        Arc::new(PipelineRuntime::new(1)),
    );
    let context = users_context(Some(
        r#"
        fn handle(event) {
            let result = #{};
            result["insert_1_user:" + event.Row.id] = event.Row.name;
            result
        }
        "#,
    ));

    let report = exporter.export_table(context).await.unwrap();

    assert!(report.is_complete());
    let records = destination.records().await;
    assert_eq!(records.len(), 40);
    let mut keys: Vec<String> = records
        .iter()
        .map(|record| record.outputs[0].key().to_string())
        .collect();
    keys.sort();
    assert!(keys.contains(&"user:1".to_string()));
    assert!(keys.contains(&"user:40".to_string()));
    assert_eq!(records[0].row["name"], json!(format!("user-{}", records[0].row["id"])));
}

#[tokio::test(flavor = "multi_thread")]
async fn export_beside_a_live_stream_keeps_it_running() {
    init_test_tracing();

    let users = users_table_schema();
    let source = FakeBinlogSource::with_tables(vec![users.clone()]);
    let destination = FlakyDestination::new(MemoryDestination::new());
    let mut pipeline = create_pipeline(
        test_pipeline_config(77),
        vec![rule_for(&users)],
        source.clone(),
        destination.clone(),
        MemoryStore::new(),
    );
    let runtime = pipeline.runtime();
    pipeline.start().await.unwrap();
    assert_eq!(runtime.status(), PipelineStatus::Running);

    let scanner = MemoryTableScanner::new();
    scanner.insert_rows(users.name.clone(), user_rows(25));
    let exporter = BulkExporter::new(
        77,
        ExportConfig {
            workers: 2,
            page_size: 10,
            ..ExportConfig::default()
        },
        scanner,
        destination.clone(),
        runtime.clone(),
    );

    let report = exporter.export_table(users_context(None)).await.unwrap();

    assert!(report.is_complete());
    assert_eq!(runtime.status(), PipelineStatus::Running);
    let progress = runtime.export_progress(&users.name).unwrap();
    assert_eq!(progress.total_rows, 25);
    assert_eq!(progress.imported_rows, 25);

    source.push_rows(
        &users,
        RowAction::Insert,
        vec![vec![100i64.into(), "late".into()]],
    );
    assert!(
        destination
            .inner()
            .wait_for_records(26, std::time::Duration::from_secs(5))
            .await
    );
    assert_eq!(runtime.status(), PipelineStatus::Running);

    pipeline.shutdown_and_wait().await.unwrap();
}
