mod common;

use bq_analyst::config::AgentConfig;
use bq_analyst::tools::{self, ToolContext};
use bq_analyst::warehouse::{InMemoryWarehouse, TableKind};
use common::{ORDERS_COUNT_SQL, sample_warehouse};
use serde_json::{Value, json};

async fn call(wh: &InMemoryWarehouse, config: &AgentConfig, name: &str, input: Value) -> (String, bool) {
    let ctx = ToolContext {
        warehouse: wh,
        config,
    };
    tools::dispatch(&ctx, name, &input).await
}

#[tokio::test]
async fn list_datasets_returns_ids() {
    let wh = sample_warehouse();
    let (result, is_error) = call(&wh, &AgentConfig::default(), "list_datasets", json!({})).await;
    assert!(!is_error, "list_datasets failed: {result}");
    assert_eq!(result, r#"["marketing","sales"]"#);
}

#[tokio::test]
async fn list_tables_accepts_project_prefix() {
    let wh = sample_warehouse();
    let config = AgentConfig::default();
    let (plain, is_error) = call(&wh, &config, "list_tables", json!({"dataset_id": "sales"})).await;
    assert!(!is_error, "list_tables failed: {plain}");
    assert_eq!(plain, r#"["orders","customers","regions"]"#);

    let (prefixed, _) = call(&wh, &config, "list_tables", json!({"dataset_id": "acme.sales"})).await;
    assert_eq!(plain, prefixed, "project-qualified id should list the same tables");
}

#[tokio::test]
async fn list_tables_unknown_dataset_is_error_text() {
    let wh = sample_warehouse();
    let (result, is_error) = call(
        &wh,
        &AgentConfig::default(),
        "list_tables",
        json!({"dataset_id": "nope"}),
    )
    .await;
    assert!(is_error);
    assert!(result.contains("Not found"), "should surface warehouse message: {result}");
}

#[tokio::test]
async fn list_all_tables_spans_datasets() {
    let wh = sample_warehouse().with_table("marketing", "campaigns", &[("id", "STRING")]);
    let (result, is_error) = call(&wh, &AgentConfig::default(), "list_all_tables", json!({})).await;
    assert!(!is_error, "list_all_tables failed: {result}");
    let tables: Vec<String> = serde_json::from_str(&result).unwrap();
    assert_eq!(
        tables,
        vec!["marketing.campaigns", "sales.orders", "sales.customers", "sales.regions"]
    );
}

#[tokio::test]
async fn get_table_schema_lists_columns() {
    let wh = sample_warehouse();
    let (result, is_error) = call(
        &wh,
        &AgentConfig::default(),
        "get_table_schema",
        json!({"dataset_id": "sales", "table_id": "orders"}),
    )
    .await;
    assert!(!is_error, "get_table_schema failed: {result}");
    let columns: Value = serde_json::from_str(&result).unwrap();
    assert_eq!(
        columns,
        json!([
            {"name": "order_id", "type": "INTEGER", "mode": "NULLABLE"},
            {"name": "customer_id", "type": "STRING", "mode": "NULLABLE"},
            {"name": "amount", "type": "NUMERIC", "mode": "NULLABLE"}
        ])
    );
}

#[tokio::test]
async fn get_table_schema_rejects_bad_table_id() {
    let wh = sample_warehouse();
    let (result, is_error) = call(
        &wh,
        &AgentConfig::default(),
        "get_table_schema",
        json!({"dataset_id": "sales", "table_id": "orders/../x"}),
    )
    .await;
    assert!(is_error);
    assert!(wh.calls().await.is_empty(), "invalid ids must not reach the warehouse: {result}");
}

#[tokio::test]
async fn find_column_skips_non_queryable_tables() {
    let wh = sample_warehouse().with_table_kind(
        "sales",
        "churn_model",
        TableKind::Other,
        &[("customer_id", "STRING")],
    );
    let (result, is_error) = call(
        &wh,
        &AgentConfig::default(),
        "find_column_in_tables",
        json!({"dataset_id": "sales", "column_name": "CUSTOMER_ID"}),
    )
    .await;
    assert!(!is_error, "find_column_in_tables failed: {result}");
    assert_eq!(result, r#"["orders","customers"]"#);
}

#[tokio::test]
async fn dry_run_failure_is_error_text() {
    let wh = sample_warehouse();
    let (result, is_error) = call(
        &wh,
        &AgentConfig::default(),
        "dry_run_query",
        json!({"query": "SELEC 1"}),
    )
    .await;
    assert!(is_error);
    assert!(result.starts_with("Error in dry run:"), "got: {result}");
}

#[tokio::test]
async fn execute_returns_row_objects() {
    let wh = sample_warehouse();
    let (result, is_error) = call(
        &wh,
        &AgentConfig::default(),
        "execute_query",
        json!({"query": ORDERS_COUNT_SQL}),
    )
    .await;
    assert!(!is_error, "execute_query failed: {result}");
    assert_eq!(result, r#"[{"n":3}]"#);
}

#[tokio::test]
async fn execute_wraps_truncated_results() {
    let wh = sample_warehouse();
    let config = AgentConfig {
        max_result_rows: 10,
        ..AgentConfig::default()
    };
    let (result, is_error) = call(
        &wh,
        &config,
        "execute_query",
        json!({"query": "SELECT order_id FROM `acme.sales.orders`"}),
    )
    .await;
    assert!(!is_error, "execute_query failed: {result}");
    let v: Value = serde_json::from_str(&result).unwrap();
    assert_eq!(v["truncated"], true);
    assert_eq!(v["total_rows"], 50);
    assert_eq!(v["rows"].as_array().map(Vec::len), Some(10));
}

#[tokio::test]
async fn execute_cuts_rows_to_output_budget() {
    let wh = sample_warehouse();
    let config = AgentConfig {
        max_tool_output_chars: 400,
        ..AgentConfig::default()
    };
    let (result, is_error) = call(
        &wh,
        &config,
        "execute_query",
        json!({"query": "SELECT order_id FROM `acme.sales.orders`"}),
    )
    .await;
    assert!(!is_error, "execute_query failed: {result}");
    assert!(result.chars().count() <= 400, "output too long: {}", result.len());
    let v: Value = serde_json::from_str(&result).expect("output should stay valid JSON");
    assert_eq!(v["truncated"], true);
    let shown = v["rows"].as_array().map(Vec::len).unwrap_or(0);
    assert!(shown > 0 && shown < 50, "expected a partial page, got {shown}");
}

#[tokio::test]
async fn generate_python_code_when_enabled() {
    let wh = sample_warehouse();
    let config = AgentConfig {
        enable_codegen: true,
        ..AgentConfig::default()
    };
    let (result, is_error) = call(
        &wh,
        &config,
        "generate_python_code",
        json!({"description": "daily revenue with bigframes"}),
    )
    .await;
    assert!(!is_error, "generate_python_code failed: {result}");
    assert!(result.contains("bfp.read_gbq"));
}

#[tokio::test]
async fn unknown_tool() {
    let wh = sample_warehouse();
    let (result, is_error) = call(&wh, &AgentConfig::default(), "drop_table", json!({})).await;
    assert!(is_error);
    assert_eq!(result, "Unknown tool: drop_table");
}
