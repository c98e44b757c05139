//! Tools the analyst agent can call against the warehouse.
//!
//! Each tool takes JSON arguments from the model and returns
//! `(result_text, is_error)`. Failures are reported as text so the model can
//! read the warehouse's message and correct itself; they never abort a turn.

pub mod codegen;

use crate::config::AgentConfig;
use crate::llm::ToolDef;
use crate::warehouse::{
    self, DatasetRef, FieldSchema, TableRef, Warehouse, format_bytes,
};
use serde::Serialize;
use serde_json::{Map, Value, json};
use tracing::debug;

pub const LIST_DATASETS: &str = "list_datasets";
pub const LIST_TABLES: &str = "list_tables";
pub const LIST_ALL_TABLES: &str = "list_all_tables";
pub const GET_TABLE_SCHEMA: &str = "get_table_schema";
pub const FIND_COLUMN: &str = "find_column_in_tables";
pub const DRY_RUN_QUERY: &str = "dry_run_query";
pub const EXECUTE_QUERY: &str = "execute_query";
pub const GENERATE_PYTHON_CODE: &str = "generate_python_code";

/// Room left for the `{rows, truncated, total_rows}` envelope when rows are cut.
const ENVELOPE_RESERVE: usize = 128;

/// What a tool call can reach.
pub struct ToolContext<'a> {
    pub warehouse: &'a dyn Warehouse,
    pub config: &'a AgentConfig,
}

/// Build the tool definitions sent to the model.
pub fn tool_definitions(config: &AgentConfig) -> Vec<ToolDef> {
    let mut tools = vec![
        ToolDef {
            name: LIST_DATASETS.into(),
            description: "List the datasets in the current BigQuery project. Use this first when \
                          you do not know which dataset holds the data."
                .into(),
            input_schema: json!({ "type": "object", "properties": {} }),
        },
        ToolDef {
            name: LIST_TABLES.into(),
            description: "List the tables and views in a dataset. Returns table ids.".into(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "dataset_id": {
                        "type": "string",
                        "description": "Dataset id, optionally prefixed with a project ('project.dataset')."
                    }
                },
                "required": ["dataset_id"]
            }),
        },
        ToolDef {
            name: LIST_ALL_TABLES.into(),
            description: "List every table in every dataset of the project as 'dataset.table'. \
                          Use when the dataset is unknown."
                .into(),
            input_schema: json!({ "type": "object", "properties": {} }),
        },
        ToolDef {
            name: GET_TABLE_SCHEMA.into(),
            description: "Get the schema of a table: column names, types and modes. Nested \
                          RECORD columns include their sub-fields."
                .into(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "dataset_id": {
                        "type": "string",
                        "description": "Dataset id, optionally prefixed with a project."
                    },
                    "table_id": {
                        "type": "string",
                        "description": "Table id within the dataset."
                    }
                },
                "required": ["dataset_id", "table_id"]
            }),
        },
        ToolDef {
            name: FIND_COLUMN.into(),
            description: "Find the tables in a dataset that have a top-level column with the given \
                          name (case-insensitive)."
                .into(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "dataset_id": {
                        "type": "string",
                        "description": "Dataset id, optionally prefixed with a project."
                    },
                    "column_name": {
                        "type": "string",
                        "description": "Column name to look for."
                    }
                },
                "required": ["dataset_id", "column_name"]
            }),
        },
        ToolDef {
            name: DRY_RUN_QUERY.into(),
            description: "Validate a GoogleSQL query without running it. Returns the job status, \
                          statement type and the bytes it would process. Always dry run a query \
                          before executing it."
                .into(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "query": {
                        "type": "string",
                        "description": "GoogleSQL query text. Use fully qualified `project.dataset.table` names."
                    }
                },
                "required": ["query"]
            }),
        },
        ToolDef {
            name: EXECUTE_QUERY.into(),
            description: "Run a GoogleSQL query that has passed a dry run and return its rows as \
                          JSON objects. Large results are cut to the first rows."
                .into(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "query": {
                        "type": "string",
                        "description": "The exact query text that was dry run."
                    }
                },
                "required": ["query"]
            }),
        },
    ];

    if config.enable_codegen {
        tools.push(ToolDef {
            name: GENERATE_PYTHON_CODE.into(),
            description: "Generate a Python snippet that loads BigQuery data with Polars, or with \
                          BigFrames when the description mentions bigframes."
                .into(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "description": {
                        "type": "string",
                        "description": "What the code should do."
                    }
                },
                "required": ["description"]
            }),
        });
    }

    tools
}

/// Dispatch a tool call by name. Returns `(result_text, is_error)`.
pub async fn dispatch(ctx: &ToolContext<'_>, tool_name: &str, input: &Value) -> (String, bool) {
    let (text, is_error) = match tool_name {
        LIST_DATASETS => handle_list_datasets(ctx).await,
        LIST_TABLES => handle_list_tables(ctx, input).await,
        LIST_ALL_TABLES => handle_list_all_tables(ctx).await,
        GET_TABLE_SCHEMA => handle_get_table_schema(ctx, input).await,
        FIND_COLUMN => handle_find_column(ctx, input).await,
        DRY_RUN_QUERY => handle_dry_run(ctx, input).await,
        EXECUTE_QUERY => handle_execute(ctx, input).await,
        GENERATE_PYTHON_CODE if ctx.config.enable_codegen => handle_codegen(input),
        _ => (format!("Unknown tool: {tool_name}"), true),
    };
    (truncate(text, ctx.config.max_tool_output_chars), is_error)
}

fn truncate(s: String, max_chars: usize) -> String {
    match s.char_indices().nth(max_chars) {
        None => s,
        Some((cut, _)) => {
            let mut out = s[..cut].to_string();
            out.push_str("\n... [truncated]");
            out
        }
    }
}

fn required_str<'a>(input: &'a Value, key: &str) -> Result<&'a str, String> {
    match input[key].as_str().map(str::trim) {
        Some(v) if !v.is_empty() => Ok(v),
        _ => Err(format!("Missing '{key}' parameter")),
    }
}

fn to_json<T: Serialize>(value: &T) -> (String, bool) {
    match serde_json::to_string(value) {
        Ok(s) => (s, false),
        Err(e) => (format!("Failed to encode result: {e}"), true),
    }
}

fn warehouse_error(action: &str, err: &crate::error::Error) -> (String, bool) {
    debug!(action, error = %err, "tool call failed");
    (format!("Error {action}: {}", err.user_message()), true)
}

fn dataset_arg(ctx: &ToolContext<'_>, input: &Value) -> Result<DatasetRef, String> {
    let raw = required_str(input, "dataset_id")?;
    DatasetRef::parse(raw, ctx.warehouse.project_id()).map_err(|e| e.to_string())
}

async fn handle_list_datasets(ctx: &ToolContext<'_>) -> (String, bool) {
    match ctx.warehouse.list_datasets().await {
        Ok(datasets) => to_json(&datasets),
        Err(e) => warehouse_error("listing datasets", &e),
    }
}

async fn handle_list_tables(ctx: &ToolContext<'_>, input: &Value) -> (String, bool) {
    let dataset = match dataset_arg(ctx, input) {
        Ok(d) => d,
        Err(e) => return (e, true),
    };
    debug!(%dataset, "list_tables");
    match ctx.warehouse.list_tables(&dataset).await {
        Ok(tables) => {
            let ids: Vec<&str> = tables.iter().map(|t| t.table_id.as_str()).collect();
            to_json(&ids)
        }
        Err(e) => warehouse_error(&format!("listing tables in {dataset}"), &e),
    }
}

async fn handle_list_all_tables(ctx: &ToolContext<'_>) -> (String, bool) {
    match warehouse::list_all_tables(ctx.warehouse).await {
        Ok(tables) => to_json(&tables),
        Err(e) => warehouse_error("listing tables", &e),
    }
}

/// Schema column as shown to the model.
#[derive(Serialize)]
struct SchemaColumn<'a> {
    name: &'a str,
    #[serde(rename = "type")]
    field_type: &'a str,
    mode: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    description: Option<&'a str>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    fields: Vec<SchemaColumn<'a>>,
}

impl<'a> From<&'a FieldSchema> for SchemaColumn<'a> {
    fn from(f: &'a FieldSchema) -> Self {
        Self {
            name: &f.name,
            field_type: &f.field_type,
            mode: &f.mode,
            description: f.description.as_deref().filter(|d| !d.is_empty()),
            fields: f.fields.iter().map(SchemaColumn::from).collect(),
        }
    }
}

async fn handle_get_table_schema(ctx: &ToolContext<'_>, input: &Value) -> (String, bool) {
    let dataset = match dataset_arg(ctx, input) {
        Ok(d) => d,
        Err(e) => return (e, true),
    };
    let table = match required_str(input, "table_id")
        .and_then(|t| TableRef::new(&dataset, t).map_err(|e| e.to_string()))
    {
        Ok(t) => t,
        Err(e) => return (e, true),
    };
    debug!(%table, "get_table_schema");
    match ctx.warehouse.get_table(&table).await {
        Ok(meta) => {
            let columns: Vec<SchemaColumn> = meta.schema.iter().map(SchemaColumn::from).collect();
            to_json(&columns)
        }
        Err(e) => warehouse_error(&format!("getting schema for {table}"), &e),
    }
}

async fn handle_find_column(ctx: &ToolContext<'_>, input: &Value) -> (String, bool) {
    let dataset = match dataset_arg(ctx, input) {
        Ok(d) => d,
        Err(e) => return (e, true),
    };
    let column = match required_str(input, "column_name") {
        Ok(c) => c,
        Err(e) => return (e, true),
    };
    debug!(%dataset, column, "find_column_in_tables");
    match warehouse::find_tables_with_column(ctx.warehouse, &dataset, column).await {
        Ok(tables) => to_json(&tables),
        Err(e) => warehouse_error(&format!("searching {dataset} for column '{column}'"), &e),
    }
}

async fn handle_dry_run(ctx: &ToolContext<'_>, input: &Value) -> (String, bool) {
    let query = match required_str(input, "query") {
        Ok(q) => q,
        Err(e) => return (e, true),
    };
    debug!(query, "dry_run_query");
    match ctx.warehouse.dry_run(query).await {
        Ok(report) => {
            let mut out = json!({
                "status": report.status,
                "total_bytes_processed": report.total_bytes_processed,
                "estimated_size": format_bytes(report.total_bytes_processed),
                "statement_type": report.statement_type,
            });
            if !report.referenced_tables.is_empty() {
                out["referenced_tables"] = json!(report.referenced_tables);
            }
            to_json(&out)
        }
        Err(e) => warehouse_error("in dry run", &e),
    }
}

async fn handle_execute(ctx: &ToolContext<'_>, input: &Value) -> (String, bool) {
    let query = match required_str(input, "query") {
        Ok(q) => q,
        Err(e) => return (e, true),
    };
    debug!(query, max_rows = ctx.config.max_result_rows, "execute_query");
    let output = match ctx.warehouse.execute(query, ctx.config.max_result_rows).await {
        Ok(o) => o,
        Err(e) => return warehouse_error("executing query", &e),
    };

    let fetched = output.rows.len();
    let budget = ctx
        .config
        .max_tool_output_chars
        .saturating_sub(ENVELOPE_RESERVE);
    let rows = fit_rows(output.rows, budget);

    if !output.truncated && rows.len() == fetched {
        return to_json(&rows);
    }
    let total_rows = output.total_rows.unwrap_or(fetched as u64);
    debug!(shown = rows.len(), total_rows, "execute_query result truncated");
    to_json(&json!({
        "rows": rows,
        "truncated": true,
        "total_rows": total_rows,
    }))
}

/// Keep leading rows whose combined JSON fits in `budget` characters.
fn fit_rows(rows: Vec<Map<String, Value>>, budget: usize) -> Vec<Map<String, Value>> {
    let mut used = 2;
    let mut kept = Vec::with_capacity(rows.len());
    for row in rows {
        let len = serde_json::to_string(&row).map(|s| s.len()).unwrap_or(0) + 1;
        if used + len > budget {
            break;
        }
        used += len;
        kept.push(row);
    }
    kept
}

fn handle_codegen(input: &Value) -> (String, bool) {
    match required_str(input, "description") {
        Ok(d) => (codegen::generate_python_code(d), false),
        Err(e) => (e, true),
    }
}
