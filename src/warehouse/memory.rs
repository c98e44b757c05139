//! In-memory warehouse for offline runs and tests.
//!
//! Datasets and tables are registered up front; a query only "works" if its
//! text (ignoring surrounding whitespace and a trailing `;`) was registered
//! with a canned result. Every call is recorded so callers can assert what
//! reached the warehouse.

use super::Warehouse;
use super::types::{
    DatasetRef, DryRunReport, FieldSchema, QueryOutput, TableEntry, TableKind, TableMetadata,
    TableRef,
};
use crate::error::{Error, Result};
use async_trait::async_trait;
use fancy_regex::Regex;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::LazyLock;
use tokio::sync::Mutex;

pub struct InMemoryWarehouse {
    project_id: String,
    datasets: BTreeMap<String, Vec<TableMetadata>>,
    queries: HashMap<String, Vec<Map<String, Value>>>,
    calls: Mutex<Vec<String>>,
}

impl InMemoryWarehouse {
    pub fn new(project_id: impl Into<String>) -> Self {
        Self {
            project_id: project_id.into(),
            datasets: BTreeMap::new(),
            queries: HashMap::new(),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn with_dataset(mut self, dataset_id: &str) -> Self {
        self.datasets.entry(dataset_id.into()).or_default();
        self
    }

    /// Register a table; `columns` are `(name, type)` pairs, all NULLABLE.
    pub fn with_table(self, dataset_id: &str, table_id: &str, columns: &[(&str, &str)]) -> Self {
        self.with_table_kind(dataset_id, table_id, TableKind::Table, columns)
    }

    pub fn with_table_kind(
        mut self,
        dataset_id: &str,
        table_id: &str,
        kind: TableKind,
        columns: &[(&str, &str)],
    ) -> Self {
        let meta = TableMetadata {
            table: TableRef {
                project_id: self.project_id.clone(),
                dataset_id: dataset_id.into(),
                table_id: table_id.into(),
            },
            kind,
            schema: columns
                .iter()
                .map(|(name, ty)| FieldSchema {
                    name: (*name).into(),
                    field_type: (*ty).into(),
                    mode: "NULLABLE".into(),
                    description: None,
                    fields: vec![],
                })
                .collect(),
            description: None,
            num_rows: None,
            num_bytes: None,
        };
        self.datasets.entry(dataset_id.into()).or_default().push(meta);
        self
    }

    /// Register a query that dry-runs and executes successfully, returning `rows`.
    pub fn with_query(mut self, sql: &str, rows: Vec<Value>) -> Self {
        let rows = rows
            .into_iter()
            .filter_map(|r| match r {
                Value::Object(map) => Some(map),
                _ => None,
            })
            .collect();
        self.queries.insert(query_key(sql), rows);
        self
    }

    /// Operations performed so far, e.g. `dry_run:SELECT 1`.
    pub async fn calls(&self) -> Vec<String> {
        self.calls.lock().await.clone()
    }

    async fn record(&self, call: String) {
        self.calls.lock().await.push(call);
    }

    fn dataset(&self, dataset: &DatasetRef) -> Result<&Vec<TableMetadata>> {
        if dataset.project_id != self.project_id {
            return Err(Error::api_with_status(
                "bigquery",
                format!("Access Denied: Project {}", dataset.project_id),
                403,
            ));
        }
        self.datasets.get(&dataset.dataset_id).ok_or_else(|| {
            Error::api_with_status(
                "bigquery",
                format!("Not found: Dataset {dataset}"),
                404,
            )
        })
    }

    fn query_rows(&self, sql: &str) -> Result<&Vec<Map<String, Value>>> {
        self.queries.get(&query_key(sql)).ok_or_else(|| {
            Error::api_with_status(
                "bigquery",
                format!("Syntax error: could not resolve query: {}", sql.trim()),
                400,
            )
        })
    }
}

fn query_key(sql: &str) -> String {
    sql.trim().trim_end_matches(';').trim_end().to_string()
}

static LEADING_KEYWORD: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"^[\s(]*([A-Za-z]+)").ok());
static STATEMENT_BREAK: LazyLock<Option<Regex>> = LazyLock::new(|| Regex::new(r";\s*\S").ok());

/// Statement type the way BigQuery reports it, from the leading keyword.
/// More than one statement is a `SCRIPT`.
pub fn statement_type_of(sql: &str) -> &'static str {
    let sql = query_key(sql);
    if STATEMENT_BREAK
        .as_ref()
        .is_some_and(|re| re.is_match(&sql).unwrap_or(true))
    {
        return "SCRIPT";
    }
    let keyword = LEADING_KEYWORD
        .as_ref()
        .and_then(|re| re.captures(&sql).ok().flatten())
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_ascii_uppercase())
        .unwrap_or_default();
    match keyword.as_str() {
        "SELECT" | "WITH" => "SELECT",
        "INSERT" => "INSERT",
        "UPDATE" => "UPDATE",
        "DELETE" => "DELETE",
        "MERGE" => "MERGE",
        "CREATE" => "CREATE_TABLE",
        "DROP" => "DROP_TABLE",
        "ALTER" => "ALTER_TABLE",
        "TRUNCATE" => "TRUNCATE_TABLE",
        _ => "SCRIPT",
    }
}

#[async_trait]
impl Warehouse for InMemoryWarehouse {
    fn project_id(&self) -> &str {
        &self.project_id
    }

    async fn list_datasets(&self) -> Result<Vec<String>> {
        self.record("list_datasets".into()).await;
        Ok(self.datasets.keys().cloned().collect())
    }

    async fn list_tables(&self, dataset: &DatasetRef) -> Result<Vec<TableEntry>> {
        self.record(format!("list_tables:{}", dataset.dataset_id)).await;
        Ok(self
            .dataset(dataset)?
            .iter()
            .map(|t| TableEntry {
                table_id: t.table.table_id.clone(),
                kind: t.kind,
            })
            .collect())
    }

    async fn get_table(&self, table: &TableRef) -> Result<TableMetadata> {
        self.record(format!("get_table:{}.{}", table.dataset_id, table.table_id))
            .await;
        let dataset = DatasetRef {
            project_id: table.project_id.clone(),
            dataset_id: table.dataset_id.clone(),
        };
        self.dataset(&dataset)?
            .iter()
            .find(|t| t.table.table_id == table.table_id)
            .cloned()
            .ok_or_else(|| {
                Error::api_with_status("bigquery", format!("Not found: Table {table}"), 404)
            })
    }

    async fn dry_run(&self, sql: &str) -> Result<DryRunReport> {
        self.record(format!("dry_run:{}", sql.trim())).await;
        let rows = self.query_rows(sql)?;
        let bytes = serde_json::to_string(rows).map(|s| s.len()).unwrap_or(0) as u64;
        Ok(DryRunReport {
            status: "DONE".into(),
            total_bytes_processed: bytes,
            statement_type: Some(statement_type_of(sql).into()),
            referenced_tables: Vec::new(),
            cache_hit: false,
        })
    }

    async fn execute(&self, sql: &str, max_rows: usize) -> Result<QueryOutput> {
        self.record(format!("execute:{}", sql.trim())).await;
        let all = self.query_rows(sql)?;
        let schema = all
            .first()
            .map(|row| {
                row.keys()
                    .map(|k| FieldSchema {
                        name: k.clone(),
                        field_type: "STRING".into(),
                        mode: "NULLABLE".into(),
                        description: None,
                        fields: vec![],
                    })
                    .collect()
            })
            .unwrap_or_default();
        Ok(QueryOutput {
            job_id: Some(format!("job_{}", all.len())),
            schema,
            rows: all.iter().take(max_rows).cloned().collect(),
            total_rows: Some(all.len() as u64),
            truncated: all.len() > max_rows,
            total_bytes_processed: None,
        })
    }
}
