//! Read-only access to the data warehouse.
//!
//! `Warehouse` is the seam between the agent's tools and BigQuery: every
//! method is a single request/response round trip (or a short paging loop).
//! The tools only ever see this trait, so tests drive them with an in-memory
//! implementation.

pub mod bigquery;
pub mod memory;
pub mod rows;
pub mod types;

pub use bigquery::BigQueryClient;
pub use memory::InMemoryWarehouse;
pub use types::{
    DatasetRef, DryRunReport, FieldSchema, QueryOutput, TableEntry, TableKind, TableMetadata,
    TableRef, format_bytes,
};

use crate::error::Result;
use async_trait::async_trait;
use futures::stream::{self, StreamExt, TryStreamExt};
use tracing::debug;

/// How many table lookups run at once when scanning a dataset.
const METADATA_CONCURRENCY: usize = 8;

#[async_trait]
pub trait Warehouse: Send + Sync {
    /// Project used when a dataset id carries none.
    fn project_id(&self) -> &str;

    async fn list_datasets(&self) -> Result<Vec<String>>;

    async fn list_tables(&self, dataset: &DatasetRef) -> Result<Vec<TableEntry>>;

    async fn get_table(&self, table: &TableRef) -> Result<TableMetadata>;

    /// Validate `sql` and estimate bytes processed without running it.
    async fn dry_run(&self, sql: &str) -> Result<DryRunReport>;

    /// Run `sql`, returning at most `max_rows` rows.
    async fn execute(&self, sql: &str, max_rows: usize) -> Result<QueryOutput>;
}

/// Every table in the project as `dataset.table`.
pub async fn list_all_tables(warehouse: &dyn Warehouse) -> Result<Vec<String>> {
    let project = warehouse.project_id().to_string();
    let mut all = Vec::new();
    for dataset_id in warehouse.list_datasets().await? {
        let dataset = DatasetRef {
            project_id: project.clone(),
            dataset_id,
        };
        let tables = warehouse.list_tables(&dataset).await?;
        all.extend(
            tables
                .into_iter()
                .map(|t| format!("{}.{}", dataset.dataset_id, t.table_id)),
        );
    }
    debug!(count = all.len(), "listed all tables in project");
    Ok(all)
}

/// Tables in `dataset` with a top-level column named `column` (ASCII case-insensitive),
/// in listing order.
pub async fn find_tables_with_column(
    warehouse: &dyn Warehouse,
    dataset: &DatasetRef,
    column: &str,
) -> Result<Vec<String>> {
    let tables = warehouse.list_tables(dataset).await?;
    let refs = tables
        .iter()
        .filter(|t| t.kind.is_queryable())
        .map(|t| TableRef::new(dataset, &t.table_id))
        .collect::<Result<Vec<_>>>()?;

    let matches: Vec<Option<String>> = stream::iter(refs)
        .map(|table_ref| async move {
            let meta = warehouse.get_table(&table_ref).await?;
            Ok::<_, crate::error::Error>(meta.has_column(column).then_some(table_ref.table_id))
        })
        .buffered(METADATA_CONCURRENCY)
        .try_collect()
        .await?;

    Ok(matches.into_iter().flatten().collect())
}
