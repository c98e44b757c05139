use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// `project.dataset`, with the project defaulted from the client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetRef {
    pub project_id: String,
    pub dataset_id: String,
}

impl DatasetRef {
    /// Accepts `dataset`, `project.dataset` or `project:dataset`, optionally backquoted.
    pub fn parse(input: &str, default_project: &str) -> Result<Self> {
        let cleaned = input.trim().trim_matches('`');
        if cleaned.is_empty() {
            return Err(Error::parse("dataset_id must not be empty"));
        }

        let (project, dataset) = if let Some((project, dataset)) = cleaned.rsplit_once('.') {
            (project, dataset)
        } else if let Some((project, dataset)) = cleaned.split_once(':') {
            (project, dataset)
        } else {
            (default_project, cleaned)
        };

        if project.is_empty() || !project.chars().all(is_project_char) {
            return Err(Error::parse(format!("invalid project id '{project}'")));
        }
        if dataset.is_empty() || !dataset.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return Err(Error::parse(format!(
                "invalid dataset id '{dataset}': only letters, digits and underscores are allowed"
            )));
        }

        Ok(Self {
            project_id: project.into(),
            dataset_id: dataset.into(),
        })
    }
}

// Domain-scoped projects look like `example.com:analytics`.
fn is_project_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | ':' | '.')
}

impl std::fmt::Display for DatasetRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.project_id, self.dataset_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableRef {
    pub project_id: String,
    pub dataset_id: String,
    pub table_id: String,
}

impl TableRef {
    pub fn new(dataset: &DatasetRef, table_id: &str) -> Result<Self> {
        let table_id = table_id.trim().trim_matches('`');
        if table_id.is_empty() {
            return Err(Error::parse("table_id must not be empty"));
        }
        if table_id.contains(['/', '?', '#', '.']) {
            return Err(Error::parse(format!("invalid table id '{table_id}'")));
        }
        Ok(Self {
            project_id: dataset.project_id.clone(),
            dataset_id: dataset.dataset_id.clone(),
            table_id: table_id.into(),
        })
    }
}

impl std::fmt::Display for TableRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}", self.project_id, self.dataset_id, self.table_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TableKind {
    Table,
    View,
    MaterializedView,
    External,
    Snapshot,
    Other,
}

impl TableKind {
    pub fn from_api(kind: Option<&str>) -> Self {
        match kind {
            Some("TABLE") | None => Self::Table,
            Some("VIEW") => Self::View,
            Some("MATERIALIZED_VIEW") => Self::MaterializedView,
            Some("EXTERNAL") => Self::External,
            Some("SNAPSHOT") => Self::Snapshot,
            Some(_) => Self::Other,
        }
    }

    /// Tables, views and materialized views can appear in a FROM clause.
    pub fn is_queryable(self) -> bool {
        !matches!(self, Self::Other)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableEntry {
    pub table_id: String,
    pub kind: TableKind,
}

/// One column in a table schema, as the BigQuery API describes it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldSchema {
    pub name: String,
    #[serde(rename = "type")]
    pub field_type: String,
    #[serde(default = "default_mode")]
    pub mode: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fields: Vec<FieldSchema>,
}

fn default_mode() -> String {
    "NULLABLE".into()
}

impl FieldSchema {
    pub fn is_repeated(&self) -> bool {
        self.mode.eq_ignore_ascii_case("REPEATED")
    }

    pub fn is_record(&self) -> bool {
        matches!(self.field_type.as_str(), "RECORD" | "STRUCT")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableMetadata {
    pub table: TableRef,
    pub kind: TableKind,
    pub schema: Vec<FieldSchema>,
    pub description: Option<String>,
    pub num_rows: Option<u64>,
    pub num_bytes: Option<u64>,
}

impl TableMetadata {
    /// Whether a top-level column matches `name`, ignoring ASCII case.
    pub fn has_column(&self, name: &str) -> bool {
        self.schema.iter().any(|f| f.name.eq_ignore_ascii_case(name))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DryRunReport {
    /// Job state reported by the service; `DONE` for a valid query.
    pub status: String,
    pub total_bytes_processed: u64,
    pub statement_type: Option<String>,
    pub referenced_tables: Vec<String>,
    pub cache_hit: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryOutput {
    pub job_id: Option<String>,
    pub schema: Vec<FieldSchema>,
    pub rows: Vec<Map<String, Value>>,
    pub total_rows: Option<u64>,
    /// More rows exist than were fetched.
    pub truncated: bool,
    pub total_bytes_processed: Option<u64>,
}

/// Human-readable byte count (binary units), e.g. `1.5 GiB`.
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 6] = ["B", "KiB", "MiB", "GiB", "TiB", "PiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}
