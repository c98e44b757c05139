//! BigQuery REST v2 client.

use super::rows::decode_rows;
use super::types::{
    DatasetRef, DryRunReport, FieldSchema, QueryOutput, TableEntry, TableKind, TableMetadata,
    TableRef,
};
use super::Warehouse;
use crate::auth::TokenProvider;
use crate::error::{Error, Result};
use crate::http::{HttpClient, USER_AGENT};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

const DEFAULT_BASE_URL: &str = "https://bigquery.googleapis.com/bigquery/v2";
const LIST_PAGE_SIZE: u32 = 1000;
/// Upper bound for a single page of query results.
const RESULT_PAGE_SIZE: usize = 10_000;

pub struct BigQueryClient {
    project_id: String,
    location: Option<String>,
    tokens: Arc<TokenProvider>,
    http: HttpClient,
    base_url: String,
    query_timeout: Duration,
}

// -- Wire types --

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct DatasetList {
    #[serde(default)]
    datasets: Vec<DatasetListEntry>,
    next_page_token: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct DatasetListEntry {
    dataset_reference: WireDatasetReference,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireDatasetReference {
    dataset_id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct TableList {
    #[serde(default)]
    tables: Vec<TableListEntry>,
    next_page_token: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct TableListEntry {
    table_reference: WireTableReference,
    #[serde(rename = "type")]
    kind: Option<String>,
}

#[derive(Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
struct WireTableReference {
    project_id: String,
    dataset_id: String,
    table_id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireTable {
    table_reference: WireTableReference,
    #[serde(rename = "type")]
    kind: Option<String>,
    #[serde(default)]
    schema: Option<WireSchema>,
    description: Option<String>,
    num_rows: Option<String>,
    num_bytes: Option<String>,
}

#[derive(Deserialize, Default)]
struct WireSchema {
    #[serde(default)]
    fields: Vec<FieldSchema>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct DryRunJob<'a> {
    configuration: DryRunConfiguration<'a>,
    #[serde(skip_serializing_if = "Option::is_none")]
    job_reference: Option<JobReferenceRequest<'a>>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct DryRunConfiguration<'a> {
    dry_run: bool,
    query: JobQueryConfig<'a>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct JobQueryConfig<'a> {
    query: &'a str,
    use_legacy_sql: bool,
    use_query_cache: bool,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct JobReferenceRequest<'a> {
    project_id: &'a str,
    location: &'a str,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireJob {
    #[serde(default)]
    status: Option<WireJobStatus>,
    #[serde(default)]
    statistics: Option<WireJobStatistics>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireJobStatus {
    state: Option<String>,
    error_result: Option<WireErrorProto>,
}

#[derive(Deserialize)]
struct WireErrorProto {
    message: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireJobStatistics {
    total_bytes_processed: Option<String>,
    #[serde(default)]
    query: Option<WireQueryStatistics>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireQueryStatistics {
    statement_type: Option<String>,
    #[serde(default)]
    referenced_tables: Vec<WireTableReference>,
    cache_hit: Option<bool>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct QueryRequest<'a> {
    query: &'a str,
    use_legacy_sql: bool,
    max_results: usize,
    timeout_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    location: Option<&'a str>,
    format_options: FormatOptions,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct FormatOptions {
    use_int64_timestamp: bool,
}

/// Shared shape of `jobs.query` and `jobs.getQueryResults` responses.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct QueryResponse {
    #[serde(default)]
    job_complete: bool,
    job_reference: Option<WireJobReference>,
    #[serde(default)]
    schema: Option<WireSchema>,
    #[serde(default)]
    rows: Vec<Value>,
    total_rows: Option<String>,
    page_token: Option<String>,
    total_bytes_processed: Option<String>,
    #[serde(default)]
    errors: Vec<WireErrorProto>,
}

#[derive(Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
struct WireJobReference {
    job_id: String,
    location: Option<String>,
}

fn parse_u64(s: Option<&str>) -> Option<u64> {
    s.and_then(|v| v.parse().ok())
}

impl BigQueryClient {
    pub fn new(
        project_id: String,
        location: Option<String>,
        tokens: Arc<TokenProvider>,
        query_timeout_ms: u64,
    ) -> Result<Self> {
        Ok(Self {
            project_id,
            location,
            tokens,
            http: HttpClient::new(USER_AGENT)?,
            base_url: DEFAULT_BASE_URL.into(),
            query_timeout: Duration::from_millis(query_timeout_ms),
        })
    }

    /// Point at a different API root (emulators, private endpoints).
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    async fn get<T: serde::de::DeserializeOwned>(&self, url: &str) -> Result<T> {
        let token = self.tokens.token().await?;
        self.http.get_json_authed(url, &token).await
    }

    async fn post<B: Serialize, T: serde::de::DeserializeOwned>(
        &self,
        url: &str,
        body: &B,
    ) -> Result<T> {
        let token = self.tokens.token().await?;
        self.http.post_json_authed(url, &token, body).await
    }

    fn results_url(&self, job: &WireJobReference, page_token: Option<&str>) -> Result<String> {
        let mut params = vec![
            ("formatOptions.useInt64Timestamp", "true".to_string()),
            ("timeoutMs", self.query_timeout.as_millis().to_string()),
            ("maxResults", RESULT_PAGE_SIZE.to_string()),
        ];
        if let Some(location) = job.location.as_deref().or(self.location.as_deref()) {
            params.push(("location", location.to_string()));
        }
        if let Some(token) = page_token {
            params.push(("pageToken", token.to_string()));
        }
        with_query(
            &format!(
                "{}/projects/{}/queries/{}",
                self.base_url, self.project_id, job.job_id
            ),
            &params,
        )
    }
}

/// Append URL-encoded query parameters.
fn with_query(base: &str, params: &[(&str, String)]) -> Result<String> {
    reqwest::Url::parse_with_params(base, params)
        .map(String::from)
        .map_err(|e| Error::parse(format!("invalid URL {base}: {e}")))
}

fn page_params(page_token: Option<&str>) -> Vec<(&'static str, String)> {
    let mut params = vec![("maxResults", LIST_PAGE_SIZE.to_string())];
    if let Some(token) = page_token {
        params.push(("pageToken", token.to_string()));
    }
    params
}

#[async_trait]
impl Warehouse for BigQueryClient {
    fn project_id(&self) -> &str {
        &self.project_id
    }

    async fn list_datasets(&self) -> Result<Vec<String>> {
        let mut out = Vec::new();
        let mut page_token: Option<String> = None;
        loop {
            let url = with_query(
                &format!("{}/projects/{}/datasets", self.base_url, self.project_id),
                &page_params(page_token.as_deref()),
            )?;
            let page: DatasetList = self.get(&url).await?;
            out.extend(page.datasets.into_iter().map(|d| d.dataset_reference.dataset_id));
            match page.next_page_token {
                Some(token) if !token.is_empty() => page_token = Some(token),
                _ => break,
            }
        }
        debug!(count = out.len(), "listed datasets");
        Ok(out)
    }

    async fn list_tables(&self, dataset: &DatasetRef) -> Result<Vec<TableEntry>> {
        let mut out = Vec::new();
        let mut page_token: Option<String> = None;
        loop {
            let url = with_query(
                &format!(
                    "{}/projects/{}/datasets/{}/tables",
                    self.base_url, dataset.project_id, dataset.dataset_id
                ),
                &page_params(page_token.as_deref()),
            )?;
            let page: TableList = self.get(&url).await?;
            out.extend(page.tables.into_iter().map(|t| TableEntry {
                table_id: t.table_reference.table_id,
                kind: TableKind::from_api(t.kind.as_deref()),
            }));
            match page.next_page_token {
                Some(token) if !token.is_empty() => page_token = Some(token),
                _ => break,
            }
        }
        debug!(dataset = %dataset, count = out.len(), "listed tables");
        Ok(out)
    }

    async fn get_table(&self, table: &TableRef) -> Result<TableMetadata> {
        let url = format!(
            "{}/projects/{}/datasets/{}/tables/{}",
            self.base_url, table.project_id, table.dataset_id, table.table_id
        );
        let wire: WireTable = self.get(&url).await?;
        Ok(TableMetadata {
            table: TableRef {
                project_id: wire.table_reference.project_id,
                dataset_id: wire.table_reference.dataset_id,
                table_id: wire.table_reference.table_id,
            },
            kind: TableKind::from_api(wire.kind.as_deref()),
            schema: wire.schema.unwrap_or_default().fields,
            description: wire.description,
            num_rows: parse_u64(wire.num_rows.as_deref()),
            num_bytes: parse_u64(wire.num_bytes.as_deref()),
        })
    }

    async fn dry_run(&self, sql: &str) -> Result<DryRunReport> {
        let url = format!("{}/projects/{}/jobs", self.base_url, self.project_id);
        let body = DryRunJob {
            configuration: DryRunConfiguration {
                dry_run: true,
                query: JobQueryConfig {
                    query: sql,
                    use_legacy_sql: false,
                    use_query_cache: false,
                },
            },
            job_reference: self.location.as_deref().map(|location| JobReferenceRequest {
                project_id: &self.project_id,
                location,
            }),
        };
        let job: WireJob = self.post(&url, &body).await?;

        if let Some(err) = job.status.as_ref().and_then(|s| s.error_result.as_ref()) {
            return Err(Error::api(
                "bigquery",
                err.message.clone().unwrap_or_else(|| "dry run failed".into()),
            ));
        }

        let stats = job.statistics;
        let query_stats = stats.as_ref().and_then(|s| s.query.as_ref());
        let report = DryRunReport {
            status: job
                .status
                .and_then(|s| s.state)
                .unwrap_or_else(|| "DONE".into()),
            total_bytes_processed: parse_u64(
                stats.as_ref().and_then(|s| s.total_bytes_processed.as_deref()),
            )
            .unwrap_or(0),
            statement_type: query_stats.and_then(|q| q.statement_type.clone()),
            referenced_tables: query_stats
                .map(|q| {
                    q.referenced_tables
                        .iter()
                        .map(|t| format!("{}.{}.{}", t.project_id, t.dataset_id, t.table_id))
                        .collect()
                })
                .unwrap_or_default(),
            cache_hit: query_stats.and_then(|q| q.cache_hit).unwrap_or(false),
        };
        debug!(
            bytes = report.total_bytes_processed,
            statement = ?report.statement_type,
            "dry run ok"
        );
        Ok(report)
    }

    async fn execute(&self, sql: &str, max_rows: usize) -> Result<QueryOutput> {
        let deadline = Instant::now() + self.query_timeout;
        let url = format!("{}/projects/{}/queries", self.base_url, self.project_id);
        let request = QueryRequest {
            query: sql,
            use_legacy_sql: false,
            max_results: max_rows.clamp(1, RESULT_PAGE_SIZE),
            timeout_ms: self.query_timeout.as_millis().min(u128::from(u64::MAX)) as u64,
            location: self.location.as_deref(),
            format_options: FormatOptions {
                use_int64_timestamp: true,
            },
        };
        let mut page: QueryResponse = self.post(&url, &request).await?;

        let job = page
            .job_reference
            .clone()
            .ok_or_else(|| Error::parse("query response has no job reference"))?;
        info!(job_id = %job.job_id, "query submitted");

        while !page.job_complete {
            if Instant::now() >= deadline {
                return Err(Error::api(
                    "bigquery",
                    format!(
                        "query job {} did not finish within {} ms",
                        job.job_id,
                        self.query_timeout.as_millis()
                    ),
                ));
            }
            debug!(job_id = %job.job_id, "waiting for query to complete");
            page = self.get(&self.results_url(&job, None)?).await?;
        }

        if let Some(err) = page.errors.first() {
            return Err(Error::api(
                "bigquery",
                err.message.clone().unwrap_or_else(|| "query failed".into()),
            ));
        }

        let schema = page.schema.take().unwrap_or_default().fields;
        let total_rows = parse_u64(page.total_rows.as_deref());
        let total_bytes_processed = parse_u64(page.total_bytes_processed.as_deref());
        let mut rows = decode_rows(&schema, &page.rows)?;
        let mut next = page.page_token.take();

        while rows.len() < max_rows {
            let Some(token) = next.take() else { break };
            let more: QueryResponse = self.get(&self.results_url(&job, Some(&token))?).await?;
            rows.extend(decode_rows(&schema, &more.rows)?);
            next = more.page_token;
        }

        let truncated = rows.len() > max_rows
            || next.is_some()
            || total_rows.is_some_and(|t| t > max_rows as u64);
        rows.truncate(max_rows);

        info!(
            job_id = %job.job_id,
            rows = rows.len(),
            total_rows = ?total_rows,
            truncated,
            "query complete"
        );

        Ok(QueryOutput {
            job_id: Some(job.job_id),
            schema,
            rows,
            total_rows,
            truncated,
            total_bytes_processed,
        })
    }
}
