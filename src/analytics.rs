//! Analytics warehouse client.
//!
//! Runs publication queries through the BigQuery REST `jobs.query` API,
//! passing each batch as a named `ARRAY<STRING>` parameter and following
//! `pageToken`s until the whole result is read.
//!
//! Nested columns come back as structured JSON and are flattened to the text
//! encodings the rest of the pipeline reads (see [`crate::normalize`]):
//! repeated scalars as `['a' 'b']`, records as `{'id': 'pub.1', ...}`,
//! repeated records one record per line.

use crate::credentials::Credential;
use crate::error::{FetchError, OptionExt, Result};
use crate::executor::{BatchSource, Fetched, Sentinel};
use crate::rate_limit::CallLimiter;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info, warn};

/// BigQuery REST API base URL
pub const DEFAULT_API_BASE: &str = "https://bigquery.googleapis.com/bigquery/v2";

/// Publications table in the warehouse
pub const PUBLICATIONS_TABLE: &str = "dimensions-ai.data_analytics.publications";

/// Name of the array parameter holding the batch
const KEYS_PARAM: &str = "keys";

/// Columns selected by every publication query, in output order
const SELECT_COLUMNS: &str = "id, title.preferred AS title, doi, journal.issn AS issn, \
    journal.eissn AS eissn, type, date_normal AS date, category_for, citations_count, \
    research_org_cities, research_org_country_names, altmetrics, reference_ids, citations";

/// How a batch of identifiers is matched
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryMode {
    /// Identifiers are ISSNs; match print or electronic ISSN
    JournalCode,
    /// Identifiers are publication ids
    EntityId,
}

impl QueryMode {
    pub fn as_str(self) -> &'static str {
        match self {
            QueryMode::JournalCode => "journal-code",
            QueryMode::EntityId => "entity-id",
        }
    }
}

/// One publication returned by the warehouse
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PublicationRow {
    pub id: String,
    pub title: String,
    pub doi: String,
    pub issn: String,
    pub eissn: String,
    #[serde(rename = "type")]
    pub pub_type: String,
    pub date: String,
    pub category_for: String,
    pub citations_count: String,
    pub research_org_cities: String,
    pub research_org_country_names: String,
    pub altmetrics: String,
    pub reference_ids: String,
    pub citations: String,
}

impl PublicationRow {
    /// Placeholder for an identifier whose batch could not be fetched
    pub fn sentinel(identifier: &str, mode: QueryMode, sentinel: Sentinel) -> Self {
        let marker = sentinel.marker().to_string();
        match mode {
            QueryMode::JournalCode => Self {
                id: marker.clone(),
                title: marker,
                issn: identifier.to_string(),
                ..Default::default()
            },
            QueryMode::EntityId => Self {
                id: identifier.to_string(),
                title: marker,
                ..Default::default()
            },
        }
    }

    /// Whether this row is a placeholder rather than a real publication
    pub fn is_sentinel(&self) -> bool {
        Sentinel::is_marker(&self.title)
    }

    fn from_columns(mut cols: HashMap<String, String>) -> Self {
        let mut take = |name: &str| cols.remove(name).unwrap_or_default();
        Self {
            id: take("id"),
            title: take("title"),
            doi: take("doi"),
            issn: take("issn"),
            eissn: take("eissn"),
            pub_type: take("type"),
            date: take("date"),
            category_for: take("category_for"),
            citations_count: take("citations_count"),
            research_org_cities: take("research_org_cities"),
            research_org_country_names: take("research_org_country_names"),
            altmetrics: take("altmetrics"),
            reference_ids: take("reference_ids"),
            citations: take("citations"),
        }
    }
}

/// Warehouse connection settings
#[derive(Debug, Clone)]
pub struct WarehouseConfig {
    /// REST API base URL
    pub base_url: String,
    /// Billing project the queries run under
    pub project: String,
    /// Fully qualified publications table
    pub table: String,
    /// Per-request HTTP timeout
    pub timeout: Duration,
    /// Wait between polls of an unfinished job
    pub poll_interval: Duration,
    /// Polls before an unfinished job counts as a transient failure
    pub max_polls: u32,
}

impl WarehouseConfig {
    pub fn new(project: impl Into<String>) -> Self {
        Self {
            base_url: DEFAULT_API_BASE.to_string(),
            project: project.into(),
            table: PUBLICATIONS_TABLE.to_string(),
            timeout: Duration::from_secs(600),
            poll_interval: Duration::from_secs(2),
            max_polls: 150,
        }
    }
}

// === BigQuery REST types ===

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct QueryRequest<'a> {
    query: String,
    use_legacy_sql: bool,
    parameter_mode: &'static str,
    query_parameters: Vec<QueryParameter<'a>>,
    timeout_ms: u64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct QueryParameter<'a> {
    name: &'static str,
    parameter_type: Value,
    parameter_value: ArrayValue<'a>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ArrayValue<'a> {
    array_values: Vec<ScalarValue<'a>>,
}

#[derive(Debug, Serialize)]
struct ScalarValue<'a> {
    value: &'a str,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct QueryResponse {
    schema: Option<TableSchema>,
    job_reference: Option<JobReference>,
    #[serde(default)]
    rows: Vec<TableRow>,
    page_token: Option<String>,
    #[serde(default)]
    job_complete: bool,
    #[allow(dead_code)]
    total_rows: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct TableSchema {
    fields: Vec<FieldSchema>,
}

#[derive(Debug, Clone, Deserialize)]
struct FieldSchema {
    name: String,
    #[serde(rename = "type")]
    field_type: String,
    #[serde(default)]
    mode: Option<String>,
    #[serde(default)]
    fields: Vec<FieldSchema>,
}

impl FieldSchema {
    fn is_repeated(&self) -> bool {
        self.mode.as_deref() == Some("REPEATED")
    }

    fn is_record(&self) -> bool {
        matches!(self.field_type.as_str(), "RECORD" | "STRUCT")
    }

    fn is_string(&self) -> bool {
        matches!(self.field_type.as_str(), "STRING" | "DATE" | "TIMESTAMP" | "DATETIME")
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JobReference {
    job_id: String,
    location: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TableRow {
    f: Vec<TableCell>,
}

#[derive(Debug, Deserialize)]
struct TableCell {
    #[serde(default)]
    v: Value,
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ApiError,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    #[serde(default)]
    message: String,
    #[serde(default)]
    errors: Vec<ErrorDetail>,
}

#[derive(Debug, Deserialize)]
struct ErrorDetail {
    reason: Option<String>,
}

/// BigQuery REST client for publication lookups
pub struct WarehouseClient {
    client: Client,
    config: WarehouseConfig,
}

impl WarehouseClient {
    pub fn new(config: WarehouseConfig) -> Result<Self> {
        if config.project.trim().is_empty() {
            return Err(FetchError::Config("Warehouse project id is empty".to_string()));
        }
        let client = Client::builder()
            .timeout(config.timeout)
            .user_agent("rustbibfetch/0.1")
            .build()
            .map_err(|e| FetchError::Config(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self { client, config })
    }

    /// SQL for one batch, with the batch bound to `@keys`
    pub fn build_query(&self, mode: QueryMode) -> String {
        build_query(&self.config.table, mode)
    }

    /// Run a query for one batch and read every result page.
    pub async fn query(
        &self,
        mode: QueryMode,
        keys: &[String],
        credential: &Credential,
        limiter: &CallLimiter,
    ) -> Result<Vec<PublicationRow>> {
        let url = format!("{}/projects/{}/queries", self.config.base_url, self.config.project);
        let body = QueryRequest {
            query: self.build_query(mode),
            use_legacy_sql: false,
            parameter_mode: "NAMED",
            query_parameters: vec![QueryParameter {
                name: KEYS_PARAM,
                parameter_type: serde_json::json!({"type": "ARRAY", "arrayType": {"type": "STRING"}}),
                parameter_value: ArrayValue {
                    array_values: keys.iter().map(|k| ScalarValue { value: k }).collect(),
                },
            }],
            timeout_ms: self.config.timeout.as_millis() as u64,
        };

        debug!(url = %url, mode = mode.as_str(), keys = keys.len(), "Submitting warehouse query");
        limiter.acquire(1).await;
        let response = self
            .client
            .post(&url)
            .bearer_auth(credential.secret())
            .json(&body)
            .send()
            .await?;
        let mut page = read_response(response, credential).await?;

        let mut schema: Option<TableSchema> = page.schema.clone();
        let mut rows = Vec::new();
        let mut polls = 0u32;

        loop {
            if page.job_complete {
                if schema.is_none() {
                    schema = page.schema.clone();
                }
                let fields = schema
                    .as_ref()
                    .map(|s| s.fields.as_slice())
                    .ok_or_malformed("query response without schema")?;
                for row in &page.rows {
                    rows.push(decode_row(row, fields)?);
                }
                if page.page_token.is_none() {
                    break;
                }
            } else {
                polls += 1;
                if polls > self.config.max_polls {
                    return Err(FetchError::Transient {
                        status: StatusCode::ACCEPTED.as_u16(),
                        message: format!("query still running after {} polls", self.config.max_polls),
                    });
                }
                tokio::time::sleep(self.config.poll_interval).await;
            }

            let job = page
                .job_reference
                .as_ref()
                .ok_or_malformed("query response without jobReference")?;
            let mut request = self
                .client
                .get(format!(
                    "{}/projects/{}/queries/{}",
                    self.config.base_url, self.config.project, job.job_id
                ))
                .bearer_auth(credential.secret());
            if let Some(location) = &job.location {
                request = request.query(&[("location", location.as_str())]);
            }
            if let Some(token) = page.page_token.as_deref().filter(|_| page.job_complete) {
                request = request.query(&[("pageToken", token)]);
            }
            limiter.acquire(1).await;
            page = read_response(request.send().await?, credential).await?;
        }

        info!(mode = mode.as_str(), keys = keys.len(), rows = rows.len(), "Warehouse query complete");
        Ok(rows)
    }
}

/// SQL text for a mode against `table`
pub fn build_query(table: &str, mode: QueryMode) -> String {
    let predicate = match mode {
        QueryMode::JournalCode => format!(
            "(journal.issn IN UNNEST(@{k}) OR journal.eissn IN UNNEST(@{k}))",
            k = KEYS_PARAM
        ),
        QueryMode::EntityId => format!("id IN UNNEST(@{})", KEYS_PARAM),
    };
    format!(
        "SELECT {} FROM `{}` WHERE type = 'article' AND {}",
        SELECT_COLUMNS, table, predicate
    )
}

async fn read_response(response: reqwest::Response, credential: &Credential) -> Result<QueryResponse> {
    let status = response.status();
    let text = response.text().await?;
    if status.is_success() {
        return serde_json::from_str(&text)
            .map_err(|e| FetchError::Malformed(format!("Failed to parse warehouse response: {}", e)));
    }
    Err(classify_error(status, &text, credential.index()))
}

/// Map a non-2xx warehouse response onto the error taxonomy
fn classify_error(status: StatusCode, body: &str, key_index: usize) -> FetchError {
    let envelope: Option<ErrorEnvelope> = serde_json::from_str(body).ok();
    let message = envelope
        .as_ref()
        .map(|e| e.error.message.clone())
        .unwrap_or_else(|| body.chars().take(200).collect());
    let has_reason = |wanted: &[&str]| {
        envelope.as_ref().is_some_and(|e| {
            e.error
                .errors
                .iter()
                .filter_map(|d| d.reason.as_deref())
                .any(|r| wanted.contains(&r))
        })
    };

    if status == StatusCode::TOO_MANY_REQUESTS || has_reason(&["quotaExceeded", "rateLimitExceeded"]) {
        return FetchError::QuotaExhausted { key_index };
    }
    if status == StatusCode::UNAUTHORIZED {
        warn!(key = key_index, "Warehouse rejected credential, treating as spent");
        return FetchError::QuotaExhausted { key_index };
    }
    if status == StatusCode::NOT_FOUND || has_reason(&["notFound"]) {
        return FetchError::NotFound(message);
    }
    if status == StatusCode::BAD_REQUEST || status == StatusCode::FORBIDDEN {
        return FetchError::Rejected {
            status: status.as_u16(),
            message,
        };
    }
    FetchError::Transient {
        status: status.as_u16(),
        message,
    }
}

fn decode_row(row: &TableRow, fields: &[FieldSchema]) -> Result<PublicationRow> {
    if row.f.len() != fields.len() {
        return Err(FetchError::Malformed(format!(
            "row has {} cells, schema has {} fields",
            row.f.len(),
            fields.len()
        )));
    }
    let cols = fields
        .iter()
        .zip(&row.f)
        .map(|(field, cell)| (field.name.clone(), render_cell(&cell.v, field)))
        .collect();
    Ok(PublicationRow::from_columns(cols))
}

/// Render a top-level cell as CSV text
fn render_cell(value: &Value, field: &FieldSchema) -> String {
    if value.is_null() {
        return String::new();
    }
    if field.is_repeated() {
        let items = repeated_items(value);
        if field.is_record() {
            return items
                .iter()
                .map(|item| render_record(item, &field.fields))
                .collect::<Vec<_>>()
                .join("\n");
        }
        let quoted: Vec<String> = items.iter().map(|item| format!("'{}'", scalar_text(item))).collect();
        return format!("[{}]", quoted.join(" "));
    }
    if field.is_record() {
        return render_record(value, &field.fields);
    }
    scalar_text(value)
}

/// `{"v": [{"v": x}, ...]}` style arrays
fn repeated_items(value: &Value) -> Vec<&Value> {
    value
        .as_array()
        .map(|arr| arr.iter().map(|item| item.get("v").unwrap_or(item)).collect())
        .unwrap_or_default()
}

/// Dict-like text for a `{"f": [...]}` record
fn render_record(value: &Value, fields: &[FieldSchema]) -> String {
    let cells: Vec<&Value> = value
        .get("f")
        .and_then(Value::as_array)
        .map(|arr| arr.iter().map(|c| c.get("v").unwrap_or(c)).collect())
        .unwrap_or_default();
    let parts: Vec<String> = fields
        .iter()
        .zip(cells)
        .map(|(field, v)| format!("'{}': {}", field.name, literal(v, field)))
        .collect();
    format!("{{{}}}", parts.join(", "))
}

/// Value as it appears inside a record
fn literal(value: &Value, field: &FieldSchema) -> String {
    if value.is_null() {
        return "None".to_string();
    }
    if field.is_repeated() {
        let items = repeated_items(value);
        let rendered: Vec<String> = if field.is_record() {
            items.iter().map(|i| render_record(i, &field.fields)).collect()
        } else {
            items.iter().map(|i| quote_if(field.is_string(), &scalar_text(i))).collect()
        };
        return format!("[{}]", rendered.join(", "));
    }
    if field.is_record() {
        return render_record(value, &field.fields);
    }
    quote_if(field.is_string(), &scalar_text(value))
}

fn quote_if(quote: bool, text: &str) -> String {
    if quote {
        format!("'{}'", text.replace('\'', "\\'"))
    } else {
        text.to_string()
    }
}

fn scalar_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Warehouse publications as a [`BatchSource`]
pub struct PublicationSource {
    client: WarehouseClient,
    mode: QueryMode,
}

impl PublicationSource {
    pub fn new(client: WarehouseClient, mode: QueryMode) -> Self {
        Self { client, mode }
    }
}

impl BatchSource for PublicationSource {
    type Row = PublicationRow;

    fn name(&self) -> &str {
        self.mode.as_str()
    }

    async fn fetch(
        &self,
        batch: &[String],
        credential: &Credential,
        limiter: &CallLimiter,
    ) -> Result<Fetched<PublicationRow>> {
        let rows = self.client.query(self.mode, batch, credential, limiter).await?;
        Ok(Fetched::rows(rows))
    }

    fn sentinel_rows(&self, batch: &[String], sentinel: Sentinel) -> Vec<PublicationRow> {
        batch
            .iter()
            .map(|id| PublicationRow::sentinel(id, self.mode, sentinel))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn field(name: &str, ty: &str, mode: Option<&str>, fields: Vec<FieldSchema>) -> FieldSchema {
        FieldSchema {
            name: name.to_string(),
            field_type: ty.to_string(),
            mode: mode.map(str::to_string),
            fields,
        }
    }

    #[test]
    fn test_build_query_modes() {
        let sql = build_query(PUBLICATIONS_TABLE, QueryMode::JournalCode);
        assert!(sql.contains("journal.issn IN UNNEST(@keys) OR journal.eissn IN UNNEST(@keys)"));
        assert!(sql.contains("type = 'article'"));
        assert!(sql.contains("`dimensions-ai.data_analytics.publications`"));

        let sql = build_query(PUBLICATIONS_TABLE, QueryMode::EntityId);
        assert!(sql.ends_with("id IN UNNEST(@keys)"));
        assert!(!sql.contains("journal.eissn IN"));
    }

    #[test]
    fn test_render_repeated_scalar() {
        let f = field("reference_ids", "STRING", Some("REPEATED"), vec![]);
        let v = json!([{"v": "pub.1"}, {"v": "pub.2"}]);
        assert_eq!(render_cell(&v, &f), "['pub.1' 'pub.2']");
        assert_eq!(render_cell(&json!([]), &f), "[]");
        assert_eq!(render_cell(&Value::Null, &f), "");
    }

    #[test]
    fn test_render_repeated_record() {
        let f = field(
            "citations",
            "RECORD",
            Some("REPEATED"),
            vec![
                field("id", "STRING", None, vec![]),
                field("year", "INTEGER", None, vec![]),
            ],
        );
        let v = json!([
            {"v": {"f": [{"v": "pub.9"}, {"v": "2019"}]}},
            {"v": {"f": [{"v": "pub.10"}, {"v": null}]}}
        ]);
        assert_eq!(
            render_cell(&v, &f),
            "{'id': 'pub.9', 'year': 2019}\n{'id': 'pub.10', 'year': None}"
        );
    }

    #[test]
    fn test_rendered_cells_round_trip_through_normalizer() {
        let refs = field("reference_ids", "STRING", Some("REPEATED"), vec![]);
        let text = render_cell(&json!([{"v": "pub.1"}, {"v": "pub.2"}, {"v": "pub.1"}]), &refs);
        assert_eq!(crate::normalize::parse_id_list(&text).len(), 2);

        let cites = field(
            "citations",
            "RECORD",
            Some("REPEATED"),
            vec![field("id", "STRING", None, vec![])],
        );
        let text = render_cell(&json!([{"v": {"f": [{"v": "pub.3"}]}}]), &cites);
        let parsed = crate::normalize::parse_record_ids(&text);
        assert!(parsed.ids.contains("pub.3"));
        assert!(parsed.errors.is_empty());

        let titled = field(
            "citations",
            "RECORD",
            Some("REPEATED"),
            vec![field("id", "STRING", None, vec![]), field("title", "STRING", None, vec![])],
        );
        let text = render_cell(
            &json!([{"v": {"f": [{"v": "pub.1"}, {"v": "O'Brien law"}]}}]),
            &titled,
        );
        assert_eq!(text, r"{'id': 'pub.1', 'title': 'O\'Brien law'}");
        let parsed = crate::normalize::parse_record_ids(&text);
        assert!(parsed.ids.contains("pub.1"));
        assert!(parsed.errors.is_empty());
    }

    #[test]
    fn test_classify_errors() {
        let quota = r#"{"error": {"code": 403, "message": "Quota exceeded", "errors": [{"reason": "quotaExceeded"}]}}"#;
        assert!(matches!(
            classify_error(StatusCode::FORBIDDEN, quota, 1),
            FetchError::QuotaExhausted { key_index: 1 }
        ));
        assert!(matches!(
            classify_error(StatusCode::TOO_MANY_REQUESTS, "", 0),
            FetchError::QuotaExhausted { .. }
        ));
        let invalid = r#"{"error": {"code": 400, "message": "Syntax error", "errors": [{"reason": "invalidQuery"}]}}"#;
        assert!(matches!(
            classify_error(StatusCode::BAD_REQUEST, invalid, 0),
            FetchError::Rejected { status: 400, .. }
        ));
        assert!(matches!(classify_error(StatusCode::NOT_FOUND, "", 0), FetchError::NotFound(_)));
        assert!(matches!(
            classify_error(StatusCode::SERVICE_UNAVAILABLE, "<html>", 0),
            FetchError::Transient { status: 503, .. }
        ));
    }

    #[test]
    fn test_sentinel_rows() {
        let row = PublicationRow::sentinel("1234-5678", QueryMode::JournalCode, Sentinel::FetchFailed);
        assert!(row.is_sentinel());
        assert_eq!(row.issn, "1234-5678");

        let row = PublicationRow::sentinel("pub.42", QueryMode::EntityId, Sentinel::ResourceNotFound);
        assert_eq!(row.id, "pub.42");
        assert_eq!(row.title, "Resource Not Found");
    }

    #[test]
    fn test_decode_row_checks_width() {
        let fields = vec![field("id", "STRING", None, vec![])];
        let row = TableRow {
            f: vec![TableCell { v: json!("pub.1") }, TableCell { v: json!("extra") }],
        };
        assert!(matches!(decode_row(&row, &fields), Err(FetchError::Malformed(_))));
    }
}
