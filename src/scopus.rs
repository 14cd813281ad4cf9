//! Scopus search and serial title API client.
//!
//! For each ISSN two calls are made: a search to count indexed articles and
//! a serial title lookup for the canonical ISSN, eISSN and title. Failures
//! of the title lookup become marker values in the row, never a missing row.

use crate::credentials::Credential;
use crate::error::{FetchError, Result};
use crate::executor::{BatchSource, Fetched, Sentinel};
use crate::rate_limit::CallLimiter;
use reqwest::header::HeaderMap;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, warn};

/// Elsevier API base URL
pub const DEFAULT_API_BASE: &str = "https://api.elsevier.com/content";

/// Header carrying the remaining call quota for the key
const RATE_LIMIT_REMAINING: &str = "X-RateLimit-Remaining";

const MORE_THAN_ONE: &str = "More than 1 return";

/// One output row per requested ISSN
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SerialCountRow {
    pub raw_issn: String,
    /// Articles indexed for the ISSN; empty when the search gave no count
    pub scopus_count: Option<u64>,
    #[serde(rename = "prism:issn")]
    pub prism_issn: String,
    #[serde(rename = "prism:eIssn")]
    pub prism_eissn: String,
    #[serde(rename = "dc:title")]
    pub dc_title: String,
}

impl SerialCountRow {
    fn with_title_marker(raw_issn: &str, count: Option<u64>, marker: &str) -> Self {
        Self {
            raw_issn: raw_issn.to_string(),
            scopus_count: count,
            prism_issn: marker.to_string(),
            prism_eissn: marker.to_string(),
            dc_title: marker.to_string(),
        }
    }
}

/// Scopus REST client
pub struct ScopusClient {
    client: Client,
    base_url: String,
}

impl ScopusClient {
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .user_agent("rustbibfetch/0.1")
            .build()
            .map_err(|e| FetchError::Config(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    /// Look up one ISSN. Returns the row and whether the key's quota is now spent.
    pub async fn lookup(
        &self,
        issn: &str,
        credential: &Credential,
        limiter: &CallLimiter,
    ) -> Result<(SerialCountRow, bool)> {
        let encoded = urlencoding::encode(issn);
        let search_url = format!("{}/search/scopus?query=issn({})", self.base_url, encoded);
        let title_url = format!("{}/serial/title/issn/{}", self.base_url, encoded);

        let (search_status, search_headers, search_body) = self.get(&search_url, credential, limiter).await?;
        check_status(search_status, &search_body, credential)?;
        let count = parse_search_count(&search_body);

        let (title_status, title_headers, title_body) = self.get(&title_url, credential, limiter).await?;
        if title_status == StatusCode::TOO_MANY_REQUESTS || title_status.is_server_error() {
            check_status(title_status, &title_body, credential)?;
        }
        let row = parse_title(issn, count, &title_body);

        let spent = quota_spent(&search_headers) || quota_spent(&title_headers);
        debug!(issn = issn, count = ?row.scopus_count, spent, "Scopus lookup");
        Ok((row, spent))
    }

    async fn get(
        &self,
        url: &str,
        credential: &Credential,
        limiter: &CallLimiter,
    ) -> Result<(StatusCode, HeaderMap, String)> {
        limiter.acquire(1).await;
        let response = self
            .client
            .get(url)
            .header("Accept", "application/json")
            .header("X-ELS-APIKey", credential.secret())
            .send()
            .await?;
        let status = response.status();
        let headers = response.headers().clone();
        let body = response.text().await?;
        Ok((status, headers, body))
    }
}

/// Errors that stop the lookup; 404 and structured service errors are left
/// for the title parser to turn into markers.
fn check_status(status: StatusCode, body: &str, credential: &Credential) -> Result<()> {
    if status.is_success() || status == StatusCode::NOT_FOUND {
        return Ok(());
    }
    if status == StatusCode::TOO_MANY_REQUESTS {
        return Err(FetchError::QuotaExhausted {
            key_index: credential.index(),
        });
    }
    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        warn!(key = credential.index(), status = status.as_u16(), "Scopus rejected key, treating as spent");
        return Err(FetchError::QuotaExhausted {
            key_index: credential.index(),
        });
    }
    Err(FetchError::Transient {
        status: status.as_u16(),
        message: body.chars().take(200).collect(),
    })
}

/// `X-RateLimit-Remaining: 0` on any response
fn quota_spent(headers: &HeaderMap) -> bool {
    headers
        .get(RATE_LIMIT_REMAINING)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<i64>().ok())
        .is_some_and(|remaining| remaining <= 0)
}

/// `search-results.opensearch:totalResults`, which the API sends as a string
fn parse_search_count(body: &str) -> Option<u64> {
    let json: Value = serde_json::from_str(body).ok()?;
    let total = json.get("search-results")?.get("opensearch:totalResults")?;
    match total {
        Value::String(s) => s.trim().parse().ok(),
        Value::Number(n) => n.as_u64(),
        _ => None,
    }
}

/// Build the row from the serial title response
fn parse_title(issn: &str, count: Option<u64>, body: &str) -> SerialCountRow {
    let json: Value = match serde_json::from_str(body) {
        Ok(v) => v,
        Err(e) => {
            warn!(issn = issn, error = %e, "Unparseable serial title response");
            return SerialCountRow::with_title_marker(issn, count, Sentinel::MalformedResponse.marker());
        }
    };

    if let Some(service_error) = json.get("service-error") {
        let code = service_error
            .get("status")
            .and_then(|s| s.get("statusCode"))
            .and_then(Value::as_str)
            .unwrap_or_default();
        let sentinel = if code == "RESOURCE_NOT_FOUND" {
            Sentinel::ResourceNotFound
        } else {
            warn!(issn = issn, code = code, "Scopus service error");
            Sentinel::OtherServiceError
        };
        return SerialCountRow::with_title_marker(issn, count, sentinel.marker());
    }

    let entries = match json
        .get("serial-metadata-response")
        .and_then(|r| r.get("entry"))
        .and_then(Value::as_array)
    {
        Some(entries) => entries,
        None => {
            warn!(issn = issn, "Serial title response without entries");
            return SerialCountRow::with_title_marker(issn, count, Sentinel::MalformedResponse.marker());
        }
    };

    match entries.as_slice() {
        [entry] => {
            let field = |key: &str| {
                entry
                    .get(key)
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .unwrap_or_else(|| format!("No {} data", key))
            };
            SerialCountRow {
                raw_issn: issn.to_string(),
                scopus_count: count,
                prism_issn: field("prism:issn"),
                prism_eissn: field("prism:eIssn"),
                dc_title: field("dc:title"),
            }
        }
        _ => SerialCountRow::with_title_marker(issn, count, MORE_THAN_ONE),
    }
}

/// Scopus lookups as a [`BatchSource`]; each identifier costs two calls.
///
/// When a key runs dry partway through a batch, the rows looked up so far are
/// held until the batch is retried on the next key, so only the remaining
/// identifiers are fetched again.
pub struct SerialCountSource {
    client: ScopusClient,
    carried: Mutex<HashMap<String, SerialCountRow>>,
}

impl SerialCountSource {
    pub fn new(client: ScopusClient) -> Self {
        Self {
            client,
            carried: Mutex::new(HashMap::new()),
        }
    }

    fn take_carried(&self) -> HashMap<String, SerialCountRow> {
        self.carried.lock().map(|mut c| std::mem::take(&mut *c)).unwrap_or_default()
    }

    fn carry(&self, rows: HashMap<String, SerialCountRow>) {
        if let Ok(mut carried) = self.carried.lock() {
            *carried = rows;
        }
    }
}

impl BatchSource for SerialCountSource {
    type Row = SerialCountRow;

    fn name(&self) -> &str {
        "serials"
    }

    async fn fetch(
        &self,
        batch: &[String],
        credential: &Credential,
        limiter: &CallLimiter,
    ) -> Result<Fetched<SerialCountRow>> {
        let mut done = self.take_carried();
        let mut spent = false;
        for (idx, issn) in batch.iter().enumerate() {
            if done.contains_key(issn) {
                continue;
            }
            let (row, quota_spent) = match self.client.lookup(issn, credential, limiter).await {
                Ok(found) => found,
                Err(e) => {
                    // the executor retries this same batch unless it gives up on it
                    self.carry(done);
                    return Err(e);
                }
            };
            done.insert(issn.clone(), row);
            let pending = batch[idx + 1..].iter().filter(|i| !done.contains_key(*i)).count();
            if quota_spent && pending > 0 {
                debug!(kept = done.len(), remaining = pending, "Key spent mid-batch");
                self.carry(done);
                return Err(FetchError::QuotaExhausted {
                    key_index: credential.index(),
                });
            }
            spent |= quota_spent;
        }
        let rows = batch.iter().filter_map(|issn| done.get(issn).cloned()).collect();
        Ok(Fetched {
            rows,
            quota_spent: spent,
        })
    }

    fn sentinel_rows(&self, batch: &[String], sentinel: Sentinel) -> Vec<SerialCountRow> {
        batch
            .iter()
            .map(|issn| SerialCountRow::with_title_marker(issn, None, sentinel.marker()))
            .collect()
    }
}
