//! Typed run configuration shared by the CLI jobs.

use crate::error::{FetchError, Result};
use std::num::NonZeroU32;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Retry behaviour for one batch.
///
/// Quota rotations are not counted against `max_transient_retries`; they are
/// bounded by the size of the credential pool instead.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// How many times a transiently failed batch is retried before it is
    /// written as sentinel rows
    pub max_transient_retries: u32,
    /// Fixed sleep between transient retries
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_transient_retries: 3,
            backoff: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// Policy with no sleeping, for tests and dry runs
    pub fn immediate(max_transient_retries: u32) -> Self {
        Self {
            max_transient_retries,
            backoff: Duration::ZERO,
        }
    }
}

/// Client-side call rate cap, applied before every external call
#[derive(Debug, Clone, Copy)]
pub struct RateLimitConfig {
    /// Calls allowed per second
    pub per_second: NonZeroU32,
}

impl RateLimitConfig {
    /// Scopus API: 8 requests per second
    pub const SCOPUS: RateLimitConfig = RateLimitConfig {
        per_second: NonZeroU32::MIN.saturating_add(7),
    };

    /// Warehouse queries are large; one per second is plenty
    pub const WAREHOUSE: RateLimitConfig = RateLimitConfig {
        per_second: NonZeroU32::MIN,
    };

    /// Build from a raw CLI value
    pub fn per_second(calls: u32) -> Result<Self> {
        NonZeroU32::new(calls)
            .map(|per_second| Self { per_second })
            .ok_or_else(|| FetchError::Config("Rate limit must be at least 1 call/s".to_string()))
    }
}

/// Directory conventions for inputs and outputs, keyed by year and job.
#[derive(Debug, Clone)]
pub struct OutputLayout {
    /// Root data directory (default `data`)
    pub data_dir: PathBuf,
    /// Collection year
    pub year: i32,
}

impl OutputLayout {
    pub fn new(data_dir: impl Into<PathBuf>, year: i32) -> Self {
        Self {
            data_dir: data_dir.into(),
            year,
        }
    }

    /// `data/raw/issn_inputs/<year>/full_ojs_issn_list_<year>.csv`
    pub fn issn_input(&self) -> PathBuf {
        self.data_dir
            .join("raw")
            .join("issn_inputs")
            .join(self.year.to_string())
            .join(format!("full_ojs_issn_list_{}.csv", self.year))
    }

    /// `data/raw/from_dimensions/<year>/<file_name>`
    pub fn warehouse_output(&self, file_name: &str) -> PathBuf {
        self.data_dir
            .join("raw")
            .join("from_dimensions")
            .join(self.year.to_string())
            .join(file_name)
    }

    /// `data/scopus_counts/<year>/<file_name>`
    pub fn scopus_output(&self, file_name: &str) -> PathBuf {
        self.data_dir
            .join("scopus_counts")
            .join(self.year.to_string())
            .join(file_name)
    }
}

/// Fail early if an input file is missing
pub fn require_file(path: &Path) -> Result<()> {
    if path.is_file() {
        Ok(())
    } else {
        Err(FetchError::Config(format!("Input file not found: {}", path.display())))
    }
}

/// Validate an API base URL and strip any trailing slash
pub fn parse_endpoint(raw: &str) -> Result<String> {
    let url = url::Url::parse(raw)
        .map_err(|e| FetchError::Config(format!("Invalid endpoint '{}': {}", raw, e)))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(FetchError::Config(format!("Endpoint must be http(s): {}", raw)));
    }
    Ok(url.as_str().trim_end_matches('/').to_string())
}
