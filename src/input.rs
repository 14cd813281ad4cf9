//! Identifier list loading.

use crate::config::require_file;
use crate::error::{FetchError, Result};
use std::collections::HashSet;
use std::path::Path;
use tracing::info;

/// Read one column of a delimited file with a header row.
///
/// Values are trimmed; blank cells are skipped. Order and duplicates are kept.
pub fn load_identifiers(path: &Path, column: &str, delimiter: u8) -> Result<Vec<String>> {
    require_file(path)?;
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(delimiter)
        .flexible(true)
        .from_path(path)?;
    let headers = reader.headers()?.clone();
    let idx = headers.iter().position(|h| h.trim() == column).ok_or_else(|| {
        FetchError::Config(format!(
            "Column '{}' not found in {} (have: {})",
            column,
            path.display(),
            headers.iter().collect::<Vec<_>>().join(", ")
        ))
    })?;

    let mut ids = Vec::new();
    for record in reader.records() {
        let record = record?;
        if let Some(value) = record.get(idx).map(str::trim).filter(|v| !v.is_empty()) {
            ids.push(value.to_string());
        }
    }
    info!(path = %path.display(), column = column, count = ids.len(), "Loaded identifiers");
    Ok(ids)
}

/// Drop repeated identifiers, keeping the first occurrence
pub fn dedup_preserving_order(ids: &[String]) -> Vec<String> {
    let mut seen = HashSet::with_capacity(ids.len());
    ids.iter().filter(|id| seen.insert(id.as_str())).cloned().collect()
}
