//! Parsing of nested fields stored as text in accumulator files.
//!
//! Two encodings appear in warehouse output:
//!
//! - id lists: `['pub.1' 'pub.2']`, possibly wrapped over several lines
//! - record lists: one dict-like fragment per line,
//!   `{'id': 'pub.3', 'year': 2019}`
//!
//! Both decode to a deduplicated set of ids.

use crate::error::{FetchError, Result};
use regex::Regex;
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::OnceLock;
use tracing::{debug, info, warn};

/// Parse an id-list string into a set, dropping empty tokens.
pub fn parse_id_list(text: &str) -> BTreeSet<String> {
    text.split(|c: char| c.is_whitespace() || c == '[' || c == ']' || c == ',')
        .map(|token| token.trim_matches(|c| c == '\'' || c == '"'))
        .filter(|token| !token.is_empty())
        .map(str::to_string)
        .collect()
}

/// Serialize a set back into the id-list encoding (sorted).
pub fn format_id_list<'a>(ids: impl IntoIterator<Item = &'a String>) -> String {
    let quoted: Vec<String> = ids.into_iter().map(|id| format!("'{}'", id)).collect();
    format!("[{}]", quoted.join(" "))
}

/// Outcome of parsing a record list: the ids found plus one error per bad fragment
#[derive(Debug, Default)]
pub struct RecordIds {
    pub ids: BTreeSet<String>,
    pub errors: Vec<FetchError>,
}

/// Extract the `id` of every dict-like fragment in a newline-delimited record list.
///
/// Fragments without a balanced `{...}` or without an `id` key are reported in
/// [`RecordIds::errors`]; the remaining fragments are still parsed.
pub fn parse_record_ids(text: &str) -> RecordIds {
    let mut out = RecordIds::default();
    for line in text.lines().map(str::trim).filter(|l| !l.is_empty()) {
        match record_id(line) {
            Ok(id) => {
                out.ids.insert(id);
            }
            Err(e) => out.errors.push(e),
        }
    }
    out
}

fn id_key_regex() -> Result<&'static Regex> {
    static ID_KEY: OnceLock<std::result::Result<Regex, regex::Error>> = OnceLock::new();
    ID_KEY
        .get_or_init(|| Regex::new(r#"['"]id['"]\s*:\s*['"]([^'"]*)['"]"#))
        .as_ref()
        .map_err(|e| FetchError::Parse(e.to_string()))
}

/// Pull the `id` value out of one dict-like fragment
fn record_id(fragment: &str) -> Result<String> {
    let body = first_balanced_braces(fragment)
        .ok_or_else(|| FetchError::Parse(format!("No balanced braces in '{}'", truncate(fragment))))?;
    id_key_regex()?
        .captures(body)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
        .filter(|id| !id.is_empty())
        .ok_or_else(|| FetchError::Parse(format!("No 'id' key in '{}'", truncate(fragment))))
}

/// The first `{...}` span whose braces balance, ignoring braces inside quotes.
///
/// Inside a quoted string a backslash escapes the next character, so `\'`
/// does not end a single-quoted value.
fn first_balanced_braces(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let mut depth = 0usize;
    let mut quote: Option<char> = None;
    let mut escaped = false;
    for (offset, c) in text[start..].char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match (quote, c) {
            (Some(_), '\\') => escaped = true,
            (Some(q), c) if c == q => quote = None,
            (Some(_), _) => {}
            (None, '\'' | '"') => quote = Some(c),
            (None, '{') => depth += 1,
            (None, '}') => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..start + offset + c.len_utf8()]);
                }
            }
            _ => {}
        }
    }
    None
}

fn truncate(s: &str) -> &str {
    match s.char_indices().nth(40) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

/// Which cross-reference column to harvest from a publications file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkKind {
    /// `reference_ids`: works cited by each publication (id-list encoding)
    References,
    /// `citations`: works citing each publication (record-list encoding)
    Citations,
}

impl LinkKind {
    pub fn column(self) -> &'static str {
        match self {
            LinkKind::References => "reference_ids",
            LinkKind::Citations => "citations",
        }
    }
}

/// Totals from harvesting a publications file
#[derive(Debug, Default)]
pub struct Harvest {
    pub ids: BTreeSet<String>,
    pub rows_read: usize,
    pub parse_errors: usize,
}

/// Collect the union of linked publication ids from a publications accumulator.
///
/// Bad fragments are logged and counted; they never stop the harvest.
pub fn harvest_links(path: &Path, kind: LinkKind) -> Result<Harvest> {
    let mut reader = csv::Reader::from_path(path)?;
    let headers = reader.headers()?.clone();
    let column = headers
        .iter()
        .position(|h| h == kind.column())
        .ok_or_else(|| FetchError::Config(format!("Column '{}' missing in {}", kind.column(), path.display())))?;

    let mut harvest = Harvest::default();
    for (row_idx, record) in reader.records().enumerate() {
        let record = record?;
        harvest.rows_read += 1;
        let cell = record.get(column).unwrap_or_default();
        match kind {
            LinkKind::References => harvest.ids.extend(parse_id_list(cell)),
            LinkKind::Citations => {
                let parsed = parse_record_ids(cell);
                for e in &parsed.errors {
                    debug!(row = row_idx, error = %e, "Skipping citation fragment");
                }
                if !parsed.errors.is_empty() {
                    warn!(row = row_idx, bad = parsed.errors.len(), "Unparseable citation fragments");
                }
                harvest.parse_errors += parsed.errors.len();
                harvest.ids.extend(parsed.ids);
            }
        }
    }

    info!(
        kind = kind.column(),
        rows = harvest.rows_read,
        ids = harvest.ids.len(),
        parse_errors = harvest.parse_errors,
        "Harvested linked publication ids"
    );
    Ok(harvest)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_id_list_example() {
        let ids = parse_id_list("['123' '456' '']");
        assert_eq!(ids, BTreeSet::from(["123".to_string(), "456".to_string()]));
    }

    #[test]
    fn test_parse_id_list_multiline_and_duplicates() {
        let ids = parse_id_list("['pub.1' 'pub.2'\n 'pub.1' 'pub.3']");
        assert_eq!(ids.len(), 3);
        assert!(ids.contains("pub.3"));
    }

    #[test]
    fn test_parse_id_list_empty() {
        assert!(parse_id_list("").is_empty());
        assert!(parse_id_list("[]").is_empty());
    }

    #[test]
    fn test_id_list_idempotent() {
        let first = parse_id_list("['b' 'a'\n'c' 'a' '']");
        let again = parse_id_list(&format_id_list(&first));
        assert_eq!(first, again);
        assert_eq!(format_id_list(&first), "['a' 'b' 'c']");
    }

    #[test]
    fn test_parse_record_ids() {
        let text = "{'id': 'pub.10', 'year': 2019}\n{'id': 'pub.11', 'year': 2020}\n{'id': 'pub.10', 'year': 2019}";
        let parsed = parse_record_ids(text);
        assert!(parsed.errors.is_empty());
        assert_eq!(parsed.ids, BTreeSet::from(["pub.10".to_string(), "pub.11".to_string()]));
    }

    #[test]
    fn test_parse_record_ids_reports_bad_fragment() {
        let text = "{'id': 'pub.1'}\nnot a record\n{'year': 2020}\n{'id': 'pub.2'";
        let parsed = parse_record_ids(text);
        assert_eq!(parsed.ids, BTreeSet::from(["pub.1".to_string()]));
        assert_eq!(parsed.errors.len(), 3);
        assert!(parsed.errors.iter().all(|e| matches!(e, FetchError::Parse(_))));
    }

    #[test]
    fn test_nested_braces_and_quoted_braces() {
        let parsed = parse_record_ids("{'id': 'pub.7', 'meta': {'note': 'a } b'}}");
        assert_eq!(parsed.ids, BTreeSet::from(["pub.7".to_string()]));
    }

    #[test]
    fn test_escaped_apostrophe_in_value() {
        let parsed = parse_record_ids(
            "{'id': 'pub.1', 'title': 'O\\'Brien law'}\n{'id': 'pub.2', 'title': 'a \\\\ b', 'x': '}'}",
        );
        assert!(parsed.errors.is_empty());
        assert_eq!(
            parsed.ids,
            BTreeSet::from(["pub.1".to_string(), "pub.2".to_string()])
        );
    }

    #[test]
    fn test_parse_record_ids_empty() {
        let parsed = parse_record_ids("");
        assert!(parsed.ids.is_empty());
        assert!(parsed.errors.is_empty());
    }

    #[test]
    fn test_harvest_links() -> Result<()> {
        let file = tempfile::NamedTempFile::new()?;
        std::fs::write(
            file.path(),
            "id,reference_ids,citations\n\
             pub.1,['pub.5' 'pub.6'],{'id': 'pub.9'}\n\
             pub.2,['pub.6'],\"{'id': 'pub.8'}\nbroken\"\n",
        )?;
        let refs = harvest_links(file.path(), LinkKind::References)?;
        assert_eq!(refs.rows_read, 2);
        assert_eq!(refs.ids.len(), 2);

        let cites = harvest_links(file.path(), LinkKind::Citations)?;
        assert_eq!(cites.ids, BTreeSet::from(["pub.8".to_string(), "pub.9".to_string()]));
        assert_eq!(cites.parse_errors, 1);
        Ok(())
    }
}
