//! ISSN ↔ ISSN-L crosswalk.
//!
//! Built from the two tab-delimited tables published by the ISSN centre:
//! one maps each ISSN to its linking ISSN (ISSN-L), the other lists, for each
//! ISSN-L, every ISSN it groups.

use crate::config::require_file;
use crate::error::Result;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use tracing::info;

#[derive(Debug, Default)]
pub struct Crosswalk {
    to_linking: HashMap<String, String>,
    members: HashMap<String, Vec<String>>,
}

impl Crosswalk {
    /// Load both tables. Each has a header row that is skipped.
    pub fn load(issn_to_issnl: &Path, issnl_to_issns: &Path) -> Result<Self> {
        require_file(issn_to_issnl)?;
        require_file(issnl_to_issns)?;
        let mut walk = Crosswalk::default();

        for record in tsv_reader(issn_to_issnl)?.records() {
            let record = record?;
            if let (Some(issn), Some(linking)) = (record.get(0), record.get(1)) {
                walk.insert_link(issn.trim(), linking.trim());
            }
        }

        for record in tsv_reader(issnl_to_issns)?.records() {
            let record = record?;
            let mut fields = record.iter().map(str::trim).filter(|f| !f.is_empty());
            if let Some(linking) = fields.next() {
                for issn in fields {
                    walk.insert_link(issn, linking);
                }
            }
        }

        info!(
            issns = walk.to_linking.len(),
            linking_ids = walk.members.len(),
            "Loaded ISSN-L crosswalk"
        );
        Ok(walk)
    }

    /// Record that `issn` belongs to `linking`
    pub fn insert_link(&mut self, issn: &str, linking: &str) {
        if issn.is_empty() || linking.is_empty() {
            return;
        }
        self.to_linking.insert(issn.to_string(), linking.to_string());
        let group = self.members.entry(linking.to_string()).or_default();
        if !group.iter().any(|m| m == issn) {
            group.push(issn.to_string());
        }
    }

    /// ISSN-L for an ISSN
    pub fn linking(&self, issn: &str) -> Option<&str> {
        self.to_linking.get(issn).map(String::as_str)
    }

    /// Every ISSN grouped under an ISSN-L
    pub fn members(&self, linking: &str) -> &[String] {
        self.members.get(linking).map(Vec::as_slice).unwrap_or_default()
    }

    /// Add every ISSN that shares a linking id with an input ISSN.
    ///
    /// Inputs come first in their original order, siblings follow; no repeats.
    pub fn expand(&self, issns: &[String]) -> Vec<String> {
        let mut seen: HashSet<&str> = HashSet::new();
        let mut out = Vec::with_capacity(issns.len());
        for issn in issns {
            if seen.insert(issn) {
                out.push(issn.clone());
            }
        }
        for issn in issns {
            if let Some(linking) = self.linking(issn) {
                for sibling in self.members(linking) {
                    if seen.insert(sibling) {
                        out.push(sibling.clone());
                    }
                }
            }
        }
        out
    }

    pub fn len(&self) -> usize {
        self.to_linking.len()
    }

    pub fn is_empty(&self) -> bool {
        self.to_linking.is_empty()
    }
}

fn tsv_reader(path: &Path) -> Result<csv::Reader<std::fs::File>> {
    Ok(csv::ReaderBuilder::new()
        .delimiter(b'\t')
        .flexible(true)
        .from_path(path)?)
}
