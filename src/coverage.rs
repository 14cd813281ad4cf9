//! Coverage of an input ISSN list by the publications returned for it.

use crate::analytics::PublicationRow;
use crate::crosswalk::Crosswalk;
use std::collections::HashSet;
use std::fmt;

/// Overlap between requested ISSNs and the ISSNs seen in returned rows
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CoverageReport {
    pub input_total: usize,
    pub input_unique: usize,
    /// Rows in the result file, duplicates and placeholders included
    pub returned_rows: usize,
    /// Distinct publications after dropping duplicates and placeholders
    pub unique_publications: usize,
    /// Placeholder rows for identifiers that could not be fetched
    pub sentinel_rows: usize,
    pub unique_issns: usize,
    pub unique_eissns: usize,
    /// Distinct ISSNs across both key fields
    pub matched_keys: usize,
    /// Unique input ISSNs present among the matched keys
    pub matched_inputs: usize,
    pub coverage_pct: f64,
    /// Same measure at ISSN-L level, when a crosswalk was given
    pub linking: Option<LinkingCoverage>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct LinkingCoverage {
    pub input_linking_ids: usize,
    pub matched_linking_ids: usize,
    pub coverage_pct: f64,
}

/// Percentage rounded to two decimals; zero when the denominator is zero
pub fn percentage(part: usize, whole: usize) -> f64 {
    if whole == 0 {
        return 0.0;
    }
    (10_000.0 * part as f64 / whole as f64).round() / 100.0
}

/// Compute coverage of `inputs` by `rows`.
pub fn compute(inputs: &[String], rows: &[PublicationRow], crosswalk: Option<&Crosswalk>) -> CoverageReport {
    let unique_inputs: HashSet<&str> = inputs.iter().map(String::as_str).collect();

    let mut seen_ids: HashSet<&str> = HashSet::new();
    let mut issns: HashSet<&str> = HashSet::new();
    let mut eissns: HashSet<&str> = HashSet::new();
    let mut sentinel_rows = 0;

    for row in rows {
        if row.is_sentinel() {
            sentinel_rows += 1;
            continue;
        }
        if !seen_ids.insert(row.id.as_str()) {
            continue;
        }
        if !row.issn.is_empty() {
            issns.insert(row.issn.as_str());
        }
        if !row.eissn.is_empty() {
            eissns.insert(row.eissn.as_str());
        }
    }

    let matched: HashSet<&str> = issns.union(&eissns).copied().collect();
    let matched_inputs = unique_inputs.iter().filter(|i| matched.contains(*i)).count();

    let linking = crosswalk.map(|walk| {
        let to_linking = |issn: &str| walk.linking(issn).unwrap_or(issn).to_string();
        let input_l: HashSet<String> = unique_inputs.iter().map(|i| to_linking(i)).collect();
        let matched_l: HashSet<String> = matched.iter().map(|m| to_linking(m)).collect();
        let hit = input_l.iter().filter(|l| matched_l.contains(*l)).count();
        LinkingCoverage {
            input_linking_ids: input_l.len(),
            matched_linking_ids: hit,
            coverage_pct: percentage(hit, input_l.len()),
        }
    });

    CoverageReport {
        input_total: inputs.len(),
        input_unique: unique_inputs.len(),
        returned_rows: rows.len(),
        unique_publications: seen_ids.len(),
        sentinel_rows,
        unique_issns: issns.len(),
        unique_eissns: eissns.len(),
        matched_keys: matched.len(),
        matched_inputs,
        coverage_pct: percentage(matched_inputs, unique_inputs.len()),
        linking,
    }
}

impl fmt::Display for CoverageReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Input ISSNs:                      {}", self.input_total)?;
        writeln!(f, "Unique input ISSNs:               {}", self.input_unique)?;
        writeln!(f, "Rows returned:                    {}", self.returned_rows)?;
        writeln!(f, "Unique publications:              {}", self.unique_publications)?;
        writeln!(f, "Placeholder rows:                 {}", self.sentinel_rows)?;
        writeln!(f, "Unique issns returned:            {}", self.unique_issns)?;
        writeln!(f, "Unique eissns returned:           {}", self.unique_eissns)?;
        writeln!(f, "Unique issn+eissns:               {}", self.matched_keys)?;
        writeln!(f, "Input ISSNs found:                {}", self.matched_inputs)?;
        write!(f, "Coverage:                         {:.2}%", self.coverage_pct)?;
        if let Some(l) = &self.linking {
            writeln!(f)?;
            write!(
                f,
                "ISSN-L coverage:                  {:.2}% ({} of {})",
                l.coverage_pct, l.matched_linking_ids, l.input_linking_ids
            )?;
        }
        Ok(())
    }
}
