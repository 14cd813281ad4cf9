//! Per-output record of durably committed batches.
//!
//! Stored next to the accumulator as `<output>.checkpoint.json`. A rerun with
//! the same job fingerprint skips committed batches and cuts the accumulator
//! back to the last committed length first.

use crate::error::{FetchError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Checkpoint {
    /// blake3 over job name, chunk size and identifier list
    pub fingerprint: String,
    pub chunk_size: usize,
    pub total_batches: usize,
    /// Indices of batches whose rows are in the accumulator
    pub committed: BTreeSet<usize>,
    /// Accumulator length right after the last commit
    pub output_bytes: u64,
    pub complete: bool,
    /// RFC 3339 time of the last update
    pub updated_at: String,
}

impl Checkpoint {
    pub fn new(fingerprint: String, chunk_size: usize, total_batches: usize) -> Self {
        Self {
            fingerprint,
            chunk_size,
            total_batches,
            committed: BTreeSet::new(),
            output_bytes: 0,
            complete: total_batches == 0,
            updated_at: chrono::Utc::now().to_rfc3339(),
        }
    }

    /// Sidecar path for an accumulator file
    pub fn path_for(output: &Path) -> PathBuf {
        let mut name = output.as_os_str().to_owned();
        name.push(".checkpoint.json");
        PathBuf::from(name)
    }

    /// Load a checkpoint if one exists
    pub fn load(path: &Path) -> Result<Option<Self>> {
        if !path.exists() {
            return Ok(None);
        }
        let content = std::fs::read_to_string(path)?;
        let checkpoint = serde_json::from_str(&content).map_err(|e| {
            FetchError::Config(format!("Unreadable checkpoint {}: {}", path.display(), e))
        })?;
        debug!(path = %path.display(), "Loaded checkpoint");
        Ok(Some(checkpoint))
    }

    /// Write via a `.part` file and rename so a crash never leaves half a checkpoint
    pub fn save(&mut self, path: &Path) -> Result<()> {
        self.updated_at = chrono::Utc::now().to_rfc3339();
        let mut part = path.as_os_str().to_owned();
        part.push(".part");
        let part = PathBuf::from(part);
        std::fs::write(&part, serde_json::to_string_pretty(self)?)?;
        std::fs::rename(&part, path)?;
        Ok(())
    }

    pub fn is_committed(&self, batch: usize) -> bool {
        self.committed.contains(&batch)
    }

    /// Mark a batch as durable at accumulator length `output_bytes`
    pub fn commit(&mut self, batch: usize, output_bytes: u64) {
        self.committed.insert(batch);
        self.output_bytes = output_bytes;
        self.complete = self.committed.len() >= self.total_batches;
    }

    /// Batches still to run
    pub fn pending(&self) -> usize {
        self.total_batches.saturating_sub(self.committed.len())
    }
}

/// Identify a job so a checkpoint is never applied to a different input.
pub fn fingerprint(job: &str, chunk_size: usize, identifiers: &[String]) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(job.as_bytes());
    hasher.update(&[0]);
    hasher.update(&(chunk_size as u64).to_le_bytes());
    for id in identifiers {
        hasher.update(id.as_bytes());
        hasher.update(&[0]);
    }
    hasher.finalize().to_hex().to_string()
}

/// What the executor should do before its first batch
#[derive(Debug)]
pub enum ResumePlan {
    /// A previous run finished this job; nothing to fetch
    AlreadyComplete(Checkpoint),
    /// Continue (or start) from this checkpoint
    Run(Checkpoint),
}

/// Decide how to start given an output path and the job fingerprint.
///
/// An output file with no checkpoint is refused unless `fresh` is set, in
/// which case it is truncated.
pub fn plan_resume(
    output: &Path,
    fingerprint: String,
    chunk_size: usize,
    total_batches: usize,
    fresh: bool,
) -> Result<ResumePlan> {
    let checkpoint_path = Checkpoint::path_for(output);
    let output_len = std::fs::metadata(output).map(|m| m.len()).unwrap_or(0);

    if fresh {
        if output_len > 0 {
            info!(path = %output.display(), "Starting fresh, truncating existing output");
            std::fs::File::create(output)?;
        }
        if checkpoint_path.exists() {
            std::fs::remove_file(&checkpoint_path)?;
        }
        return Ok(ResumePlan::Run(Checkpoint::new(fingerprint, chunk_size, total_batches)));
    }

    match Checkpoint::load(&checkpoint_path)? {
        Some(existing) if existing.fingerprint != fingerprint => Err(FetchError::Config(format!(
            "{} was produced by a different job (input or chunk size changed); use --fresh to overwrite",
            output.display()
        ))),
        Some(existing) if existing.complete => Ok(ResumePlan::AlreadyComplete(existing)),
        Some(existing) => {
            info!(
                committed = existing.committed.len(),
                pending = existing.pending(),
                "Resuming from checkpoint"
            );
            Ok(ResumePlan::Run(existing))
        }
        None if output_len > 0 => Err(FetchError::Config(format!(
            "{} exists without a checkpoint; use --fresh to overwrite",
            output.display()
        ))),
        None => Ok(ResumePlan::Run(Checkpoint::new(fingerprint, chunk_size, total_batches))),
    }
}
