//! Append-only CSV accumulator.
//!
//! Each batch's rows are appended and synced before the executor moves on,
//! so a crash loses at most the batch in flight. The header goes out with the
//! first write to an empty file and never again.

use crate::error::{FetchError, Result};
use serde::Serialize;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Growing CSV output file
pub struct CsvAccumulator {
    path: PathBuf,
    header_written: bool,
    rows_appended: usize,
}

impl CsvAccumulator {
    /// Open `path` for appending, creating parent directories as needed.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let header_written = std::fs::metadata(&path).map(|m| m.len() > 0).unwrap_or(false);
        debug!(path = %path.display(), header_written, "Opened accumulator");
        Ok(Self {
            path,
            header_written,
            rows_appended: 0,
        })
    }

    /// Get the output path
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Rows appended through this handle
    pub fn rows_appended(&self) -> usize {
        self.rows_appended
    }

    /// Current size of the file in bytes
    pub fn byte_len(&self) -> Result<u64> {
        match std::fs::metadata(&self.path) {
            Ok(m) => Ok(m.len()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(0),
            Err(e) => Err(e.into()),
        }
    }

    /// Append rows, flush and sync. Returns the file length afterwards.
    pub fn append<T: Serialize>(&mut self, rows: &[T]) -> Result<u64> {
        let file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        let mut wtr = csv::WriterBuilder::new()
            .has_headers(!self.header_written)
            .from_writer(file);

        for row in rows {
            wtr.serialize(row)?;
        }
        wtr.flush()?;
        let file = wtr.into_inner().map_err(|e| FetchError::Io(e.into_error()))?;
        file.sync_data()?;

        if !rows.is_empty() {
            self.header_written = true;
        }
        self.rows_appended += rows.len();
        Ok(file.metadata()?.len())
    }

    /// Cut the file back to `len` bytes, dropping anything written after the
    /// last checkpointed batch.
    pub fn truncate_to(&mut self, len: u64) -> Result<()> {
        let current = self.byte_len()?;
        if current == len {
            return Ok(());
        }
        if current < len {
            return Err(FetchError::Config(format!(
                "{} is shorter ({} bytes) than its checkpoint ({} bytes)",
                self.path.display(),
                current,
                len
            )));
        }
        let file = OpenOptions::new().write(true).open(&self.path)?;
        file.set_len(len)?;
        file.sync_data()?;
        self.header_written = len > 0;
        info!(path = %self.path.display(), from = current, to = len, "Dropped uncommitted rows");
        Ok(())
    }

    /// Read every row back
    pub fn read_all<T: serde::de::DeserializeOwned>(path: &Path) -> Result<Vec<T>> {
        let mut reader = csv::Reader::from_path(path)?;
        let mut rows = Vec::new();
        for row in reader.deserialize() {
            rows.push(row?);
        }
        Ok(rows)
    }
}
