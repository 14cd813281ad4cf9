//! Console and per-run file logging.

use crate::error::Result;
use chrono::Local;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// `<log_dir>/<YYYYmmdd_HHMMSS>_<job>.log`
pub fn log_file_path(log_dir: &Path, job: &str) -> PathBuf {
    log_dir.join(format!("{}_{}.log", Local::now().format("%Y%m%d_%H%M%S"), job))
}

/// Install the global subscriber. `RUST_LOG` overrides the level chosen by `debug`.
///
/// Returns the path of the log file for this run.
pub fn init_logging(debug: bool, log_dir: &Path, job: &str) -> Result<PathBuf> {
    let level = if debug { Level::DEBUG } else { Level::INFO };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.to_string()));

    std::fs::create_dir_all(log_dir)?;
    let path = log_file_path(log_dir, job);
    let file = Arc::new(File::create(&path)?);

    let console = fmt::layer().with_target(true).with_thread_ids(false);
    let file_layer = fmt::layer().with_ansi(false).with_target(false).with_writer(file);

    // a second init (tests, repeated calls) keeps the first subscriber
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(console)
        .with(file_layer)
        .try_init();
    Ok(path)
}
