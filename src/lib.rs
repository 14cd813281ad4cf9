//! # rustbibfetch
//!
//! Bounded batch fetcher for bibliometric data. Identifier lists (ISSNs or
//! publication ids) are split into chunks, each chunk is fetched from the
//! analytics warehouse or the Scopus API under a rotating pool of keys, and
//! the rows are appended to one CSV per job.
//!
//! ## Modules
//!
//! - [`executor`] - Chunked fetch loop with retry, sentinels and resume
//! - [`credentials`] - Key files and the rotation cursor
//! - [`analytics`] - Warehouse (BigQuery REST) publications client
//! - [`scopus`] - Scopus search and serial title client
//! - [`normalize`] - Parsing of nested list and record cells
//! - [`coverage`] - Input vs result overlap report
//! - [`error`] - Custom error types
//!
//! ## Usage
//!
//! ```rust,no_run
//! use rustbibfetch::analytics::{PublicationSource, QueryMode, WarehouseClient, WarehouseConfig};
//! use rustbibfetch::config::{RateLimitConfig, RetryPolicy};
//! use rustbibfetch::credentials::{KeySession, KeyStore, WAREHOUSE_KEY_PREFIX};
//! use rustbibfetch::executor::ChunkedExecutor;
//! use rustbibfetch::rate_limit::CallLimiter;
//! use std::path::Path;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let session = KeySession::from_store(&KeyStore::new("keys", WAREHOUSE_KEY_PREFIX))?;
//!     let limiter = CallLimiter::new(RateLimitConfig::WAREHOUSE);
//!     let client = WarehouseClient::new(WarehouseConfig::new("my-project"))?;
//!     let source = PublicationSource::new(client, QueryMode::JournalCode);
//!     let issns = vec!["1111-2222".to_string()];
//!     let summary = ChunkedExecutor::new(&session, &limiter, RetryPolicy::default())
//!         .run(&source, &issns, 4000, Path::new("pubs.csv"), false)
//!         .await?;
//!     println!("{} rows", summary.rows_written);
//!     Ok(())
//! }
//! ```

pub mod accumulator;
pub mod analytics;
pub mod checkpoint;
pub mod chunker;
pub mod config;
pub mod coverage;
pub mod credentials;
pub mod crosswalk;
pub mod error;
pub mod executor;
pub mod input;
pub mod logging;
pub mod normalize;
pub mod rate_limit;
pub mod scopus;

pub use error::{FetchError, Result};
