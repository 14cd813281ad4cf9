//! Chunked query executor.
//!
//! Splits an identifier list into batches, fetches each batch from a
//! [`BatchSource`] under the rate limiter with the session's current
//! credential, and appends the rows to the accumulator before moving on.
//!
//! Per batch:
//! - quota exhaustion rotates the credential and retries the same batch
//! - transient failures sleep and retry, up to the policy's budget
//! - permanent failures (and a spent transient budget) become sentinel rows
//! - running out of credentials ends the run with an error

use crate::accumulator::CsvAccumulator;
use crate::checkpoint::{fingerprint, plan_resume, Checkpoint, ResumePlan};
use crate::chunker;
use crate::config::RetryPolicy;
use crate::credentials::{Credential, KeySession};
use crate::error::{ErrorClass, FetchError, Result};
use crate::rate_limit::CallLimiter;
use serde::Serialize;
use std::path::Path;
use tracing::{debug, info, warn};

/// Placeholder written when a value could not be retrieved
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sentinel {
    /// Service says the identifier does not exist
    ResourceNotFound,
    /// Service returned some other structured error
    OtherServiceError,
    /// Service returned something that was not the expected envelope
    MalformedResponse,
    /// Batch still failing after every retry
    FetchFailed,
}

impl Sentinel {
    pub const ALL: [Sentinel; 4] = [
        Sentinel::ResourceNotFound,
        Sentinel::OtherServiceError,
        Sentinel::MalformedResponse,
        Sentinel::FetchFailed,
    ];

    /// Text written into the output cell
    pub fn marker(self) -> &'static str {
        match self {
            Sentinel::ResourceNotFound => "Resource Not Found",
            Sentinel::OtherServiceError => "Other Service Error",
            Sentinel::MalformedResponse => "Malformed Response",
            Sentinel::FetchFailed => "Fetch Failed",
        }
    }

    /// Whether a cell holds one of the markers
    pub fn is_marker(value: &str) -> bool {
        Self::ALL.iter().any(|s| s.marker() == value)
    }

    /// Sentinel for an error the executor gave up on
    pub fn for_error(error: &FetchError) -> Self {
        match error {
            FetchError::NotFound(_) => Sentinel::ResourceNotFound,
            FetchError::Malformed(_) | FetchError::Parse(_) => Sentinel::MalformedResponse,
            FetchError::Rejected { .. } => Sentinel::OtherServiceError,
            _ => Sentinel::FetchFailed,
        }
    }
}

/// Rows returned by one successful fetch
#[derive(Debug)]
pub struct Fetched<R> {
    pub rows: Vec<R>,
    /// Service reported zero remaining quota for the credential just used.
    /// The rows are kept; the next call uses the next credential.
    pub quota_spent: bool,
}

impl<R> Fetched<R> {
    pub fn rows(rows: Vec<R>) -> Self {
        Self {
            rows,
            quota_spent: false,
        }
    }
}

/// One external data source the executor can page through.
#[allow(async_fn_in_trait)]
pub trait BatchSource {
    /// Output row type, one CSV record each
    type Row: Serialize;

    /// Short job name used in logs and the checkpoint fingerprint
    fn name(&self) -> &str;

    /// Fetch a batch with the given credential.
    ///
    /// Every HTTP request the source makes, follow-up pages and polls
    /// included, must await a slot from `limiter` first.
    async fn fetch(
        &self,
        batch: &[String],
        credential: &Credential,
        limiter: &CallLimiter,
    ) -> Result<Fetched<Self::Row>>;

    /// One placeholder row per requested identifier
    fn sentinel_rows(&self, batch: &[String], sentinel: Sentinel) -> Vec<Self::Row>;
}

/// Totals for one run
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RunSummary {
    pub batches_total: usize,
    /// Batches fetched (or sentinel-filled) in this run
    pub batches_run: usize,
    /// Batches skipped because a previous run committed them
    pub batches_skipped: usize,
    /// Batches written as sentinel rows
    pub batches_failed: usize,
    pub rows_written: usize,
    pub rotations: usize,
    /// The checkpoint already marked the job complete; nothing was fetched
    pub already_complete: bool,
}

enum BatchOutcome<R> {
    Fetched(Vec<R>),
    Failed(Vec<R>),
}

/// Runs a [`BatchSource`] over an identifier list
pub struct ChunkedExecutor<'a> {
    session: &'a KeySession,
    limiter: &'a CallLimiter,
    policy: RetryPolicy,
}

impl<'a> ChunkedExecutor<'a> {
    pub fn new(session: &'a KeySession, limiter: &'a CallLimiter, policy: RetryPolicy) -> Self {
        Self {
            session,
            limiter,
            policy,
        }
    }

    /// Fetch every batch of `identifiers` into `output`.
    ///
    /// Resumes from the output's checkpoint when one matches this job; with
    /// `fresh` any previous output is discarded.
    pub async fn run<S: BatchSource>(
        &self,
        source: &S,
        identifiers: &[String],
        chunk_size: usize,
        output: &Path,
        fresh: bool,
    ) -> Result<RunSummary> {
        let batches = chunker::chunk(identifiers, chunk_size)?;
        let mut summary = RunSummary {
            batches_total: batches.len(),
            ..Default::default()
        };

        let checkpoint_path = Checkpoint::path_for(output);
        let job_fp = fingerprint(source.name(), chunk_size, identifiers);
        let mut checkpoint = match plan_resume(output, job_fp, chunk_size, batches.len(), fresh)? {
            ResumePlan::AlreadyComplete(_) => {
                info!(
                    job = source.name(),
                    output = %output.display(),
                    "Output already complete, skipping fetch"
                );
                summary.already_complete = true;
                summary.batches_skipped = batches.len();
                return Ok(summary);
            }
            ResumePlan::Run(checkpoint) => checkpoint,
        };

        let mut accumulator = CsvAccumulator::open(output)?;
        accumulator.truncate_to(checkpoint.output_bytes)?;
        // on disk before the first append, so a crash inside batch 0 resumes too
        checkpoint.save(&checkpoint_path)?;

        info!(
            job = source.name(),
            identifiers = identifiers.len(),
            chunk_size = chunk_size,
            batches = batches.len(),
            keys = self.session.pool_size(),
            "Starting chunked fetch"
        );

        for (batch_idx, batch) in batches.iter().enumerate() {
            if checkpoint.is_committed(batch_idx) {
                summary.batches_skipped += 1;
                continue;
            }

            info!(
                batch = batch_idx + 1,
                total_batches = batches.len(),
                size = batch.len(),
                "Processing batch"
            );

            let rows = match self.fetch_with_retry(source, batch_idx, batch, &mut summary).await? {
                BatchOutcome::Fetched(rows) => rows,
                BatchOutcome::Failed(rows) => {
                    summary.batches_failed += 1;
                    rows
                }
            };

            let output_bytes = accumulator.append(&rows)?;
            checkpoint.commit(batch_idx, output_bytes);
            checkpoint.save(&checkpoint_path)?;

            summary.batches_run += 1;
            summary.rows_written += rows.len();
            info!(batch = batch_idx + 1, rows = rows.len(), "Batch committed");
        }

        if batches.is_empty() {
            warn!(job = source.name(), "No identifiers to fetch");
        }

        info!(
            job = source.name(),
            run = summary.batches_run,
            skipped = summary.batches_skipped,
            failed = summary.batches_failed,
            rows = summary.rows_written,
            rotations = summary.rotations,
            "Chunked fetch complete"
        );
        Ok(summary)
    }

    async fn fetch_with_retry<S: BatchSource>(
        &self,
        source: &S,
        batch_idx: usize,
        batch: &[String],
        summary: &mut RunSummary,
    ) -> Result<BatchOutcome<S::Row>> {
        let mut transient_failures = 0u32;

        loop {
            let credential = self.session.current()?;
            let error = match source.fetch(batch, credential, self.limiter).await {
                Ok(fetched) => {
                    if fetched.quota_spent && self.session.rotate_from(credential.index()) {
                        summary.rotations += 1;
                    }
                    return Ok(BatchOutcome::Fetched(fetched.rows));
                }
                Err(e) => e,
            };

            match error.class() {
                ErrorClass::Quota => {
                    warn!(
                        batch = batch_idx + 1,
                        key = credential.index(),
                        "Quota exhausted, rotating key and retrying batch"
                    );
                    if self.session.rotate_from(credential.index()) {
                        summary.rotations += 1;
                    }
                }
                ErrorClass::Transient => {
                    transient_failures += 1;
                    if transient_failures > self.policy.max_transient_retries {
                        warn!(
                            batch = batch_idx + 1,
                            attempts = transient_failures,
                            error = %error,
                            "Batch failed after retries, writing sentinel rows"
                        );
                        return Ok(BatchOutcome::Failed(
                            source.sentinel_rows(batch, Sentinel::FetchFailed),
                        ));
                    }
                    debug!(
                        batch = batch_idx + 1,
                        attempt = transient_failures,
                        max_retries = self.policy.max_transient_retries,
                        error = %error,
                        "Transient failure, backing off"
                    );
                    tokio::time::sleep(self.policy.backoff).await;
                }
                ErrorClass::Permanent => {
                    let sentinel = Sentinel::for_error(&error);
                    warn!(
                        batch = batch_idx + 1,
                        error = %error,
                        marker = sentinel.marker(),
                        "Permanent failure, writing sentinel rows"
                    );
                    return Ok(BatchOutcome::Failed(source.sentinel_rows(batch, sentinel)));
                }
                ErrorClass::Fatal => return Err(error),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RateLimitConfig;
    use serde::Deserialize;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use tempfile::TempDir;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct TestRow {
        issn: String,
        value: String,
    }

    /// Scripted source: pops one response per call, echoes the batch on success
    struct ScriptedSource {
        script: Mutex<VecDeque<Step>>,
        calls: Mutex<Vec<(Vec<String>, String)>>,
    }

    enum Step {
        Ok,
        OkQuotaSpent,
        Quota,
        Transient,
        NotFound,
    }

    impl ScriptedSource {
        fn new(steps: Vec<Step>) -> Self {
            Self {
                script: Mutex::new(steps.into()),
                calls: Mutex::new(Vec::new()),
            }
        }

        fn keys_used(&self) -> Vec<String> {
            self.calls
                .lock()
                .map(|c| c.iter().map(|(_, k)| k.clone()).collect())
                .unwrap_or_default()
        }
    }

    impl BatchSource for ScriptedSource {
        type Row = TestRow;

        fn name(&self) -> &str {
            "scripted"
        }

        async fn fetch(
            &self,
            batch: &[String],
            credential: &Credential,
            limiter: &CallLimiter,
        ) -> Result<Fetched<TestRow>> {
            limiter.acquire(1).await;
            if let Ok(mut calls) = self.calls.lock() {
                calls.push((batch.to_vec(), credential.secret().to_string()));
            }
            let step = self
                .script
                .lock()
                .ok()
                .and_then(|mut s| s.pop_front())
                .unwrap_or(Step::Ok);
            let rows = batch
                .iter()
                .map(|id| TestRow {
                    issn: id.clone(),
                    value: credential.secret().to_string(),
                })
                .collect();
            match step {
                Step::Ok => Ok(Fetched::rows(rows)),
                Step::OkQuotaSpent => Ok(Fetched {
                    rows,
                    quota_spent: true,
                }),
                Step::Quota => Err(FetchError::QuotaExhausted {
                    key_index: credential.index(),
                }),
                Step::Transient => Err(FetchError::Transient {
                    status: 503,
                    message: "busy".into(),
                }),
                Step::NotFound => Err(FetchError::NotFound("gone".into())),
            }
        }

        fn sentinel_rows(&self, batch: &[String], sentinel: Sentinel) -> Vec<TestRow> {
            batch
                .iter()
                .map(|id| TestRow {
                    issn: id.clone(),
                    value: sentinel.marker().to_string(),
                })
                .collect()
        }
    }

    fn example_ids() -> Vec<String> {
        vec!["1111-2222".into(), "3333-4444".into(), "5555-6666".into()]
    }

    fn limiter() -> CallLimiter {
        CallLimiter::new(RateLimitConfig::per_second(1000).unwrap_or(RateLimitConfig::SCOPUS))
    }

    #[tokio::test]
    async fn test_quota_rotation_retries_same_batch() -> Result<()> {
        let dir = TempDir::new()?;
        let out = dir.path().join("out.csv");
        let session = KeySession::new(vec!["k0".into(), "k1".into(), "k2".into()])?;
        let limiter = limiter();
        let executor = ChunkedExecutor::new(&session, &limiter, RetryPolicy::immediate(2));

        // batch 0 is refused on k0 and retried on k1; batch 1 stays on k1
        let source = ScriptedSource::new(vec![Step::Quota, Step::Ok, Step::Ok]);
        let summary = executor.run(&source, &example_ids(), 2, &out, false).await?;

        let rows: Vec<TestRow> = CsvAccumulator::read_all(&out)?;
        assert_eq!(rows.len(), 3);
        assert_eq!(summary.batches_total, 2);
        assert_eq!(summary.rotations, 1);
        assert_eq!(source.keys_used(), vec!["k0", "k1", "k1"]);
        assert_eq!(rows[0].value, "k1");
        Ok(())
    }

    #[tokio::test]
    async fn test_exhaustion_on_second_key_then_success() -> Result<()> {
        let dir = TempDir::new()?;
        let out = dir.path().join("out.csv");
        let session = KeySession::new(vec!["k0".into(), "k1".into(), "k2".into()])?;
        let limiter = limiter();
        let executor = ChunkedExecutor::new(&session, &limiter, RetryPolicy::immediate(2));

        let source = ScriptedSource::new(vec![Step::OkQuotaSpent, Step::Quota, Step::Ok]);
        executor.run(&source, &example_ids(), 2, &out, false).await?;

        let rows: Vec<TestRow> = CsvAccumulator::read_all(&out)?;
        assert_eq!(rows.len(), 3);
        assert_eq!(source.keys_used(), vec!["k0", "k1", "k2"]);
        Ok(())
    }

    #[tokio::test]
    async fn test_pool_exhaustion_is_fatal() -> Result<()> {
        let dir = TempDir::new()?;
        let out = dir.path().join("out.csv");
        let session = KeySession::new(vec!["k0".into(), "k1".into()])?;
        let limiter = limiter();
        let executor = ChunkedExecutor::new(&session, &limiter, RetryPolicy::immediate(2));

        // two keys each spent after one call; third batch has no key left
        let source = ScriptedSource::new(vec![Step::OkQuotaSpent, Step::OkQuotaSpent]);
        let result = executor.run(&source, &example_ids(), 1, &out, false).await;
        assert!(matches!(result, Err(FetchError::CredentialsExhausted { pool_size: 2 })));

        // the two successful batches are durable
        let rows: Vec<TestRow> = CsvAccumulator::read_all(&out)?;
        assert_eq!(rows.len(), 2);
        Ok(())
    }

    #[tokio::test]
    async fn test_n_keys_n_calls_succeed() -> Result<()> {
        let dir = TempDir::new()?;
        let out = dir.path().join("out.csv");
        let session = KeySession::new(vec!["k0".into(), "k1".into(), "k2".into()])?;
        let limiter = limiter();
        let executor = ChunkedExecutor::new(&session, &limiter, RetryPolicy::immediate(0));

        let source = ScriptedSource::new(vec![
            Step::OkQuotaSpent,
            Step::OkQuotaSpent,
            Step::OkQuotaSpent,
        ]);
        let summary = executor.run(&source, &example_ids(), 1, &out, false).await?;
        assert_eq!(summary.rows_written, 3);
        assert_eq!(summary.rotations, 3);
        assert_eq!(source.keys_used(), vec!["k0", "k1", "k2"]);
        assert!(session.is_exhausted());
        Ok(())
    }

    #[tokio::test]
    async fn test_transient_budget_then_sentinel() -> Result<()> {
        let dir = TempDir::new()?;
        let out = dir.path().join("out.csv");
        let session = KeySession::new(vec!["k0".into()])?;
        let limiter = limiter();
        let executor = ChunkedExecutor::new(&session, &limiter, RetryPolicy::immediate(1));

        // batch 0: fail, retry fails -> sentinel; batch 1: fail once, then ok
        let source = ScriptedSource::new(vec![
            Step::Transient,
            Step::Transient,
            Step::Transient,
            Step::Ok,
        ]);
        let summary = executor.run(&source, &example_ids(), 2, &out, false).await?;

        let rows: Vec<TestRow> = CsvAccumulator::read_all(&out)?;
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0].value, Sentinel::FetchFailed.marker());
        assert_eq!(rows[1].value, Sentinel::FetchFailed.marker());
        assert_eq!(rows[2].value, "k0");
        assert_eq!(summary.batches_failed, 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_permanent_failure_writes_sentinels() -> Result<()> {
        let dir = TempDir::new()?;
        let out = dir.path().join("out.csv");
        let session = KeySession::new(vec!["k0".into()])?;
        let limiter = limiter();
        let executor = ChunkedExecutor::new(&session, &limiter, RetryPolicy::immediate(3));

        let source = ScriptedSource::new(vec![Step::NotFound]);
        executor.run(&source, &example_ids(), 2, &out, false).await?;

        let rows: Vec<TestRow> = CsvAccumulator::read_all(&out)?;
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0].value, "Resource Not Found");
        assert_eq!(rows[2].value, "k0");
        assert_eq!(source.keys_used().len(), 2);
        Ok(())
    }

    #[tokio::test]
    async fn test_resume_skips_committed_batches() -> Result<()> {
        let dir = TempDir::new()?;
        let out = dir.path().join("out.csv");
        let limiter = limiter();

        // first run dies on batch 1 when the only key runs out
        let session = KeySession::new(vec!["k0".into()])?;
        let executor = ChunkedExecutor::new(&session, &limiter, RetryPolicy::immediate(0));
        let source = ScriptedSource::new(vec![Step::Ok, Step::Quota]);
        let first = executor.run(&source, &example_ids(), 2, &out, false).await;
        assert!(first.is_err());

        // simulate a crash after append but before checkpoint
        std::fs::OpenOptions::new()
            .append(true)
            .open(&out)
            .and_then(|mut f| std::io::Write::write_all(&mut f, b"9999-9999,orphan\n"))?;

        let session = KeySession::new(vec!["k1".into()])?;
        let executor = ChunkedExecutor::new(&session, &limiter, RetryPolicy::immediate(0));
        let source = ScriptedSource::new(vec![]);
        let summary = executor.run(&source, &example_ids(), 2, &out, false).await?;
        assert_eq!(summary.batches_skipped, 1);
        assert_eq!(summary.batches_run, 1);

        let rows: Vec<TestRow> = CsvAccumulator::read_all(&out)?;
        let issns: Vec<&str> = rows.iter().map(|r| r.issn.as_str()).collect();
        assert_eq!(issns, vec!["1111-2222", "3333-4444", "5555-6666"]);

        // a third run finds the job complete and calls nothing
        let source = ScriptedSource::new(vec![]);
        let summary = executor.run(&source, &example_ids(), 2, &out, false).await?;
        assert!(summary.already_complete);
        assert!(source.keys_used().is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_crash_in_first_batch_resumes_without_fresh() -> Result<()> {
        let dir = TempDir::new()?;
        let out = dir.path().join("out.csv");
        let limiter = limiter();

        // the only key is refused on batch 0, before anything is committed
        let session = KeySession::new(vec!["k0".into()])?;
        let executor = ChunkedExecutor::new(&session, &limiter, RetryPolicy::immediate(0));
        let source = ScriptedSource::new(vec![Step::Quota]);
        assert!(executor.run(&source, &example_ids(), 2, &out, false).await.is_err());

        let saved = Checkpoint::load(&Checkpoint::path_for(&out))?;
        assert!(saved.is_some_and(|c| c.committed.is_empty() && c.output_bytes == 0));

        // rows appended before the crash have no commit behind them
        std::fs::write(&out, "issn,value\n1111-2222,partial\n")?;

        let session = KeySession::new(vec!["k1".into()])?;
        let executor = ChunkedExecutor::new(&session, &limiter, RetryPolicy::immediate(0));
        let source = ScriptedSource::new(vec![]);
        let summary = executor.run(&source, &example_ids(), 2, &out, false).await?;
        assert_eq!(summary.batches_run, 2);

        let rows: Vec<TestRow> = CsvAccumulator::read_all(&out)?;
        assert_eq!(rows.len(), 3);
        assert!(rows.iter().all(|r| r.value == "k1"));
        Ok(())
    }

    #[tokio::test]
    async fn test_every_fetch_takes_a_limiter_slot() -> Result<()> {
        let dir = TempDir::new()?;
        let out = dir.path().join("out.csv");
        let session = KeySession::new(vec!["k0".into()])?;
        let limiter = CallLimiter::new(RateLimitConfig::per_second(2)?);
        let executor = ChunkedExecutor::new(&session, &limiter, RetryPolicy::immediate(0));

        // three single-id batches at 2/s: the third call waits for a slot
        let start = std::time::Instant::now();
        executor
            .run(&ScriptedSource::new(vec![]), &example_ids(), 1, &out, false)
            .await?;
        assert!(start.elapsed() >= std::time::Duration::from_millis(400));
        Ok(())
    }

    #[test]
    fn test_sentinel_markers() {
        assert!(Sentinel::is_marker("Resource Not Found"));
        assert!(!Sentinel::is_marker("pub.123"));
        assert_eq!(
            Sentinel::for_error(&FetchError::Malformed("x".into())),
            Sentinel::MalformedResponse
        );
    }
}
