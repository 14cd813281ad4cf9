//! rustbibfetch - bounded batch fetcher for bibliometric data
//!
//! ## Usage
//!
//! ```bash
//! rustbibfetch --year 2021 publications --project my-billing-project
//! rustbibfetch --year 2021 links --kind references
//! rustbibfetch --year 2021 serials
//! rustbibfetch --year 2021 coverage --results data/raw/from_dimensions/2021/pubs_from_all_issns.csv
//! ```

use anyhow::{Context, Result};
use chrono::Datelike;
use clap::{Parser, Subcommand, ValueEnum};
use rustbibfetch::accumulator::CsvAccumulator;
use rustbibfetch::analytics::{self, PublicationRow, PublicationSource, QueryMode, WarehouseClient, WarehouseConfig};
use rustbibfetch::chunker::{self, DEFAULT_ENTITY_CHUNK, DEFAULT_JOURNAL_CHUNK};
use rustbibfetch::config::{parse_endpoint, OutputLayout, RateLimitConfig, RetryPolicy};
use rustbibfetch::coverage::{self, CoverageReport};
use rustbibfetch::credentials::{KeySession, KeyStore, SCOPUS_KEY_PREFIX, WAREHOUSE_KEY_PREFIX};
use rustbibfetch::crosswalk::Crosswalk;
use rustbibfetch::executor::{BatchSource, ChunkedExecutor, RunSummary};
use rustbibfetch::input::{dedup_preserving_order, load_identifiers};
use rustbibfetch::normalize::{harvest_links, LinkKind};
use rustbibfetch::rate_limit::CallLimiter;
use rustbibfetch::scopus::{self, ScopusClient, SerialCountSource};
use rustbibfetch::logging;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{error, info};

// ============================================================================
// CLI Definition
// ============================================================================

/// Chunked publication and serial fetcher with key rotation
#[derive(Parser)]
#[command(name = "rustbibfetch")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    /// Root of the data tree
    #[arg(long, global = true, default_value = "data")]
    data_dir: PathBuf,

    /// Collection year used in default paths (defaults to the current year)
    #[arg(long, global = true)]
    year: Option<i32>,

    /// Directory for per-run log files
    #[arg(long, global = true, default_value = "logs")]
    log_dir: PathBuf,

    /// Directory searched recursively for key files
    #[arg(long, global = true, env = "BIBFETCH_KEYS_DIR", default_value = "keys")]
    keys_dir: PathBuf,

    /// Discard any previous output and checkpoint instead of resuming
    #[arg(long, global = true)]
    fresh: bool,

    /// Retries for a batch after timeouts and server errors
    #[arg(long, global = true, default_value = "3")]
    max_retries: u32,

    /// Seconds to wait between those retries
    #[arg(long, global = true, default_value = "5")]
    backoff_secs: u64,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Fetch every article published in the input journals
    Publications {
        #[command(flatten)]
        input: InputArgs,

        /// Output CSV (default: <data-dir>/raw/from_dimensions/<year>/pubs_from_all_issns.csv)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// ISSNs per query
        #[arg(long, default_value_t = DEFAULT_JOURNAL_CHUNK as i64)]
        chunk_size: i64,

        #[command(flatten)]
        warehouse: WarehouseArgs,

        /// Add every ISSN sharing an ISSN-L with an input ISSN
        #[arg(long, requires_all = ["issn_to_issnl", "issnl_to_issns"])]
        expand_issnl: bool,

        #[command(flatten)]
        crosswalk: CrosswalkArgs,
    },

    /// Fetch the publications referenced by or citing a previous publications output
    Links {
        /// Publications CSV to harvest ids from (default: the publications job output)
        #[arg(long)]
        from: Option<PathBuf>,

        /// Which column to harvest
        #[arg(long, value_enum, default_value = "references")]
        kind: LinkArg,

        /// Output CSV (default: pubs_from_<column>.csv next to the publications output)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Publication ids per query
        #[arg(long, default_value_t = DEFAULT_ENTITY_CHUNK as i64)]
        chunk_size: i64,

        #[command(flatten)]
        warehouse: WarehouseArgs,
    },

    /// Count Scopus articles and look up serial titles, one row per ISSN
    Serials {
        #[command(flatten)]
        input: InputArgs,

        /// Output CSV (default: <data-dir>/scopus_counts/<year>/scopus_counts_<year>.csv)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Scopus API base URL
        #[arg(long, env = "SCOPUS_ENDPOINT", default_value = scopus::DEFAULT_API_BASE)]
        endpoint: String,

        /// Calls per second across all keys
        #[arg(long, default_value = "8")]
        rate: u32,
    },

    /// Report how much of the input list a publications output covers
    Coverage {
        #[command(flatten)]
        input: InputArgs,

        /// Publications CSV (default: the publications job output)
        #[arg(long)]
        results: Option<PathBuf>,

        #[command(flatten)]
        crosswalk: CrosswalkArgs,
    },
}

#[derive(clap::Args)]
struct InputArgs {
    /// Identifier list (default: <data-dir>/raw/issn_inputs/<year>/full_ojs_issn_list_<year>.csv)
    #[arg(short, long)]
    input: Option<PathBuf>,

    /// Column holding the identifiers
    #[arg(long, default_value = "issn_ojs")]
    column: String,

    /// Field delimiter of the input file
    #[arg(long, default_value = ",")]
    delimiter: char,
}

#[derive(clap::Args)]
struct WarehouseArgs {
    /// Billing project for warehouse queries
    #[arg(long, env = "BIBFETCH_PROJECT")]
    project: String,

    /// Warehouse REST base URL
    #[arg(long, env = "WAREHOUSE_ENDPOINT", default_value = analytics::DEFAULT_API_BASE)]
    endpoint: String,

    /// Publications table
    #[arg(long, default_value = analytics::PUBLICATIONS_TABLE)]
    table: String,
}

#[derive(clap::Args)]
struct CrosswalkArgs {
    /// ISSN to ISSN-L table (tab-delimited)
    #[arg(long)]
    issn_to_issnl: Option<PathBuf>,

    /// ISSN-L to ISSNs table (tab-delimited)
    #[arg(long)]
    issnl_to_issns: Option<PathBuf>,
}

#[derive(Clone, Copy, ValueEnum)]
enum LinkArg {
    References,
    Citations,
}

impl From<LinkArg> for LinkKind {
    fn from(arg: LinkArg) -> Self {
        match arg {
            LinkArg::References => LinkKind::References,
            LinkArg::Citations => LinkKind::Citations,
        }
    }
}

const PUBLICATIONS_FILE: &str = "pubs_from_all_issns.csv";

// ============================================================================
// Main Entry Point
// ============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let job = match &cli.command {
        Commands::Publications { .. } => "publications",
        Commands::Links { .. } => "links",
        Commands::Serials { .. } => "serials",
        Commands::Coverage { .. } => "coverage",
    };
    let log_path = logging::init_logging(cli.debug, &cli.log_dir, job)
        .with_context(|| format!("Failed to set up logging in {}", cli.log_dir.display()))?;
    info!(job = job, log = %log_path.display(), "Starting");

    let result = run(cli).await;
    if let Err(e) = &result {
        error!(job = job, error = %format!("{:#}", e), "Job failed");
    }
    result
}

async fn run(cli: Cli) -> Result<()> {
    let year = cli.year.unwrap_or_else(|| chrono::Local::now().year());
    let layout = OutputLayout::new(&cli.data_dir, year);
    let policy = RetryPolicy {
        max_transient_retries: cli.max_retries,
        backoff: Duration::from_secs(cli.backoff_secs),
    };

    match cli.command {
        Commands::Publications {
            input,
            output,
            chunk_size,
            warehouse,
            expand_issnl,
            crosswalk,
        } => {
            let chunk_size = chunker::validate_chunk_size(chunk_size)?;
            let raw_ids = read_input(&input, &layout)?;
            let walk = load_crosswalk(&crosswalk)?;

            let mut ids = dedup_preserving_order(&raw_ids);
            if expand_issnl {
                if let Some(walk) = &walk {
                    let before = ids.len();
                    ids = walk.expand(&ids);
                    info!(before = before, after = ids.len(), "Expanded input through ISSN-L");
                }
            }

            let output = output.unwrap_or_else(|| layout.warehouse_output(PUBLICATIONS_FILE));
            let source = PublicationSource::new(warehouse_client(&warehouse)?, QueryMode::JournalCode);
            let summary = fetch(
                &source,
                &ids,
                chunk_size,
                &output,
                &cli.keys_dir,
                WAREHOUSE_KEY_PREFIX,
                RateLimitConfig::WAREHOUSE,
                policy,
                cli.fresh,
            )
            .await?;
            print_summary(&summary, &output);

            let report = coverage_of(&raw_ids, &output, walk.as_ref())?;
            println!("\n{}", report);
        }

        Commands::Links {
            from,
            kind,
            output,
            chunk_size,
            warehouse,
        } => {
            let chunk_size = chunker::validate_chunk_size(chunk_size)?;
            let kind = LinkKind::from(kind);
            let from = from.unwrap_or_else(|| layout.warehouse_output(PUBLICATIONS_FILE));
            rustbibfetch::config::require_file(&from)?;
            let harvest = harvest_links(&from, kind)
                .with_context(|| format!("Failed to harvest ids from {}", from.display()))?;
            println!(
                "Harvested {} ids from {} rows ({} unparseable fragments)",
                harvest.ids.len(),
                harvest.rows_read,
                harvest.parse_errors
            );

            let ids: Vec<String> = harvest.ids.into_iter().collect();
            let output = output
                .unwrap_or_else(|| layout.warehouse_output(&format!("pubs_from_{}.csv", kind.column())));
            let source = PublicationSource::new(warehouse_client(&warehouse)?, QueryMode::EntityId);
            let summary = fetch(
                &source,
                &ids,
                chunk_size,
                &output,
                &cli.keys_dir,
                WAREHOUSE_KEY_PREFIX,
                RateLimitConfig::WAREHOUSE,
                policy,
                cli.fresh,
            )
            .await?;
            print_summary(&summary, &output);
        }

        Commands::Serials {
            input,
            output,
            endpoint,
            rate,
        } => {
            let ids = dedup_preserving_order(&read_input(&input, &layout)?);
            let output = output.unwrap_or_else(|| layout.scopus_output(&format!("scopus_counts_{}.csv", year)));
            let client = ScopusClient::new(parse_endpoint(&endpoint)?)?;
            let source = SerialCountSource::new(client);
            let summary = fetch(
                &source,
                &ids,
                1,
                &output,
                &cli.keys_dir,
                SCOPUS_KEY_PREFIX,
                RateLimitConfig::per_second(rate)?,
                policy,
                cli.fresh,
            )
            .await?;
            print_summary(&summary, &output);
        }

        Commands::Coverage {
            input,
            results,
            crosswalk,
        } => {
            let raw_ids = read_input(&input, &layout)?;
            let walk = load_crosswalk(&crosswalk)?;
            let results = results.unwrap_or_else(|| layout.warehouse_output(PUBLICATIONS_FILE));
            rustbibfetch::config::require_file(&results)?;
            let report = coverage_of(&raw_ids, &results, walk.as_ref())?;
            println!("{}", report);
        }
    }

    Ok(())
}

// ============================================================================
// Job Helpers
// ============================================================================

fn read_input(args: &InputArgs, layout: &OutputLayout) -> Result<Vec<String>> {
    let path = args.input.clone().unwrap_or_else(|| layout.issn_input());
    let delimiter = u8::try_from(args.delimiter)
        .with_context(|| format!("Delimiter must be a single-byte character: {:?}", args.delimiter))?;
    let ids = load_identifiers(&path, &args.column, delimiter)
        .with_context(|| format!("Failed to read identifiers from {}", path.display()))?;
    Ok(ids)
}

fn load_crosswalk(args: &CrosswalkArgs) -> Result<Option<Crosswalk>> {
    match (&args.issn_to_issnl, &args.issnl_to_issns) {
        (Some(a), Some(b)) => Ok(Some(Crosswalk::load(a, b).context("Failed to load ISSN-L crosswalk")?)),
        (None, None) => Ok(None),
        _ => anyhow::bail!("--issn-to-issnl and --issnl-to-issns must be given together"),
    }
}

fn warehouse_client(args: &WarehouseArgs) -> Result<WarehouseClient> {
    let mut config = WarehouseConfig::new(args.project.clone());
    config.base_url = parse_endpoint(&args.endpoint)?;
    config.table = args.table.clone();
    Ok(WarehouseClient::new(config)?)
}

#[allow(clippy::too_many_arguments)]
async fn fetch<S: BatchSource>(
    source: &S,
    ids: &[String],
    chunk_size: usize,
    output: &Path,
    keys_dir: &Path,
    key_prefix: &str,
    rate: RateLimitConfig,
    policy: RetryPolicy,
    fresh: bool,
) -> Result<RunSummary> {
    let session = KeySession::from_store(&KeyStore::new(keys_dir, key_prefix))
        .with_context(|| format!("Failed to load keys from {}", keys_dir.display()))?;
    let limiter = CallLimiter::new(rate);
    let summary = ChunkedExecutor::new(&session, &limiter, policy)
        .run(source, ids, chunk_size, output, fresh)
        .await
        .with_context(|| format!("{} job stopped; rerun to resume from {}", source.name(), output.display()))?;
    Ok(summary)
}

fn coverage_of(raw_ids: &[String], results: &Path, walk: Option<&Crosswalk>) -> Result<CoverageReport> {
    let rows: Vec<PublicationRow> = if results.is_file() {
        CsvAccumulator::read_all(results)
            .with_context(|| format!("Failed to read results from {}", results.display()))?
    } else {
        Vec::new()
    };
    let report = coverage::compute(raw_ids, &rows, walk);
    info!(
        inputs = report.input_unique,
        matched = report.matched_inputs,
        coverage_pct = report.coverage_pct,
        sentinel_rows = report.sentinel_rows,
        "Coverage"
    );
    Ok(report)
}

fn print_summary(summary: &RunSummary, output: &Path) {
    if summary.already_complete {
        println!("Already complete: {:?}", output);
        return;
    }
    println!(
        "Saved: {:?} ({} rows, {} of {} batches run, {} skipped, {} failed, {} key rotations)",
        output,
        summary.rows_written,
        summary.batches_run,
        summary.batches_total,
        summary.batches_skipped,
        summary.batches_failed,
        summary.rotations
    );
}
