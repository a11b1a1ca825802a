//! CLI parsing and job hosting. Loads settings, wires the fetch stack, runs the job,
//! writes EPUB volumes or JSON, and maps errors to exit codes.

use crate::cancel::CancellationToken;
use crate::config::{self, ConfigError, FileConfig, Settings};
use crate::epub::{plan_volumes, slug, write_volumes, EpubError, DEFAULT_CHAPTERS_PER_BOOK};
use crate::fetch::{FetchClient, FetchError, ProxyPool, ReqwestTransport, ThreadSleeper};
use crate::model::{JobStatus, NovelJob};
use crate::orchestrator::{
    JobError, JobOptions, Orchestrator, ProgressEvent, DEFAULT_RETRY_ROUNDS,
};
use crate::source::{
    ChapterIndexResolver, ChapterPlan, DiscoveryMode, HtmlChapterParser, ResolveError,
};
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

/// Worker id used for the cover download, after the job's workers are done.
const COVER_WORKER: usize = 0;

/// CLI error carrying the process exit code.
#[derive(Debug, Error)]
pub enum CliRunError {
    #[error("{0}")]
    InvalidInput(String),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Job(#[from] JobError),

    #[error(transparent)]
    Epub(#[from] EpubError),

    #[error("Failed to write JSON {path}: {message}")]
    Json { path: PathBuf, message: String },

    #[error("Cancelled by user")]
    Cancelled,
}

impl CliRunError {
    pub fn exit_code(&self) -> i32 {
        match self {
            CliRunError::InvalidInput(_) | CliRunError::Config(_) => 1,
            CliRunError::Job(_) => 2,
            CliRunError::Epub(_) | CliRunError::Json { .. } => 3,
            CliRunError::Cancelled => 130,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Epub,
    Json,
}

#[derive(Parser, Debug)]
#[command(name = "novelscrape")]
#[command(about = "Scrape a web novel through rotating proxies and write EPUB volumes")]
#[command(
    after_help = "Settings come from ./novelscrape.toml or ~/.config/novelscrape/config.toml, then environment variables (PRIMARY_PROXY, MIN_PROXY_HEALTH, RETRY_BACKOFF_BASE, ...), then these flags. Press Ctrl-C once to stop and keep what was fetched, twice to cancel."
)]
pub struct Args {
    /// Novel index page URL.
    pub url: String,

    /// Parallel chapter workers. 0 fetches chapters one at a time on the main thread.
    #[arg(short, long)]
    pub workers: Option<usize>,

    /// First chapter number to fetch (1-based).
    #[arg(long, default_value_t = 1, value_parser = clap::value_parser!(u32).range(1..))]
    pub start: u32,

    /// Maximum number of chapters to fetch.
    #[arg(long)]
    pub limit: Option<usize>,

    /// Chapters per EPUB volume (0 writes a single volume; default 500).
    #[arg(long)]
    pub chapters_per_book: Option<usize>,

    /// Directory for output files (overrides config; default current directory).
    #[arg(short, long)]
    pub output_dir: Option<PathBuf>,

    /// Output format: epub or json.
    #[arg(long, default_value = "epub", value_parser = parse_format)]
    pub format: OutputFormat,

    /// Fail the whole job when any chapter fails.
    #[arg(long)]
    pub strict: bool,

    /// Do not download the cover image.
    #[arg(long)]
    pub no_cover: bool,

    /// Route every request through this proxy (overrides PRIMARY_PROXY).
    #[arg(long)]
    pub proxy: Option<String>,

    /// Never fall back to a direct connection when no proxy is healthy.
    #[arg(long)]
    pub no_direct: bool,

    /// Request timeout in seconds (overrides config; default 15).
    #[arg(long)]
    pub timeout: Option<u64>,

    /// Explicit config file instead of the search order.
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Only warnings and errors.
    #[arg(short, long)]
    pub quiet: bool,

    /// Debug logging and full error chains.
    #[arg(short, long)]
    pub verbose: bool,

    /// Resolve the chapter list and print the plan without fetching chapters.
    #[arg(long)]
    pub dry_run: bool,
}

fn parse_format(s: &str) -> Result<OutputFormat, String> {
    match s.to_lowercase().as_str() {
        "epub" => Ok(OutputFormat::Epub),
        "json" => Ok(OutputFormat::Json),
        _ => Err(format!("Invalid --format value: '{}'. Use epub or json.", s)),
    }
}

fn validate_url(url: &str) -> Result<(), CliRunError> {
    match reqwest::Url::parse(url) {
        Ok(u) if matches!(u.scheme(), "http" | "https") && u.host_str().is_some() => Ok(()),
        Ok(u) => Err(CliRunError::InvalidInput(format!(
            "Expected an http(s) novel URL, got scheme '{}': {}",
            u.scheme(),
            url
        ))),
        Err(e) => Err(CliRunError::InvalidInput(format!(
            "Expected a novel URL such as https://example.com/novel/title: {}: {}",
            url, e
        ))),
    }
}

/// Everything the job needs after config file, environment and flags are merged.
#[derive(Debug)]
struct RunPlan {
    settings: Settings,
    options: JobOptions,
    chapters_per_book: usize,
    output_dir: PathBuf,
}

fn build_plan(args: &Args, file: Option<&FileConfig>, settings: Settings) -> RunPlan {
    let mut settings = settings;
    if let Some(ref p) = args.proxy {
        settings.proxy.override_proxy = Some(p.clone());
    }
    if args.no_direct {
        settings.proxy.allow_direct = false;
    }
    if let Some(t) = args.timeout {
        settings.http.timeout = Duration::from_secs(t.max(1));
    }

    let options = JobOptions {
        workers: args.workers.or(file.and_then(|c| c.workers)).unwrap_or(0),
        start: args.start,
        limit: args.limit.filter(|l| *l > 0),
        retry_rounds: file
            .and_then(|c| c.retry_rounds)
            .unwrap_or(DEFAULT_RETRY_ROUNDS),
        strict: args.strict,
        ..JobOptions::default()
    };
    let chapters_per_book = args
        .chapters_per_book
        .or(file.and_then(|c| c.chapters_per_book))
        .unwrap_or(DEFAULT_CHAPTERS_PER_BOOK);
    let output_dir = args
        .output_dir
        .clone()
        .or_else(|| file.and_then(|c| c.output_dir.clone()))
        .unwrap_or_else(|| PathBuf::from("."));

    RunPlan {
        settings,
        options,
        chapters_per_book,
        output_dir,
    }
}

/// First Ctrl-C requests a stop, any later one a cancel.
fn install_interrupt_handler(token: Arc<CancellationToken>) {
    let result = ctrlc::set_handler(move || {
        if token.request_stop() {
            eprintln!("\nStopping after in-flight chapters. Press Ctrl-C again to cancel.");
        } else {
            token.request_cancel();
        }
    });
    if let Err(e) = result {
        warn!(error = %e, "could not install Ctrl-C handler");
    }
}

/// Progress bar fed from orchestrator events; hidden in quiet mode.
struct Progress {
    bar: Option<ProgressBar>,
    quiet: bool,
}

impl Progress {
    fn new(quiet: bool) -> Self {
        Self { bar: None, quiet }
    }

    fn on_event(&mut self, event: &ProgressEvent) {
        if self.quiet {
            return;
        }
        match event {
            ProgressEvent::Planned { total } => {
                let bar = if *total == 0 {
                    ProgressBar::new_spinner()
                } else {
                    ProgressBar::new(*total as u64)
                };
                bar.set_style(
                    ProgressStyle::with_template(
                        "{spinner} {msg} [{bar:40}] {pos}/{len} ({elapsed})",
                    )
                    .unwrap_or_else(|_| ProgressStyle::default_bar())
                    .progress_chars("█▉▊▋▌▍▎▏ "),
                );
                bar.enable_steady_tick(Duration::from_millis(80));
                self.bar = Some(bar);
            }
            ProgressEvent::ChapterDone { index, title } => {
                if let Some(bar) = &self.bar {
                    bar.inc(1);
                    bar.set_message(format!("#{} {}", index, truncate(title, 40)));
                }
            }
            ProgressEvent::ChapterFailed { index, kind } => {
                if let Some(bar) = &self.bar {
                    bar.inc(1);
                    bar.set_message(format!("#{} failed ({:?})", index, kind));
                }
            }
            ProgressEvent::RetryRound { round, pending } => {
                if let Some(bar) = &self.bar {
                    bar.set_position(bar.position().saturating_sub(*pending as u64));
                    bar.set_message(format!("retry round {} ({} chapters)", round, pending));
                }
            }
        }
    }

    fn finish(&mut self) {
        if let Some(bar) = self.bar.take() {
            bar.disable_steady_tick();
            bar.finish_and_clear();
        }
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let mut out: String = s.chars().take(max).collect();
        out.push_str("...");
        out
    }
}

fn map_job_error(e: JobError, token: &CancellationToken) -> CliRunError {
    match e {
        JobError::Resolve(ResolveError::Cancelled)
        | JobError::Resolve(ResolveError::Fetch(FetchError::Cancelled { .. })) => {
            CliRunError::Cancelled
        }
        _ if token.is_cancelled() => CliRunError::Cancelled,
        e => CliRunError::Job(e),
    }
}

/// Entry point for the CLI. Returns Ok(()) on success; Err with exit code and message on failure.
pub fn run(args: &Args) -> Result<(), CliRunError> {
    validate_url(&args.url)?;

    let file = match &args.config {
        Some(path) => Some(config::load_config_from(path)?),
        None => config::load_config()?,
    };
    let settings = Settings::from_env(file.as_ref())?;
    let plan = build_plan(args, file.as_ref(), settings);

    let token = Arc::new(CancellationToken::new());
    install_interrupt_handler(Arc::clone(&token));

    let pool = ProxyPool::new(plan.settings.proxy.clone());
    let transport = ReqwestTransport::new(plan.settings.http.clone());
    let sleeper = ThreadSleeper;
    let client = FetchClient::new(&transport, &pool, &sleeper, &plan.settings);
    let parser = HtmlChapterParser;

    let resolved = ChapterIndexResolver::new(plan.options.max_index_pages)
        .resolve(
            &client,
            &token,
            &args.url,
            plan.options.workers,
            plan.options.start,
            plan.options.limit,
        )
        .map_err(|e| map_job_error(JobError::Resolve(e), &token))?;

    if args.dry_run {
        print_dry_run(&resolved.metadata.title, resolved.mode, &resolved.plan, &plan);
        return Ok(());
    }

    let orchestrator = Orchestrator::new(&client, &parser, &token, plan.options.clone());
    let mut progress = Progress::new(args.quiet);
    let result = orchestrator.run(resolved, &mut |e| progress.on_event(e));
    progress.finish();
    let job = result.map_err(|e| map_job_error(e, &token))?;

    if job.status == JobStatus::Cancelled {
        return Err(CliRunError::Cancelled);
    }
    if job.chapters.is_empty() {
        print_summary(&job, &[], args.quiet);
        return Err(CliRunError::Epub(EpubError::NoChapters));
    }

    let written = match args.format {
        OutputFormat::Json => vec![write_json(&job, &plan.output_dir)?],
        OutputFormat::Epub => {
            let cover = if args.no_cover {
                None
            } else {
                fetch_cover(&client, &job, &token)
            };
            write_volumes(&job, cover.as_deref(), plan.chapters_per_book, &plan.output_dir)?
        }
    };
    print_summary(&job, &written, args.quiet);
    Ok(())
}

/// Cover download failures degrade to no cover.
fn fetch_cover(
    client: &FetchClient<'_>,
    job: &NovelJob,
    token: &CancellationToken,
) -> Option<Vec<u8>> {
    let url = job.metadata.cover_url.as_deref().filter(|u| !u.is_empty())?;
    match client.fetch_asset(url, COVER_WORKER, token) {
        Ok(bytes) if !bytes.is_empty() => Some(bytes),
        Ok(_) => None,
        Err(e) => {
            warn!(url, error = %e, "cover image could not be fetched, writing without cover");
            None
        }
    }
}

fn write_json(job: &NovelJob, out_dir: &Path) -> Result<PathBuf, CliRunError> {
    let path = out_dir.join(format!("{}.json", slug(&job.metadata.title)));
    let json_err = |message: String| CliRunError::Json {
        path: path.clone(),
        message,
    };
    std::fs::create_dir_all(out_dir).map_err(|e| json_err(e.to_string()))?;
    let f = std::fs::File::create(&path).map_err(|e| json_err(e.to_string()))?;
    serde_json::to_writer_pretty(std::io::BufWriter::new(f), job)
        .map_err(|e| json_err(e.to_string()))?;
    Ok(path)
}

fn print_dry_run(title: &str, mode: DiscoveryMode, chapters: &ChapterPlan, plan: &RunPlan) {
    eprintln!("Title: {}", title);
    eprintln!("Mode: {}", mode);
    match chapters {
        ChapterPlan::Indexed(tasks) => {
            eprintln!("Chapters: {}", tasks.len());
            for (i, range) in plan_volumes(tasks.len(), plan.chapters_per_book)
                .iter()
                .enumerate()
            {
                let first = tasks[range.start() - 1].index;
                let last = tasks[range.end() - 1].index;
                eprintln!(
                    "Volume {}: chapters {}-{} ({} files)",
                    crate::epub::roman(i + 1),
                    first,
                    last,
                    range.end() - range.start() + 1
                );
            }
        }
        ChapterPlan::Crawl { start_url } => {
            eprintln!("Chapters: unknown until crawled, starting at {}", start_url);
        }
    }
    eprintln!("Output: {}", plan.output_dir.display());
}

fn print_summary(job: &NovelJob, written: &[PathBuf], quiet: bool) {
    let failed = job.failed_indices();
    if !failed.is_empty() {
        let list: Vec<String> = failed.iter().map(u32::to_string).collect();
        eprintln!(
            "{} of {} chapters failed: {}",
            failed.len(),
            job.requested.max(job.chapters.len() + failed.len()),
            list.join(", ")
        );
    }
    if job.status == JobStatus::Stopped {
        eprintln!("Stopped early; wrote {} chapters.", job.chapters.len());
    }
    if !quiet {
        for path in written {
            eprintln!("Wrote {}", path.display());
        }
    }
}
