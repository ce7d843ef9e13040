//! CLI parsing and orchestration. Parses args, resolves the book list against the
//! catalog, runs the batch, prints the summary and maps errors to exit codes.

use crate::batch::{run_batch, AbortCause, BatchError};
use crate::catalog::{format_book_list, BookSelection, SelectionError};
use crate::config::{self, Config};
use crate::door43::{
    fetch_available_books, plan_units, ApiClient, CatalogError, PreviewTarget, DEFAULT_BASE_URL,
    DEFAULT_CATALOG_API, DEFAULT_OWNER, DEFAULT_REF,
};
use crate::engine::{
    Backend, ChromeLauncher, ChromeSettings, EngineLauncher, PageSize, WeasyPrintLauncher,
};
use crate::interrupt::Interrupt;
use crate::model::{BatchSummary, ProcessingResult, Unit};
use crate::processor::{Mode, RunConfig, TimeoutPolicy};
use crate::rename::{rename_legacy, RenameError};
use clap::{Parser, Subcommand};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info, warn};

const DEFAULT_BOOKS: [&str; 5] = ["gen", "exo", "lev", "num", "deu"];
const DEFAULT_OUTPUT_DIR: &str = "output";
const DEFAULT_NAVIGATION: (u64, f64) = (90, 0.05);
const DEFAULT_CACHE: (u64, f64) = (300, 0.1);
const DEFAULT_RENDER: (u64, f64) = (600, 0.15);
const DEFAULT_SLEEP_AFTER_READY_SECS: f64 = 5.0;
const DEFAULT_POLL_INTERVAL_MS: u64 = 500;
const DEFAULT_WEASYPRINT: &str = "weasyprint";

/// CLI error carrying exit code and message.
#[derive(Debug, Error)]
pub enum CliRunError {
    #[error("{0}")]
    InvalidInput(String),

    #[error("{0}")]
    Selection(#[from] SelectionError),

    #[error("{0}")]
    Catalog(#[from] CatalogError),

    #[error("{0}")]
    Batch(#[from] BatchError),

    #[error("{0}")]
    Rename(#[from] RenameError),

    #[error("{failed} of {total} unit(s) failed")]
    UnitsFailed { failed: usize, total: usize },
}

impl CliRunError {
    pub fn exit_code(&self) -> i32 {
        match self {
            CliRunError::InvalidInput(_)
            | CliRunError::Selection(_)
            | CliRunError::Catalog(_)
            | CliRunError::Rename(_)
            | CliRunError::UnitsFailed { .. } => 1,
            CliRunError::Batch(BatchError::Aborted {
                cause: AbortCause::Interrupted,
                ..
            }) => 130,
            CliRunError::Batch(_) => 2,
        }
    }
}

#[derive(Parser, Debug)]
#[command(name = "door43-preview", version)]
#[command(about = "Warm Door43 preview caches and export preview pages to PDF, one book at a time")]
#[command(
    after_help = "Config file keys (base_url, owner, catalog_api, output_dir, *_timeout_secs, *_timeout_per_verse, sleep_after_ready_secs, poll_interval_ms, backend, page, chrome_path, weasyprint_path, user_agent, timeout_secs, retry_count, retry_backoff_secs) are read from ./door43-preview.toml or $XDG_CONFIG_HOME/door43-preview/config.toml. CLI flags override config."
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Only log warnings and errors; no progress bar.
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Debug logging and the full error chain on failure.
    #[arg(short, long, global = true, conflicts_with = "quiet")]
    pub verbose: bool,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Load each book's preview page so the service caches its rendered HTML.
    Warm(WarmArgs),
    /// Export each book's preview page to PDF (A4 and/or Letter).
    Pdf(PdfArgs),
    /// List valid book codes grouped by testament.
    ListBooks,
    /// Rename artifacts from the legacy `unfoldingWord--repo--ref--BOOK--SIZE` scheme.
    Rename(RenameArgs),
}

/// Options shared by `warm` and `pdf`.
#[derive(clap::Args, Debug)]
pub struct TargetArgs {
    /// Repository slug, e.g. en_ult or en_tn.
    #[arg(long)]
    pub repo: String,

    /// Repository owner (overrides config; default unfoldingWord).
    #[arg(long)]
    pub owner: Option<String>,

    /// Branch or tag.
    #[arg(long = "ref", default_value = DEFAULT_REF)]
    pub git_ref: String,

    /// Book codes, or `all`, `ot`, `nt`. Accepts several values or one space-separated value.
    #[arg(long, num_args = 1.., default_values = DEFAULT_BOOKS)]
    pub books: Vec<String>,

    /// Preview service base URL (overrides config).
    #[arg(long)]
    pub base_url: Option<String>,

    /// Door43 API base for the catalog lookup (overrides config).
    #[arg(long)]
    pub catalog_api: Option<String>,

    /// Do not query the catalog; process the selected books as given.
    #[arg(long)]
    pub skip_catalog: bool,

    /// Seconds to wait for navigation (overrides config; default 90).
    #[arg(long)]
    pub navigation_timeout: Option<u64>,

    /// Extra navigation seconds per verse (overrides config; default 0.05).
    #[arg(long)]
    pub navigation_timeout_per_verse: Option<f64>,

    /// Run the browser with a visible window.
    #[arg(long)]
    pub headed: bool,

    /// Disable the browser sandbox (needed in some containers).
    #[arg(long)]
    pub no_sandbox: bool,

    /// Browser binary (overrides config; auto-detected by default).
    #[arg(long)]
    pub chrome_path: Option<PathBuf>,

    /// Readiness poll interval in milliseconds (overrides config; default 500).
    #[arg(long)]
    pub poll_interval_ms: Option<u64>,

    /// HTTP User-Agent for catalog requests (overrides config).
    #[arg(long)]
    pub user_agent: Option<String>,
}

#[derive(clap::Args, Debug)]
pub struct WarmArgs {
    #[command(flatten)]
    pub target: TargetArgs,

    /// Seconds to wait for the cache-html request (overrides config; default 300).
    #[arg(long)]
    pub cache_timeout: Option<u64>,

    /// Extra cache seconds per verse (overrides config; default 0.1).
    #[arg(long)]
    pub cache_timeout_per_verse: Option<f64>,
}

#[derive(clap::Args, Debug)]
pub struct PdfArgs {
    #[command(flatten)]
    pub target: TargetArgs,

    /// Directory for HTML and PDF files (overrides config; default ./output).
    #[arg(short, long)]
    pub output_dir: Option<PathBuf>,

    /// Page size: a4, letter, or both (overrides config; default both).
    #[arg(long)]
    pub page: Option<String>,

    /// PDF backend: chromium or weasyprint (overrides config; default chromium).
    #[arg(long, value_parser = parse_backend)]
    pub backend: Option<Backend>,

    /// Seconds to wait for print rendering (overrides config; default 600).
    #[arg(long)]
    pub render_timeout: Option<u64>,

    /// Extra render seconds per verse (overrides config; default 0.15).
    #[arg(long)]
    pub render_timeout_per_verse: Option<f64>,

    /// Seconds (fractions allowed) to wait after Paged.js settles, before printing (overrides config; default 5).
    #[arg(long)]
    pub sleep_after_ready: Option<f64>,

    /// Re-download HTML and re-render PDFs even when they exist.
    #[arg(long)]
    pub force: bool,

    /// WeasyPrint executable (overrides config; default `weasyprint` on PATH).
    #[arg(long)]
    pub weasyprint: Option<PathBuf>,
}

#[derive(clap::Args, Debug)]
pub struct RenameArgs {
    /// Directories holding legacy-named files.
    #[arg(required = true)]
    pub dirs: Vec<PathBuf>,

    /// Perform the renames. Without this only the planned renames are printed.
    #[arg(long)]
    pub apply: bool,

    /// Also process subdirectories.
    #[arg(long)]
    pub recursive: bool,
}

fn parse_page(s: &str) -> Result<Vec<PageSize>, String> {
    match s.to_lowercase().as_str() {
        "a4" => Ok(vec![PageSize::A4]),
        "letter" => Ok(vec![PageSize::Letter]),
        "both" => Ok(PageSize::both()),
        _ => Err(format!(
            "Invalid --page value: '{}'. Use a4, letter, or both.",
            s
        )),
    }
}

fn parse_backend(s: &str) -> Result<Backend, String> {
    match s.to_lowercase().as_str() {
        "chromium" | "chrome" | "playwright" => Ok(Backend::Chromium),
        "weasyprint" => Ok(Backend::WeasyPrint),
        _ => Err(format!(
            "Invalid --backend value: '{}'. Use chromium or weasyprint.",
            s
        )),
    }
}

/// Config value from a string key, reported against the config file on error.
fn config_value<T>(
    config: Option<&Config>,
    key: &str,
    get: impl Fn(&Config) -> Option<&String>,
    parse: impl Fn(&str) -> Result<T, String>,
) -> Result<Option<T>, CliRunError> {
    match config.and_then(get) {
        Some(s) => parse(s)
            .map(Some)
            .map_err(|e| CliRunError::InvalidInput(format!("config key {}: {}", key, e))),
        None => Ok(None),
    }
}

/// CLI value, else config value, else default.
fn pick<T>(cli: Option<T>, config: Option<T>, default: T) -> T {
    cli.or(config).unwrap_or(default)
}

fn timeout_policy(
    flag: &str,
    cli: (Option<u64>, Option<f64>),
    config: (Option<u64>, Option<f64>),
    default: (u64, f64),
) -> Result<TimeoutPolicy, CliRunError> {
    let base = pick(cli.0, config.0, default.0);
    if base == 0 {
        return Err(CliRunError::InvalidInput(format!(
            "--{} must be greater than zero.",
            flag
        )));
    }
    Ok(TimeoutPolicy::new(base, pick(cli.1, config.1, default.1)))
}

fn non_empty(name: &str, value: &str) -> Result<String, CliRunError> {
    let value = value.trim();
    if value.is_empty() || value.contains('/') {
        return Err(CliRunError::InvalidInput(format!(
            "--{} must be a single non-empty path segment, got '{}'.",
            name, value
        )));
    }
    Ok(value.to_string())
}

/// A ref may name a branch such as `release/v1`, but no segment may be empty.
fn git_ref(value: &str) -> Result<String, CliRunError> {
    let value = value.trim();
    if value.is_empty() || value.split('/').any(str::is_empty) {
        return Err(CliRunError::InvalidInput(format!(
            "--ref must be a tag or branch name, got '{}'.",
            value
        )));
    }
    Ok(value.to_string())
}

fn seconds(flag: &str, secs: f64) -> Result<Duration, CliRunError> {
    Duration::try_from_secs_f64(secs).map_err(|_| {
        CliRunError::InvalidInput(format!(
            "--{} must be a non-negative number of seconds, got {}.",
            flag, secs
        ))
    })
}

/// Everything a `warm` or `pdf` run needs, resolved from flags, config and defaults.
#[derive(Debug)]
struct Job {
    run: RunConfig,
    chrome: ChromeSettings,
    backend: Backend,
    weasyprint: PathBuf,
}

fn resolve_target(args: &TargetArgs, config: Option<&Config>) -> Result<PreviewTarget, CliRunError> {
    let owner = args
        .owner
        .clone()
        .or_else(|| config.and_then(|c| c.owner.clone()))
        .unwrap_or_else(|| DEFAULT_OWNER.to_string());
    let base_url = args
        .base_url
        .clone()
        .or_else(|| config.and_then(|c| c.base_url.clone()))
        .unwrap_or_else(|| DEFAULT_BASE_URL.to_string());
    reqwest::Url::parse(&base_url).map_err(|e| {
        CliRunError::InvalidInput(format!("Invalid base URL '{}': {}", base_url, e))
    })?;
    Ok(PreviewTarget::new(
        base_url,
        non_empty("owner", &owner)?,
        non_empty("repo", &args.repo)?,
        git_ref(&args.git_ref)?,
    ))
}

fn resolve_chrome(args: &TargetArgs, config: Option<&Config>) -> ChromeSettings {
    let poll_ms = pick(
        args.poll_interval_ms,
        config.and_then(|c| c.poll_interval_ms),
        DEFAULT_POLL_INTERVAL_MS,
    )
    .max(10);
    ChromeSettings {
        headless: !args.headed,
        sandbox: !args.no_sandbox,
        chrome_path: args
            .chrome_path
            .clone()
            .or_else(|| config.and_then(|c| c.chrome_path.clone())),
        poll_interval: Duration::from_millis(poll_ms),
        ..ChromeSettings::default()
    }
}

fn navigation_policy(args: &TargetArgs, config: Option<&Config>) -> Result<TimeoutPolicy, CliRunError> {
    timeout_policy(
        "navigation-timeout",
        (args.navigation_timeout, args.navigation_timeout_per_verse),
        (
            config.and_then(|c| c.navigation_timeout_secs),
            config.and_then(|c| c.navigation_timeout_per_verse),
        ),
        DEFAULT_NAVIGATION,
    )
}

fn resolve_warm(args: &WarmArgs, config: Option<&Config>) -> Result<Job, CliRunError> {
    let cache = timeout_policy(
        "cache-timeout",
        (args.cache_timeout, args.cache_timeout_per_verse),
        (
            config.and_then(|c| c.cache_timeout_secs),
            config.and_then(|c| c.cache_timeout_per_verse),
        ),
        DEFAULT_CACHE,
    )?;
    let render = TimeoutPolicy::new(
        config.and_then(|c| c.render_timeout_secs).unwrap_or(DEFAULT_RENDER.0),
        config.and_then(|c| c.render_timeout_per_verse).unwrap_or(DEFAULT_RENDER.1),
    );
    Ok(Job {
        run: RunConfig {
            target: resolve_target(&args.target, config)?,
            mode: Mode::Warm,
            output_dir: PathBuf::from(DEFAULT_OUTPUT_DIR),
            force: false,
            navigation: navigation_policy(&args.target, config)?,
            cache,
            render,
        },
        chrome: resolve_chrome(&args.target, config),
        backend: Backend::Chromium,
        weasyprint: PathBuf::from(DEFAULT_WEASYPRINT),
    })
}

fn resolve_pdf(args: &PdfArgs, config: Option<&Config>) -> Result<Job, CliRunError> {
    let page_sizes = match &args.page {
        Some(s) => parse_page(s).map_err(CliRunError::InvalidInput)?,
        None => config_value(config, "page", |c| c.page.as_ref(), parse_page)?
            .unwrap_or_else(PageSize::both),
    };
    let backend = match args.backend {
        Some(b) => b,
        None => config_value(config, "backend", |c| c.backend.as_ref(), parse_backend)?
            .unwrap_or(Backend::Chromium),
    };
    let render = timeout_policy(
        "render-timeout",
        (args.render_timeout, args.render_timeout_per_verse),
        (
            config.and_then(|c| c.render_timeout_secs),
            config.and_then(|c| c.render_timeout_per_verse),
        ),
        DEFAULT_RENDER,
    )?;
    let cache = TimeoutPolicy::new(
        config.and_then(|c| c.cache_timeout_secs).unwrap_or(DEFAULT_CACHE.0),
        config.and_then(|c| c.cache_timeout_per_verse).unwrap_or(DEFAULT_CACHE.1),
    );
    let output_dir = args
        .output_dir
        .clone()
        .or_else(|| config.and_then(|c| c.output_dir.clone()))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_OUTPUT_DIR));
    let sleep_after_ready = pick(
        args.sleep_after_ready,
        config.and_then(|c| c.sleep_after_ready_secs),
        DEFAULT_SLEEP_AFTER_READY_SECS,
    );
    let weasyprint = args
        .weasyprint
        .clone()
        .or_else(|| config.and_then(|c| c.weasyprint_path.clone()))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_WEASYPRINT));
    Ok(Job {
        run: RunConfig {
            target: resolve_target(&args.target, config)?,
            mode: Mode::Pdf { page_sizes },
            output_dir,
            force: args.force,
            navigation: navigation_policy(&args.target, config)?,
            cache,
            render,
        },
        chrome: ChromeSettings {
            sleep_after_ready: seconds("sleep-after-ready", sleep_after_ready)?,
            ..resolve_chrome(&args.target, config)
        },
        backend,
        weasyprint,
    })
}

fn build_client(args: &TargetArgs, config: Option<&Config>) -> Result<ApiClient, CliRunError> {
    let mut builder = ApiClient::builder();
    if let Some(ua) = args
        .user_agent
        .clone()
        .or_else(|| config.and_then(|c| c.user_agent.clone()))
    {
        builder = builder.user_agent(ua);
    }
    if let Some(secs) = config.and_then(|c| c.timeout_secs) {
        builder = builder.timeout_secs(secs);
    }
    if let Some(n) = config.and_then(|c| c.retry_count) {
        builder = builder.retry_count(n);
    }
    if let Some(backoff) = config.and_then(|c| c.retry_backoff_secs.clone()) {
        builder = builder.retry_backoff_secs(backoff);
    }
    builder
        .build()
        .map_err(|e| CliRunError::InvalidInput(format!("Failed to create HTTP client: {}", e)))
}

/// Units to process: the selection filtered by the catalog entry, or as given with `--skip-catalog`.
fn resolve_units(
    args: &TargetArgs,
    target: &PreviewTarget,
    config: Option<&Config>,
) -> Result<Vec<Unit>, CliRunError> {
    let selection = BookSelection::resolve(&args.books)?;
    if args.skip_catalog {
        return Ok(selection.books().iter().copied().map(Unit::Book).collect());
    }
    let api = args
        .catalog_api
        .clone()
        .or_else(|| config.and_then(|c| c.catalog_api.clone()))
        .unwrap_or_else(|| DEFAULT_CATALOG_API.to_string());
    let client = build_client(args, config)?;
    let available = fetch_available_books(&client, &api, target)?;
    Ok(plan_units(&selection, &available, target)?)
}

/// Longest single wait any unit can hit, so the browser connection never idles out first.
fn longest_wait(units: &[Unit], run: &RunConfig) -> Duration {
    units
        .iter()
        .flat_map(|&u| {
            [
                run.navigation.for_unit(u),
                run.cache.for_unit(u),
                run.render.for_unit(u),
            ]
        })
        .max()
        .unwrap_or_default()
}

/// Append `books-loaded` / `books-failed` for a CI step.
fn write_github_output(path: &Path, summary: &BatchSummary) -> std::io::Result<()> {
    let mut f = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)?;
    writeln!(f, "books-loaded={}", summary.successful)?;
    writeln!(f, "books-failed={}", summary.failed)?;
    Ok(())
}

fn report_summary(summary: &BatchSummary, mode: &Mode, repo: &str) {
    let heading = match mode {
        Mode::Warm => "CACHE WARMING SUMMARY",
        Mode::Pdf { .. } => "PDF EXPORT SUMMARY",
    };
    println!("{}", summary.report(heading, repo));
    if let Some(path) = std::env::var_os("GITHUB_OUTPUT") {
        if let Err(e) = write_github_output(Path::new(&path), summary) {
            warn!("could not write GITHUB_OUTPUT: {}", e);
        }
    }
}

fn progress_bar(total: usize) -> indicatif::ProgressBar {
    let bar = indicatif::ProgressBar::new(total as u64);
    let style = indicatif::ProgressStyle::default_bar()
        .template("{msg} [{bar:40}] {pos}/{len} ({elapsed})")
        .unwrap_or_else(|_| indicatif::ProgressStyle::default_bar())
        .progress_chars("█▉▊▋▌▍▎▏ ");
    bar.set_style(style);
    bar
}

fn run_job(job: Job, target_args: &TargetArgs, config: Option<&Config>, quiet: bool) -> Result<(), CliRunError> {
    let Job {
        run,
        mut chrome,
        backend,
        weasyprint,
    } = job;

    let units = resolve_units(target_args, &run.target, config)?;
    info!(
        "Processing {} unit(s) from {}/{}@{}",
        units.len(),
        run.target.owner,
        run.target.repo,
        run.target.git_ref
    );
    chrome.idle_timeout = chrome
        .idle_timeout
        .max(longest_wait(&units, &run) + Duration::from_secs(60));

    let interrupt = Interrupt::install().map_err(|e| {
        CliRunError::InvalidInput(format!("Cannot install signal handlers: {}", e))
    })?;
    let poll_interval = chrome.poll_interval;
    let chrome = ChromeLauncher::new(chrome, interrupt.clone());
    let launcher: Box<dyn EngineLauncher> = match backend {
        Backend::WeasyPrint if matches!(run.mode, Mode::Pdf { .. }) => Box::new(
            WeasyPrintLauncher::new(chrome, weasyprint, interrupt.clone())
                .poll_interval(poll_interval),
        ),
        _ => Box::new(chrome),
    };

    let bar = (!quiet && units.len() > 1).then(|| progress_bar(units.len()));
    let repo = run.target.repo.clone();
    let progress_cb = |done: usize, _total: usize, result: &ProcessingResult| {
        if let Some(pb) = &bar {
            pb.set_position(done as u64);
            pb.set_message(result.unit.display_name(&repo));
        }
    };
    let progress: Option<&dyn Fn(usize, usize, &ProcessingResult)> = if bar.is_some() {
        Some(&progress_cb)
    } else {
        None
    };

    let outcome = run_batch(&units, &run, launcher.as_ref(), &interrupt, progress);
    if let Some(pb) = &bar {
        pb.finish_and_clear();
    }
    match outcome {
        Ok(summary) => {
            report_summary(&summary, &run.mode, &run.target.repo);
            if summary.exit_code() != 0 {
                return Err(CliRunError::UnitsFailed {
                    failed: summary.failed,
                    total: summary.attempted(),
                });
            }
            Ok(())
        }
        Err(e) => {
            if let Some(summary) = e.partial_summary() {
                report_summary(summary, &run.mode, &run.target.repo);
            }
            Err(e.into())
        }
    }
}

fn run_rename(args: &RenameArgs) -> Result<(), CliRunError> {
    if !args.apply {
        println!("DRY RUN: no files will be renamed. Use --apply to rename.");
    }
    let (mut renamed, mut skipped) = (0, 0);
    for dir in &args.dirs {
        let report = match rename_legacy(dir, args.apply, args.recursive) {
            Ok(r) => r,
            Err(e @ RenameError::NotADirectory(_)) => {
                error!("{}", e);
                continue;
            }
            Err(e) => return Err(e.into()),
        };
        let verb = if args.apply { "Renamed" } else { "Would rename" };
        for (from, to) in &report.renamed {
            println!("{}: {} -> {}", verb, file_name(from), file_name(to));
        }
        renamed += report.renamed.len();
        skipped += report.skipped;
    }
    println!("TOTAL: {} renamed, {} skipped", renamed, skipped);
    Ok(())
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

/// Entry point for the CLI. Returns Ok(()) on success; Err with exit code and message on failure.
pub fn run(cli: &Cli) -> Result<(), CliRunError> {
    match &cli.command {
        Command::ListBooks => {
            print!("{}", format_book_list());
            Ok(())
        }
        Command::Rename(args) => run_rename(args),
        Command::Warm(args) => {
            let config = config::load_config().map_err(CliRunError::InvalidInput)?;
            let job = resolve_warm(args, config.as_ref())?;
            run_job(job, &args.target, config.as_ref(), cli.quiet)
        }
        Command::Pdf(args) => {
            let config = config::load_config().map_err(CliRunError::InvalidInput)?;
            let job = resolve_pdf(args, config.as_ref())?;
            run_job(job, &args.target, config.as_ref(), cli.quiet)
        }
    }
}
