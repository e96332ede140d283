//! CLI binary for bio2csv.
//!
//! A thin shim over the library crate: maps flags to `PipelineConfig`,
//! renders progress, and turns the run report into an exit code.

use anyhow::{Context, Result};
use bio2csv::config::StageName;
use bio2csv::export::{self, ExportOptions, SubmitMode, WikidataLookup};
use bio2csv::store::{ArtifactKind, UnitStore};
use bio2csv::{
    check_only, parse_code_version, run_pipeline, CancelFlag, ConsistencyReport, PipelineConfig,
    PipelineProgressCallback, PipelineReport, ProgressCallback, RunSummary,
};
use clap::{Args, Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;

// ── ANSI colour helpers ──────────────────────────────────────────────────────

fn green(s: &str) -> String {
    format!("\x1b[32m{s}\x1b[0m")
}
fn red(s: &str) -> String {
    format!("\x1b[31m{s}\x1b[0m")
}
fn yellow(s: &str) -> String {
    format!("\x1b[33m{s}\x1b[0m")
}
fn dim(s: &str) -> String {
    format!("\x1b[2m{s}\x1b[0m")
}
fn bold(s: &str) -> String {
    format!("\x1b[1m{s}\x1b[0m")
}

const TICKS: &[&str] = &["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "⠿"];

// ── CLI progress callback using indicatif ────────────────────────────────────

/// One bar, re-armed at the start of every stage. Units finish out of
/// order, so start times are tracked per unit id.
struct CliProgressCallback {
    bar: ProgressBar,
    start_times: Mutex<HashMap<String, Instant>>,
    errors: AtomicUsize,
}

impl CliProgressCallback {
    fn new() -> Arc<Self> {
        let bar = ProgressBar::new(0);
        bar.set_style(
            ProgressStyle::with_template("{spinner:.cyan} {prefix:.bold}  {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner())
                .tick_strings(TICKS),
        );
        bar.set_prefix("Preparing");
        bar.enable_steady_tick(Duration::from_millis(80));
        Arc::new(Self {
            bar,
            start_times: Mutex::new(HashMap::new()),
            errors: AtomicUsize::new(0),
        })
    }

    fn elapsed_secs(&self, unit_id: &str) -> f64 {
        self.start_times
            .lock()
            .ok()
            .and_then(|mut m| m.remove(unit_id))
            .map(|t| t.elapsed().as_secs_f64())
            .unwrap_or(0.0)
    }
}

impl PipelineProgressCallback for CliProgressCallback {
    fn on_stage_start(&self, stage: StageName, total_units: usize) {
        self.bar.set_style(
            ProgressStyle::with_template(
                "{spinner:.cyan} {prefix:.bold}  \
                 [{bar:42.green/238}] {pos:>4}/{len} units  \
                 ⏱ {elapsed_precise}  {msg}",
            )
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("█▉▊▋▌▍▎▏  ")
            .tick_strings(TICKS),
        );
        self.bar.set_length(total_units as u64);
        self.bar.set_position(0);
        self.bar.set_prefix(format!("{:<7}", stage.as_str()));
        self.bar.set_message("");
        self.bar.reset_elapsed();
    }

    fn on_unit_skipped(&self, _stage: StageName, _unit_id: &str) {
        self.bar.inc(1);
    }

    fn on_unit_start(&self, _stage: StageName, unit_id: &str) {
        if let Ok(mut m) = self.start_times.lock() {
            m.insert(unit_id.to_string(), Instant::now());
        }
        self.bar.set_message(unit_id.to_string());
    }

    fn on_unit_complete(&self, stage: StageName, unit_id: &str, bytes: usize) {
        let secs = self.elapsed_secs(unit_id);
        self.bar.println(format!(
            "  {} {:<7} {:<32} {:<14} {}",
            green("✓"),
            stage.as_str(),
            unit_id,
            dim(&format!("{bytes:>8} bytes")),
            dim(&format!("{secs:.1}s")),
        ));
        self.bar.inc(1);
    }

    fn on_unit_error(&self, stage: StageName, unit_id: &str, error: &str) {
        let secs = self.elapsed_secs(unit_id);
        self.errors.fetch_add(1, Ordering::SeqCst);
        let msg = if error.chars().count() > 80 {
            format!("{}\u{2026}", error.chars().take(79).collect::<String>())
        } else {
            error.to_string()
        };
        self.bar.println(format!(
            "  {} {:<7} {:<32} {}  {}",
            red("✗"),
            stage.as_str(),
            unit_id,
            red(&msg),
            dim(&format!("{secs:.1}s")),
        ));
        self.bar.inc(1);
    }

    fn on_stage_complete(&self, summary: &RunSummary) {
        self.bar.println(format!("{} {}", stage_mark(summary), summary_line(summary)));
    }

    fn on_consistency_report(&self, report: &ConsistencyReport) {
        if !report.is_consistent() {
            self.bar.println(format!("  {} {}", yellow("⚠"), consistency_line(report)));
        }
    }
}

fn stage_mark(summary: &RunSummary) -> String {
    if summary.is_clean() {
        green("✔")
    } else if summary.processed + summary.skipped == 0 {
        red("✘")
    } else {
        yellow("⚠")
    }
}

fn summary_line(s: &RunSummary) -> String {
    let mut line = format!(
        "{} {}  {} processed, {} skipped, {} failed",
        bold(s.stage.as_str()),
        dim(&format!("({})", s.code_version)),
        s.processed,
        s.skipped,
        s.failed,
    );
    if s.cancelled > 0 {
        line.push_str(&format!(", {} cancelled", s.cancelled));
    }
    line.push_str(&format!("  {}", dim(&format!("{}ms", s.duration_ms))));
    line
}

fn consistency_line(r: &ConsistencyReport) -> String {
    let from = r.from.map(|s| s.as_str()).unwrap_or("source");
    let to = r.to.map(|s| s.as_str()).unwrap_or("?");
    let ids = |set: &std::collections::BTreeSet<bio2csv::UnitId>| {
        set.iter().map(|id| id.as_str()).collect::<Vec<_>>().join(", ")
    };
    let mut line = format!(
        "{from} → {to}: {} upstream, {} downstream",
        r.upstream_count, r.downstream_count
    );
    if !r.missing.is_empty() {
        line.push_str(&format!("; missing [{}]", ids(&r.missing)));
    }
    if !r.unexpected.is_empty() {
        line.push_str(&format!("; unexpected [{}]", ids(&r.unexpected)));
    }
    if !r.invalid.is_empty() {
        line.push_str(&format!("; invalid [{}]", ids(&r.invalid)));
    }
    line
}

const AFTER_HELP: &str = r#"EXAMPLES:
  # Full pipeline; bookmarks before page 13 are front matter
  bio2csv run --source women_in_math.pdf --page-offset 12

  # Re-parse every subject after changing the prompt
  bio2csv run --stages parse,join --code-version parse=parse-v2 \
      --system-prompt prompt.txt

  # Report which units are missing between stages (no work done)
  bio2csv check

  # Build dataset.json / texts.json, resolving Wikidata ids
  bio2csv export --wikidata

  # Send the export to a corpus API
  bio2csv submit --api-url http://localhost:8000

WORK DIRECTORY LAYOUT:
  <work>/split/<id>.pdf      one PDF per subject
  <work>/text/<id>.txt       extracted text
  <work>/parsed/<id>.json    structured record
  <work>/tables/*.csv        personal, degrees, employment, visits, honors, parents
  <work>/rejected/<id>.txt   raw LLM replies that could not be parsed
  <work>/export/             dataset.json, texts.json
  Every artifact has a provenance sidecar in .provenance/ next to it.

ENVIRONMENT VARIABLES:
  OPENAI_API_KEY          OpenAI API key
  ANTHROPIC_API_KEY       Anthropic API key
  GEMINI_API_KEY          Google Gemini API key
  EDGEQUAKE_LLM_PROVIDER  Override provider (openai, anthropic, gemini, ollama)
  EDGEQUAKE_MODEL         Override model ID
  PDFIUM_LIB_PATH         Path to libpdfium
  RUST_LOG                Log filter (overrides -v / -q)
"#;

/// Turn a biographical reference PDF into CSV tables, incrementally.
#[derive(Parser, Debug)]
#[command(
    name = "bio2csv",
    version,
    about = "Turn a biographical reference PDF into CSV tables, incrementally",
    arg_required_else_help = true,
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Directory holding all stage stores and tables.
    #[arg(short, long, global = true, env = "BIO2CSV_WORK_DIR", default_value = "work")]
    work_dir: PathBuf,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long, global = true, env = "BIO2CSV_VERBOSE")]
    verbose: bool,

    /// Suppress all output except errors.
    #[arg(short, long, global = true, env = "BIO2CSV_QUIET")]
    quiet: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the pipeline stages, skipping units whose output is current.
    Run(RunArgs),
    /// Report unit-set differences between the existing stores. Does no work.
    Check(CheckArgs),
    /// Build dataset.json and texts.json from the joined tables.
    Export(ExportArgs),
    /// Submit an export to a corpus API.
    Submit(SubmitArgs),
}

#[derive(Args, Debug)]
struct RunArgs {
    /// The biographical source PDF (needed by the split stage).
    #[arg(short, long, env = "BIO2CSV_SOURCE")]
    source: Option<PathBuf>,

    /// 0-based page index where subject entries begin.
    #[arg(long, env = "BIO2CSV_PAGE_OFFSET", default_value_t = 0)]
    page_offset: usize,

    /// Stages to run: split, extract, parse, join.
    #[arg(long, env = "BIO2CSV_STAGES", value_delimiter = ',',
          default_value = "split,extract,parse,join")]
    stages: Vec<StageName>,

    /// Override a stage's code version, e.g. parse=parse-v2. Repeatable.
    #[arg(long = "code-version", value_name = "STAGE=VERSION")]
    code_versions: Vec<String>,

    /// Also compare input fingerprints before skipping a unit.
    #[arg(long, env = "BIO2CSV_VERIFY_FINGERPRINTS")]
    verify_fingerprints: bool,

    /// Workers for split and extract.
    #[arg(short, long, env = "BIO2CSV_CONCURRENCY", default_value_t = 4)]
    concurrency: usize,

    /// Concurrent LLM calls in the parse stage.
    #[arg(long, env = "BIO2CSV_LLM_CONCURRENCY", default_value_t = 4)]
    llm_concurrency: usize,

    /// LLM model ID (e.g. gpt-4.1-nano, gpt-4.1-mini).
    #[arg(long, env = "EDGEQUAKE_MODEL")]
    model: Option<String>,

    /// LLM provider: openai, anthropic, gemini, ollama, azure.
    #[arg(long, env = "EDGEQUAKE_PROVIDER")]
    provider: Option<String>,

    /// Path to a text file containing a custom extraction prompt.
    #[arg(long, env = "BIO2CSV_SYSTEM_PROMPT")]
    system_prompt: Option<PathBuf>,

    /// Max LLM output tokens per unit.
    #[arg(long, env = "BIO2CSV_MAX_TOKENS", default_value_t = 4096)]
    max_tokens: usize,

    /// LLM temperature (0.0–2.0).
    #[arg(long, env = "BIO2CSV_TEMPERATURE", default_value_t = 0.1)]
    temperature: f32,

    /// Retries per unit on transport failure.
    #[arg(long, env = "BIO2CSV_MAX_RETRIES", default_value_t = 2)]
    max_retries: u32,

    /// Per-unit LLM call timeout in seconds.
    #[arg(long, env = "BIO2CSV_API_TIMEOUT", default_value_t = 120)]
    api_timeout: u64,

    /// Print the run report as JSON on stdout.
    #[arg(long, env = "BIO2CSV_JSON")]
    json: bool,

    /// Disable progress bar.
    #[arg(long, env = "BIO2CSV_NO_PROGRESS")]
    no_progress: bool,
}

#[derive(Args, Debug)]
struct CheckArgs {
    /// Print the reports as JSON on stdout.
    #[arg(long)]
    json: bool,

    /// Override a stage's code version, e.g. parse=parse-v2. Repeatable.
    #[arg(long = "code-version", value_name = "STAGE=VERSION")]
    code_versions: Vec<String>,
}

#[derive(Args, Debug)]
struct ExportArgs {
    /// Look up Wikidata ids for each subject (network).
    #[arg(long, env = "BIO2CSV_WIKIDATA")]
    wikidata: bool,

    /// Dataset identifier.
    #[arg(long, env = "BIO2CSV_DATASET_ID", default_value = "women-in-math")]
    dataset_id: String,

    /// Human-readable dataset name.
    #[arg(long, env = "BIO2CSV_DATASET_NAME")]
    dataset_name: Option<String>,

    /// Dataset description.
    #[arg(long, env = "BIO2CSV_DATASET_DESCRIPTION")]
    description: Option<String>,

    /// HTTP timeout in seconds for each lookup.
    #[arg(long, default_value_t = 10)]
    timeout: u64,
}

#[derive(Args, Debug)]
struct SubmitArgs {
    /// Base URL of the corpus API.
    #[arg(long, env = "BIO2CSV_API_URL", default_value = "http://localhost:8000")]
    api_url: String,

    /// What to send: all, metadata-only, texts-only.
    #[arg(long, default_value = "all")]
    mode: SubmitMode,

    /// HTTP timeout in seconds per request.
    #[arg(long, default_value_t = 30)]
    timeout: u64,
}

fn init_tracing(cli: &Cli, show_progress: bool) {
    let filter = if cli.verbose {
        "debug"
    } else if cli.quiet || show_progress {
        "error"
    } else {
        "info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_writer(io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    let show_progress = match &cli.command {
        Command::Run(args) => !cli.quiet && !args.no_progress && !args.json,
        _ => false,
    };
    init_tracing(&cli, show_progress);

    match &cli.command {
        Command::Run(args) => run(&cli, args, show_progress).await,
        Command::Check(args) => check(&cli, args),
        Command::Export(args) => export_cmd(&cli, args).await,
        Command::Submit(args) => submit_cmd(&cli, args).await,
    }
}

// ── run ──────────────────────────────────────────────────────────────────────

async fn run(cli: &Cli, args: &RunArgs, show_progress: bool) -> Result<ExitCode> {
    let cancel = CancelFlag::default();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                eprintln!("{}", yellow("Interrupted: finishing in-flight units, starting no new ones"));
                cancel.cancel();
            }
        });
    }

    let progress: Option<Arc<CliProgressCallback>> = show_progress.then(CliProgressCallback::new);
    let config = build_config(cli, args, cancel, progress.clone().map(|p| p as ProgressCallback)).await?;

    let report = run_pipeline(&config).await;
    if let Some(ref p) = progress {
        p.bar.finish_and_clear();
    }
    let report = report.context("Pipeline failed")?;

    if args.json {
        println!(
            "{}",
            serde_json::to_string_pretty(&report).context("Failed to serialise report")?
        );
    } else if !cli.quiet {
        print_report(&report, show_progress);
    }

    Ok(if report.has_failures() {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    })
}

fn print_report(report: &PipelineReport, progress_shown: bool) {
    // The progress callback already printed stage lines and consistency warnings.
    if !progress_shown {
        for s in &report.summaries {
            eprintln!("{} {}", stage_mark(s), summary_line(s));
        }
        for r in report.consistency.iter().filter(|r| !r.is_consistent()) {
            eprintln!("  {} {}", yellow("⚠"), consistency_line(r));
        }
    }
    for s in report.summaries.iter().filter(|s| s.failed > 0) {
        eprintln!("{} failed units:", bold(s.stage.as_str()));
        for f in &s.failures {
            eprintln!("  {} {}: {}", red("✗"), f.unit_id, f.error);
        }
    }
    for table in &report.tables {
        eprintln!("  {} {}", dim("→"), table.display());
    }
    eprintln!("{}", dim(&format!("{}ms total", report.duration_ms)));
}

/// Map CLI args to `PipelineConfig`.
async fn build_config(
    cli: &Cli,
    args: &RunArgs,
    cancel: CancelFlag,
    progress: Option<ProgressCallback>,
) -> Result<PipelineConfig> {
    let system_prompt = if let Some(ref path) = args.system_prompt {
        Some(
            tokio::fs::read_to_string(path)
                .await
                .with_context(|| format!("Failed to read system prompt from {:?}", path))?,
        )
    } else {
        None
    };

    let mut builder = PipelineConfig::builder()
        .work_dir(&cli.work_dir)
        .page_offset(args.page_offset)
        .stages(args.stages.iter().copied())
        .verify_fingerprints(args.verify_fingerprints)
        .concurrency(args.concurrency)
        .llm_concurrency(args.llm_concurrency)
        .temperature(args.temperature)
        .max_tokens(args.max_tokens)
        .max_retries(args.max_retries)
        .api_timeout_secs(args.api_timeout)
        .cancel_flag(cancel);

    if let Some(ref source) = args.source {
        builder = builder.source_pdf(source);
    }
    for raw in &args.code_versions {
        let (stage, version) = parse_code_version(raw).context("Invalid --code-version")?;
        builder = builder.code_version(stage, version);
    }
    if let Some(ref model) = args.model {
        builder = builder.model(model.clone());
    }
    if let Some(ref provider) = args.provider {
        builder = builder.provider_name(provider.clone());
    }
    if let Some(prompt) = system_prompt {
        builder = builder.system_prompt(prompt);
    }
    if let Some(cb) = progress {
        builder = builder.progress_callback(cb);
    }

    builder.build().context("Invalid configuration")
}

// ── check ────────────────────────────────────────────────────────────────────

fn check(cli: &Cli, args: &CheckArgs) -> Result<ExitCode> {
    let mut builder = PipelineConfig::builder()
        .work_dir(&cli.work_dir)
        .stages([StageName::Extract, StageName::Parse, StageName::Join]);
    for raw in &args.code_versions {
        let (stage, version) = parse_code_version(raw).context("Invalid --code-version")?;
        builder = builder.code_version(stage, version);
    }
    let config = builder.build().context("Invalid configuration")?;

    let reports = check_only(&config).context("Consistency check failed")?;

    if args.json {
        println!(
            "{}",
            serde_json::to_string_pretty(&reports).context("Failed to serialise reports")?
        );
    } else if !cli.quiet {
        for r in &reports {
            if r.is_consistent() {
                eprintln!("{} {}", green("✔"), consistency_line(r));
            } else {
                eprintln!("{} {}", yellow("⚠"), consistency_line(r));
            }
        }
    }

    Ok(if reports.iter().all(ConsistencyReport::is_consistent) {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

// ── export / submit ──────────────────────────────────────────────────────────

async fn export_cmd(cli: &Cli, args: &ExportArgs) -> Result<ExitCode> {
    let config = PipelineConfig::builder()
        .work_dir(&cli.work_dir)
        .stages([StageName::Join])
        .build()
        .context("Invalid configuration")?;

    let mut options = ExportOptions {
        dataset_id: args.dataset_id.clone(),
        ..Default::default()
    };
    if let Some(ref name) = args.dataset_name {
        options.name = name.clone();
    }
    if let Some(ref description) = args.description {
        options.description = description.clone();
    }

    let texts = UnitStore::open(config.text_dir(), ArtifactKind::Text)
        .context("Failed to open text store")?;
    let lookup = if args.wikidata {
        Some(WikidataLookup::new(args.timeout).context("Failed to set up Wikidata lookup")?)
    } else {
        None
    };

    let prepared = export::prepare_dataset(
        &config.tables_dir(),
        &texts,
        lookup.as_ref().map(|l| l as &dyn export::EntityLookup),
        &options,
    )
    .await
    .context("Failed to prepare dataset")?;
    let (dataset_path, texts_path) =
        export::save(&prepared, &config.export_dir()).context("Failed to save export")?;

    if !cli.quiet {
        eprintln!(
            "{} {} authors ({} Wikidata, {} local), {} texts",
            green("✔"),
            bold(&prepared.dataset.authors.len().to_string()),
            prepared.wikidata_count(),
            prepared.local_count(),
            prepared.texts.len(),
        );
        eprintln!("  {} {}", dim("→"), dataset_path.display());
        eprintln!("  {} {}", dim("→"), texts_path.display());
    }
    Ok(ExitCode::SUCCESS)
}

async fn submit_cmd(cli: &Cli, args: &SubmitArgs) -> Result<ExitCode> {
    let export_dir = cli.work_dir.join("export");
    let report = export::submit(&args.api_url, &export_dir, args.mode, args.timeout)
        .await
        .context("Submission failed")?;

    if !cli.quiet {
        if report.metadata_submitted {
            eprintln!("{} metadata: {} authors", green("✔"), report.authors);
        }
        if args.mode != SubmitMode::MetadataOnly {
            let mark = if report.texts_failed == 0 { green("✔") } else { yellow("⚠") };
            eprintln!(
                "{} texts: {} ingested, {} failed",
                mark, report.texts_ingested, report.texts_failed
            );
        }
    }

    Ok(if report.texts_failed == 0 {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}
