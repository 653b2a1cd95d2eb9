//! CLI binary for edgequake-pdf2epub.
//!
//! A thin shim over the library crate that maps CLI flags onto `JobConfig`,
//! runs one mode and prints its report.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use edgequake_pdf2epub::pipeline::input::input_stem;
use edgequake_pdf2epub::{
    run, Job, JobConfig, JobConfigBuilder, JobPaths, PipelineObserver, Stage, StageReport,
    StructureCheck,
};
use indicatif::{ProgressBar, ProgressStyle};
use std::collections::HashMap;
use std::fs::OpenOptions;
use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer};

// ── ANSI colour helpers (no extra deps) ──────────────────────────────────────

fn green(s: &str) -> String {
    format!("\x1b[32m{s}\x1b[0m")
}
fn red(s: &str) -> String {
    format!("\x1b[31m{s}\x1b[0m")
}
fn dim(s: &str) -> String {
    format!("\x1b[2m{s}\x1b[0m")
}
fn bold(s: &str) -> String {
    format!("\x1b[1m{s}\x1b[0m")
}
fn cyan(s: &str) -> String {
    format!("\x1b[36m{s}\x1b[0m")
}

const TICKS: &[&str] = &["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "⠿"];

// ── CLI progress observer using indicatif ────────────────────────────────────

/// Terminal observer: one progress bar per stage plus a log line per unit.
/// Units may finish out of order when generation runs concurrently.
struct CliObserver {
    bar: ProgressBar,
    start_times: Mutex<HashMap<String, Instant>>,
    skipped: AtomicUsize,
}

impl CliObserver {
    fn new() -> Arc<Self> {
        let bar = ProgressBar::new(0);
        let spinner_style = ProgressStyle::with_template("{spinner:.cyan} {prefix:.bold}  {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
            .tick_strings(TICKS);
        bar.set_style(spinner_style);
        bar.set_prefix("Preparing");
        bar.set_message("Syncing job directory…");
        bar.enable_steady_tick(Duration::from_millis(80));

        Arc::new(Self {
            bar,
            start_times: Mutex::new(HashMap::new()),
            skipped: AtomicUsize::new(0),
        })
    }

    /// Start times stay usable after a panic in another callback.
    fn start_times(&self) -> MutexGuard<'_, HashMap<String, Instant>> {
        self.start_times
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn elapsed(&self, unit: &str) -> String {
        let ms = self
            .start_times()
            .remove(unit)
            .map(|t| t.elapsed().as_millis())
            .unwrap_or(0);
        format!("{:.1}s", ms as f64 / 1000.0)
    }
}

impl PipelineObserver for CliObserver {
    fn on_stage_start(&self, stage: Stage, total_units: usize) {
        let progress_style = ProgressStyle::with_template(
            "{spinner:.cyan} {prefix:.bold}  \
             [{bar:42.green/238}] {pos:>3}/{len} units  \
             ⏱ {elapsed_precise}  {msg}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("█▉▊▋▌▍▎▏  ")
        .tick_strings(TICKS);

        self.bar.set_length(total_units as u64);
        self.bar.set_position(0);
        self.bar.set_style(progress_style);
        self.bar.set_prefix(match stage {
            Stage::Generate => "Generating",
            Stage::Translate => "Translating",
        });
        self.bar.reset_eta();
        self.bar.println(format!(
            "{} {}",
            cyan("◆"),
            bold(&format!("{stage}: {total_units} units"))
        ));
    }

    fn on_unit_start(&self, _stage: Stage, unit: &str) {
        self.start_times().insert(unit.to_string(), Instant::now());
        self.bar.set_message(unit.to_string());
    }

    fn on_unit_complete(&self, _stage: Stage, unit: &str, attempts: u32) {
        let retries = if attempts > 1 {
            format!("{attempts} attempts")
        } else {
            String::new()
        };
        self.bar.println(format!(
            "  {} {:<32}  {}  {}",
            green("✓"),
            unit,
            dim(&self.elapsed(unit)),
            dim(&retries),
        ));
        self.bar.inc(1);
    }

    fn on_unit_skipped(&self, _stage: Stage, _unit: &str) {
        self.skipped.fetch_add(1, Ordering::SeqCst);
        self.bar.inc(1);
    }

    fn on_unit_failed(&self, _stage: Stage, unit: &str, error: &str) {
        // Truncate very long error messages to keep output tidy.
        let msg = if error.chars().count() > 80 {
            format!("{}\u{2026}", error.chars().take(79).collect::<String>())
        } else {
            error.to_string()
        };
        self.bar.println(format!(
            "  {} {:<32}  {}  {}",
            red("✗"),
            unit,
            red(&msg),
            dim(&self.elapsed(unit)),
        ));
        self.bar.inc(1);
    }

    fn on_stage_complete(&self, _report: &StageReport) {
        self.bar.finish_and_clear();
        let skipped = self.skipped.swap(0, Ordering::SeqCst);
        if skipped > 0 {
            eprintln!("{} {} units already done", dim("·"), skipped);
        }
    }
}

const AFTER_HELP: &str = r#"EXAMPLES:
  # Extract the outline only
  pdf2epub extract book.pdf

  # Build the EPUB (extracts the outline first if needed)
  pdf2epub generate book.pdf --title "My Book"

  # Translate the generated EPUB with 2000 characters of context
  pdf2epub --title "My Book" translate --target-language French --previous-content-limit 2000

  # Translate any EPUB
  pdf2epub translate novel.epub --source-language German --target-language English

  # Resume on another machine from a shared volume
  pdf2epub --remote-dir /mnt/books generate --title "My Book"

  # Inspect progress without calling any service
  pdf2epub --title "My Book" status

ENVIRONMENT VARIABLES:
  OPENAI_API_KEY          OpenAI API key
  ANTHROPIC_API_KEY       Anthropic API key
  GEMINI_API_KEY          Google Gemini API key
  EDGEQUAKE_LLM_PROVIDER  Override provider (openai, anthropic, gemini, ollama)
  EDGEQUAKE_MODEL         Override model ID
  PDFIUM_LIB_PATH         Path to an existing libpdfium, skips auto-download
  RUST_LOG                Log filter, overrides --verbose/--quiet

RESUMING:
  Every unit of work is recorded in <work-dir>/<title>/*_progress.json.
  Re-running the same command skips done units and retries the rest.
  A unit that still fails after its retries makes the command exit non-zero.
"#;

/// Resumable PDF to EPUB generation and EPUB translation with LLMs.
#[derive(Parser, Debug)]
#[command(
    name = "pdf2epub",
    version,
    about = "Resumable PDF to EPUB generation and EPUB translation with LLMs",
    arg_required_else_help = true,
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// YAML configuration file. Flags override its values.
    #[arg(short, long, global = true, env = "PDF2EPUB_CONFIG")]
    config: Option<PathBuf>,

    /// Book title; names the job directory. Default: input file stem.
    #[arg(long, global = true, env = "PDF2EPUB_TITLE")]
    title: Option<String>,

    /// Author written into the EPUB metadata.
    #[arg(long, global = true)]
    author: Option<String>,

    /// Root directory of all jobs.
    #[arg(long, global = true, env = "PDF2EPUB_WORK_DIR")]
    work_dir: Option<PathBuf>,

    /// Shared directory mirrored before and after every unit.
    #[arg(long, global = true, env = "PDF2EPUB_REMOTE_DIR")]
    remote_dir: Option<PathBuf>,

    /// LLM model ID (e.g. gpt-4.1-nano, gpt-4.1, claude-sonnet-4-20250514).
    #[arg(long, global = true, env = "EDGEQUAKE_MODEL")]
    model: Option<String>,

    /// LLM provider: openai, anthropic, gemini, ollama, azure.
    #[arg(long, global = true, env = "EDGEQUAKE_PROVIDER")]
    provider: Option<String>,

    /// Retries after the first attempt of each call.
    #[arg(long, global = true, env = "PDF2EPUB_MAX_RETRIES")]
    max_retries: Option<u32>,

    /// Upper bound in seconds for a single backoff wait.
    #[arg(long, global = true)]
    max_backoff: Option<u64>,

    /// Per-call timeout in seconds.
    #[arg(long, global = true, env = "PDF2EPUB_API_TIMEOUT")]
    api_timeout: Option<u64>,

    /// Also write logs to <job>/logs/process.log.
    #[arg(long, global = true)]
    log_file: bool,

    /// Disable progress bar.
    #[arg(long, global = true, env = "PDF2EPUB_NO_PROGRESS")]
    no_progress: bool,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long, global = true, env = "PDF2EPUB_VERBOSE")]
    verbose: bool,

    /// Suppress all output except errors.
    #[arg(short, long, global = true)]
    quiet: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Derive the book outline from the PDF.
    Extract {
        /// Local PDF path or HTTP/HTTPS URL. Optional once pinned in the job.
        input: Option<String>,

        #[command(flatten)]
        render: RenderArgs,
    },

    /// Build the EPUB, chapter by chapter.
    Generate {
        /// Local PDF path or HTTP/HTTPS URL. Optional once pinned in the job.
        input: Option<String>,

        #[command(flatten)]
        render: RenderArgs,

        /// Chapters generated in parallel.
        #[arg(short = 'j', long, env = "PDF2EPUB_CONCURRENCY")]
        concurrency: Option<usize>,
    },

    /// Translate the generated EPUB, or the given one.
    Translate {
        /// EPUB to translate. Default: the book generated for this job.
        epub: Option<PathBuf>,

        #[arg(long)]
        source_language: Option<String>,

        #[arg(long)]
        target_language: Option<String>,

        /// Use this translated title instead of asking the model.
        #[arg(long)]
        target_title: Option<String>,

        /// Characters of preceding text sent as context (0 disables).
        #[arg(long)]
        previous_content_limit: Option<usize>,

        /// Accept translations whose tag structure differs, with a warning.
        #[arg(long)]
        lenient: bool,
    },

    /// Print ledger state. Calls no service.
    Status {
        /// Print JSON instead of text.
        #[arg(long)]
        json: bool,
    },
}

#[derive(clap::Args, Debug)]
struct RenderArgs {
    /// Rendering DPI (72–400).
    #[arg(long, env = "PDF2EPUB_DPI",
          value_parser = clap::value_parser!(u32).range(72..=400))]
    dpi: Option<u32>,

    /// Pages rendered around each chapter's range.
    #[arg(long)]
    page_buffer: Option<usize>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = build_config(&cli)?;
    let paths = JobPaths::new(&config.work_dir, &config.job_id());

    // ── Logging setup ────────────────────────────────────────────────────
    // Suppress INFO-level library logs on stderr when the progress bar is
    // active; the log file, when enabled, keeps them.
    let show_progress = !cli.quiet && !cli.no_progress && !matches!(cli.command, Command::Status { .. });
    let filter = if cli.verbose {
        "debug"
    } else if cli.quiet || show_progress {
        "error"
    } else {
        "info"
    };
    let stderr_layer = fmt::layer().with_writer(io::stderr).with_filter(
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
    );
    let file_layer = if cli.log_file {
        let path = paths.log_file();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("Failed to open log file {}", path.display()))?;
        let level = if cli.verbose { "debug" } else { "info" };
        Some(
            fmt::layer()
                .with_ansi(false)
                .with_writer(Mutex::new(file))
                .with_filter(EnvFilter::new(level)),
        )
    } else {
        None
    };
    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(file_layer)
        .init();

    if let Command::Status { json } = cli.command {
        let status = run::status(&config).await.context("Failed to read job state")?;
        if json {
            println!(
                "{}",
                serde_json::to_string_pretty(&status).context("Failed to serialise status")?
            );
        } else {
            println!("Job:        {}", status.job_id);
            println!("Directory:  {}", status.root.display());
            match status.structure_sections {
                Some(n) => println!("Structure:  {n} sections"),
                None => println!("Structure:  not extracted"),
            }
            for stage in &status.stages {
                println!(
                    "{:<11} {} pending, {} in progress, {} done, {} failed",
                    format!("{}:", stage.stage),
                    stage.counts.pending,
                    stage.counts.in_progress,
                    stage.counts.done,
                    stage.counts.failed
                );
                for (id, error) in &stage.failed {
                    println!("  {} {id}: {error}", red("✗"));
                }
            }
        }
        return Ok(());
    }

    let mut job = Job::new(config.clone(), run::model_service(&config)?);
    if show_progress {
        job = job.with_observer(CliObserver::new());
    }

    let report = match &cli.command {
        Command::Extract { input, .. } => {
            ensure_pdfium(cli.quiet)?;
            let structure = run::run_extract(&job, input.as_deref())
                .await
                .context("Structure extraction failed")?;
            if !cli.quiet {
                eprintln!(
                    "{} {} sections  →  {}",
                    green("✔"),
                    bold(&structure.sections.len().to_string()),
                    bold(&paths.structure().display().to_string())
                );
            }
            return Ok(());
        }
        Command::Generate { input, .. } => {
            ensure_pdfium(cli.quiet)?;
            run::run_generate(&job, input.as_deref())
                .await
                .context("Generation failed")?
        }
        Command::Translate { epub, .. } => run::run_translate(&job, epub.as_deref())
            .await
            .context("Translation failed")?,
        Command::Status { .. } => return Ok(()),
    };

    if !cli.quiet {
        print_report(&report);
    }
    report.into_result()?;
    Ok(())
}

fn print_report(report: &StageReport) {
    let mark = if report.is_success() {
        green("✔")
    } else {
        cyan("⚠")
    };
    eprintln!("{mark} {}", report.summary());
    if let Some(ref artifact) = report.artifact {
        eprintln!("   →  {}", bold(&artifact.display().to_string()));
    }
    eprintln!(
        "   {} attempts  /  {}ms",
        dim(&report.attempts.to_string()),
        report.duration_ms
    );
    for failed in &report.failed {
        eprintln!("   {} {}: {}", red("✗"), failed.id, failed.error);
    }
}

/// Make sure the pdfium shared library is available before rendering.
///
/// The first run downloads it (~30 MB) into the user cache directory;
/// later runs only check the path.
fn ensure_pdfium(quiet: bool) -> Result<()> {
    if !pdfium_auto::is_pdfium_cached() {
        if !quiet {
            let dl_bar = ProgressBar::new(0);
            dl_bar.set_style(
                ProgressStyle::with_template(
                    "{spinner:.cyan} {prefix:.bold}  \
                     [{bar:42.green/238}] {bytes}/{total_bytes}  ETA {eta_precise}",
                )
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("█▉▊▋▌▍▎▏  ")
                .tick_strings(TICKS),
            );
            dl_bar.set_prefix("PDF engine");
            dl_bar.enable_steady_tick(Duration::from_millis(80));

            let bar = dl_bar.clone();
            tokio::task::block_in_place(|| {
                pdfium_auto::ensure_pdfium_library(Some(&|downloaded, total| {
                    if let Some(t) = total {
                        if bar.length().unwrap_or(0) != t {
                            bar.set_length(t);
                        }
                    }
                    bar.set_position(downloaded);
                }))
            })
            .context("Failed to download PDFium engine")?;

            dl_bar.finish_with_message("ready ✓");
        } else {
            tokio::task::block_in_place(|| pdfium_auto::ensure_pdfium_library(None))
                .context("Failed to download PDFium engine")?;
        }
    }
    Ok(())
}

/// Map the config file and CLI flags to `JobConfig`.
fn build_config(cli: &Cli) -> Result<JobConfig> {
    let base = match cli.config {
        Some(ref path) => JobConfig::from_yaml_file(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => JobConfig::default(),
    };
    let mut builder = JobConfigBuilder::from_config(base.clone());

    if let Some(ref title) = cli.title {
        builder = builder.title(title);
    } else if base.title.trim().is_empty() {
        if let Some(stem) = default_title(&cli.command) {
            builder = builder.title(stem);
        }
    }
    if let Some(ref author) = cli.author {
        builder = builder.author(author);
    }
    if let Some(ref dir) = cli.work_dir {
        builder = builder.work_dir(dir);
    }
    if let Some(ref dir) = cli.remote_dir {
        builder = builder.remote_dir(dir);
    }
    if let Some(ref model) = cli.model {
        builder = builder.model(model);
    }
    if let Some(ref provider) = cli.provider {
        builder = builder.provider(provider);
    }
    if let Some(n) = cli.max_retries {
        builder = builder.num_retries(n);
    }
    if let Some(secs) = cli.max_backoff {
        builder = builder.max_backoff_seconds(secs);
    }
    if let Some(secs) = cli.api_timeout {
        builder = builder.api_timeout_secs(secs);
    }

    match &cli.command {
        Command::Extract { render, .. } => builder = apply_render(builder, render),
        Command::Generate {
            render,
            concurrency,
            ..
        } => {
            builder = apply_render(builder, render);
            if let Some(n) = concurrency {
                builder = builder.concurrency(*n);
            }
        }
        Command::Translate {
            source_language,
            target_language,
            target_title,
            previous_content_limit,
            lenient,
            ..
        } => {
            if let Some(lang) = source_language {
                builder = builder.source_language(lang);
            }
            if let Some(lang) = target_language {
                builder = builder.target_language(lang);
            }
            if let Some(title) = target_title {
                builder = builder.target_title(title);
            }
            if let Some(limit) = previous_content_limit {
                builder = builder.previous_content_limit(*limit);
            }
            if *lenient {
                builder = builder.structure_check(StructureCheck::Lenient);
            }
        }
        Command::Status { .. } => {}
    }

    let config = builder.build().context("Invalid configuration")?;
    if config.title.trim().is_empty() {
        anyhow::bail!("No book title: pass --title or an input file");
    }
    Ok(config)
}

fn apply_render(mut builder: JobConfigBuilder, render: &RenderArgs) -> JobConfigBuilder {
    if let Some(dpi) = render.dpi {
        builder = builder.dpi(dpi);
    }
    if let Some(pages) = render.page_buffer {
        builder = builder.page_buffer(pages);
    }
    builder
}

/// Title implied by the positional input of a mode.
fn default_title(command: &Command) -> Option<String> {
    let stem = match command {
        Command::Extract { input, .. } | Command::Generate { input, .. } => {
            input_stem(input.as_deref()?)
        }
        Command::Translate { epub, .. } => {
            epub.as_deref()?.file_stem()?.to_string_lossy().into_owned()
        }
        Command::Status { .. } => return None,
    };
    (!stem.is_empty()).then_some(stem)
}
