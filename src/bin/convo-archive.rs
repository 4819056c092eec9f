//! CLI binary for convo-archiver.
//!
//! A thin shim over the library crate that maps CLI flags to `ArchiveConfig`,
//! dispatches one add-page job and reports its outcome.

use anyhow::{bail, Context, Result};
use clap::Parser;
use convo_archiver::pipeline::markdown::available_themes;
use convo_archiver::{
    inspect, ArchiveConfig, Archiver, JobStage, PageRequest, ScratchPolicy, StageCallback,
    StageHandle,
};
use indicatif::{ProgressBar, ProgressStyle};
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

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

// ── CLI stage callback using indicatif ───────────────────────────────────────

/// Terminal spinner that follows the job through its stages.
struct CliStageCallback {
    bar: ProgressBar,
}

impl CliStageCallback {
    fn new() -> Arc<Self> {
        let bar = ProgressBar::new_spinner();
        let style = ProgressStyle::with_template("{spinner:.cyan} {prefix:.bold}  {msg}  {elapsed:.dim}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
            .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "⠿"]);
        bar.set_style(style);
        bar.set_prefix("Adding page");
        bar.set_message("Preparing…");
        bar.enable_steady_tick(Duration::from_millis(80));
        Arc::new(Self { bar })
    }
}

impl StageCallback for CliStageCallback {
    fn on_stage(&self, stage: JobStage) {
        if stage.is_terminal() {
            self.bar.finish_and_clear();
        } else if stage.is_in_flight() {
            self.bar.set_message(format!("{stage}…"));
        }
    }

    fn on_job_error(&self, failed_stage: JobStage, _error: &str) {
        eprintln!("{} failed while {}", red("✘"), failed_stage);
    }
}

const AFTER_HELP: &str = r#"EXAMPLES:
  # Append one exchange to an archive (created if missing)
  convo-archive chat.pdf --user "What is Rust?" --model-file answer.md

  # Read the model response from stdin
  pbpaste | convo-archive chat.pdf --user "Summarise this" --model-file -

  # Write the merged archive elsewhere, keep the original untouched
  convo-archive chat.pdf --user-file q.md --model-file a.md -o chat-v2.pdf

  # Inspect an archive (no browser needed)
  convo-archive --inspect-only chat.pdf

  # Show the code highlighting themes accepted by --theme
  convo-archive --list-themes

ENVIRONMENT VARIABLES:
  CHROME                  Path to a Chrome/Chromium binary
  RUST_LOG                Override the log filter (e.g. convo_archiver=debug)
  CONVO_ARCHIVE_*         Every flag can also be set through its env variable

SETUP:
  A Chrome or Chromium installation is required for rendering. When it is not
  found in the usual locations, pass --chrome or set CHROME.
"#;

/// Append AI conversation exchanges to a PDF archive.
#[derive(Parser, Debug)]
#[command(
    name = "convo-archive",
    version,
    about = "Append AI conversation exchanges to a PDF archive",
    long_about = "Render a user message and a model response as a styled A4 page (Markdown, \
code highlighting, emoji, math) in headless Chrome and append it to a PDF archive.",
    arg_required_else_help = true,
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    /// The PDF archive to append to. Created if it does not exist.
    #[arg(required_unless_present = "list_themes")]
    archive: Option<PathBuf>,

    /// The user's message (Markdown).
    #[arg(long, env = "CONVO_ARCHIVE_USER", conflicts_with = "user_file")]
    user: Option<String>,

    /// Read the user's message from a file (`-` for stdin).
    #[arg(long, env = "CONVO_ARCHIVE_USER_FILE")]
    user_file: Option<PathBuf>,

    /// The model's response (Markdown).
    #[arg(long, env = "CONVO_ARCHIVE_MODEL", conflicts_with = "model_file")]
    model: Option<String>,

    /// Read the model's response from a file (`-` for stdin).
    #[arg(long, env = "CONVO_ARCHIVE_MODEL_FILE")]
    model_file: Option<PathBuf>,

    /// Write the merged archive here instead of updating ARCHIVE in place.
    #[arg(short, long, env = "CONVO_ARCHIVE_OUTPUT")]
    output: Option<PathBuf>,

    /// Omit the section headings.
    #[arg(long, env = "CONVO_ARCHIVE_NO_HEADINGS")]
    no_headings: bool,

    /// Heading above the user's message.
    #[arg(long, env = "CONVO_ARCHIVE_USER_HEADING", default_value = "User Message")]
    user_heading: String,

    /// Heading above the model's response.
    #[arg(long, env = "CONVO_ARCHIVE_MODEL_HEADING", default_value = "Model Response")]
    model_heading: String,

    /// CSS file replacing the built-in stylesheet.
    #[arg(long, env = "CONVO_ARCHIVE_STYLESHEET")]
    stylesheet: Option<PathBuf>,

    /// Do not load Google Fonts (fully offline rendering).
    #[arg(long, env = "CONVO_ARCHIVE_NO_WEB_FONTS")]
    no_web_fonts: bool,

    /// Do not typeset $…$ math with MathJax.
    #[arg(long, env = "CONVO_ARCHIVE_NO_MATH")]
    no_math: bool,

    /// Syntax highlighting theme for code blocks.
    #[arg(long, env = "CONVO_ARCHIVE_THEME", default_value = "InspiredGitHub")]
    theme: String,

    /// Directory for the scratch HTML/PDF files.
    #[arg(long, env = "CONVO_ARCHIVE_WORK_DIR", default_value = ".")]
    work_dir: PathBuf,

    /// Use a private scratch directory per job instead of fixed file names.
    #[arg(long, env = "CONVO_ARCHIVE_PER_JOB_SCRATCH")]
    per_job_scratch: bool,

    /// Chrome/Chromium executable.
    #[arg(long, env = "CONVO_ARCHIVE_CHROME")]
    chrome: Option<PathBuf>,

    /// Launch Chrome with --no-sandbox (needed in some containers).
    #[arg(long, env = "CONVO_ARCHIVE_NO_SANDBOX")]
    no_sandbox: bool,

    /// Seconds allowed for Chrome to start.
    #[arg(long, env = "CONVO_ARCHIVE_LAUNCH_TIMEOUT", default_value_t = 30,
          value_parser = clap::value_parser!(u64).range(1..))]
    launch_timeout: u64,

    /// Seconds allowed for loading and printing the page.
    #[arg(long, env = "CONVO_ARCHIVE_RENDER_TIMEOUT", default_value_t = 60,
          value_parser = clap::value_parser!(u64).range(1..))]
    render_timeout: u64,

    /// Print archive metadata only, add nothing.
    #[arg(long)]
    inspect_only: bool,

    /// List the syntax highlighting themes and exit.
    #[arg(long)]
    list_themes: bool,

    /// Output structured JSON (JobReport / ArchiveMetadata).
    #[arg(long, env = "CONVO_ARCHIVE_JSON")]
    json: bool,

    /// Disable the progress spinner.
    #[arg(long, env = "CONVO_ARCHIVE_NO_PROGRESS")]
    no_progress: bool,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long, env = "CONVO_ARCHIVE_VERBOSE")]
    verbose: bool,

    /// Suppress all output except errors.
    #[arg(short, long, env = "CONVO_ARCHIVE_QUIET")]
    quiet: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if cli.list_themes {
        for theme in available_themes() {
            println!("{theme}");
        }
        return Ok(());
    }
    let Some(archive) = cli.archive.clone() else {
        bail!("ARCHIVE is required");
    };

    // ── Logging setup ────────────────────────────────────────────────────
    // The spinner already says what is happening; INFO logs would tear it.
    let show_progress = !cli.quiet && !cli.no_progress && !cli.json && !cli.inspect_only;
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

    // ── Inspect-only mode ────────────────────────────────────────────────
    if cli.inspect_only {
        let meta = inspect(&archive)
            .await
            .context("Failed to inspect archive")?;

        if cli.json {
            println!(
                "{}",
                serde_json::to_string_pretty(&meta).context("Failed to serialize metadata")?
            );
        } else {
            println!("File:         {}", archive.display());
            if let Some(ref t) = meta.title {
                println!("Title:        {}", t);
            }
            if let Some(ref a) = meta.author {
                println!("Author:       {}", a);
            }
            println!("Pages:        {}", meta.page_count);
            println!("PDF Version:  {}", meta.pdf_version);
            println!("Encrypted:    {}", meta.is_encrypted);
            println!("Size:         {} bytes", meta.file_size);
            if let Some(ref p) = meta.producer {
                println!("Producer:     {}", p);
            }
            if let Some(ref c) = meta.creator {
                println!("Creator:      {}", c);
            }
        }
        return Ok(());
    }

    // ── Collect input ────────────────────────────────────────────────────
    if is_stdin(cli.user_file.as_deref()) && is_stdin(cli.model_file.as_deref()) {
        bail!("Only one of --user-file and --model-file can read from stdin");
    }
    let user_text = read_text(cli.user.as_deref(), cli.user_file.as_deref())?;
    let model_text = read_text(cli.model.as_deref(), cli.model_file.as_deref())?;
    let request = PageRequest::new(user_text, model_text);
    if request.is_empty() {
        bail!("Both text boxes are empty; pass --user/--user-file and/or --model/--model-file");
    }

    // ── Build config & dispatch ──────────────────────────────────────────
    let stage_cb: Option<StageHandle> = if show_progress {
        Some(CliStageCallback::new() as Arc<dyn StageCallback>)
    } else {
        None
    };
    let config = build_config(&cli, stage_cb)?;

    let archiver = Arc::new(Archiver::new(&archive, config));
    let job = archiver.spawn_job(request)?;
    let report = job.await.context("Add-page task failed")??;

    // ── Report ───────────────────────────────────────────────────────────
    if cli.json {
        println!(
            "{}",
            serde_json::to_string_pretty(&report).context("Failed to serialise report")?
        );
    } else if !cli.quiet {
        println!("{} {}", green("✔"), bold(&report.message()));
        eprintln!(
            "   {}",
            dim(&format!(
                "generate {}ms  ·  render {}ms  ·  merge {}ms  ·  {}ms total",
                report.generate_ms, report.render_ms, report.merge_ms, report.total_ms
            ))
        );
    }

    Ok(())
}

/// Map CLI args to `ArchiveConfig`.
fn build_config(cli: &Cli, stage_cb: Option<StageHandle>) -> Result<ArchiveConfig> {
    let mut builder = ArchiveConfig::builder()
        .work_dir(&cli.work_dir)
        .scratch(if cli.per_job_scratch {
            ScratchPolicy::PerJob
        } else {
            ScratchPolicy::Fixed
        })
        .show_headings(!cli.no_headings)
        .user_heading(&cli.user_heading)
        .model_heading(&cli.model_heading)
        .web_fonts(!cli.no_web_fonts)
        .math(!cli.no_math)
        .highlight_theme(&cli.theme)
        .sandbox(!cli.no_sandbox)
        .launch_timeout_secs(cli.launch_timeout)
        .render_timeout_secs(cli.render_timeout);

    if let Some(ref path) = cli.output {
        builder = builder.output(path);
    }
    if let Some(ref path) = cli.stylesheet {
        builder = builder.stylesheet(path);
    }
    if let Some(ref path) = cli.chrome {
        builder = builder.chrome_path(path);
    }
    if let Some(cb) = stage_cb {
        builder = builder.stage_callback(cb);
    }

    builder.build().context("Invalid configuration")
}

fn is_stdin(path: Option<&Path>) -> bool {
    path.is_some_and(|p| p.as_os_str() == "-")
}

/// Inline text wins; otherwise read the file (or stdin for `-`).
fn read_text(inline: Option<&str>, file: Option<&Path>) -> Result<String> {
    if let Some(text) = inline {
        return Ok(text.to_string());
    }
    match file {
        None => Ok(String::new()),
        Some(path) if is_stdin(Some(path)) => {
            let mut buf = String::new();
            io::stdin()
                .read_to_string(&mut buf)
                .context("Failed to read from stdin")?;
            Ok(buf)
        }
        Some(path) => std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display())),
    }
}
