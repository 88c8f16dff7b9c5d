//! CLI binary for docsanitize.
//!
//! A thin shim over the library crate that maps CLI flags to
//! `SanitizerConfig` and an isolation provider, then runs the batch.

use anyhow::{bail, Context, Result};
use clap::Parser;
use docsanitize::{
    sanitize_documents_with_cancel, BatchCounts, CancellationToken, ContainerConfig,
    ContainerProvider, ContainerRuntime, DisposableVmConfig, DisposableVmProvider, Document,
    DocumentState, DummyConfig, DummyProvider, IsolationProvider, PixelTransport, ProgressEvent,
    SanitizeProgressCallback, Sanitizer, SanitizerConfig,
};
use indicatif::{ProgressBar, ProgressStyle};
use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::{Arc, Mutex};
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

// ── CLI progress callback using indicatif ────────────────────────────────────

/// One bar for the whole batch. Each document contributes up to 100 units,
/// following the percentages its worker reports.
struct CliProgressCallback {
    bar: ProgressBar,
    names: HashMap<String, String>,
    percent: Mutex<HashMap<String, f32>>,
}

impl CliProgressCallback {
    fn new(names: HashMap<String, String>) -> Arc<Self> {
        let bar = ProgressBar::new(0);
        let style = ProgressStyle::with_template(
            "{spinner:.cyan} {prefix:.bold}  \
             [{bar:42.green/238}] {percent:>3}%  ⏱ {elapsed_precise}  {msg}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("█▉▊▋▌▍▎▏  ")
        .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "⠿"]);
        bar.set_style(style);
        bar.set_prefix("Sanitizing");
        bar.enable_steady_tick(Duration::from_millis(80));
        Arc::new(Self {
            bar,
            names,
            percent: Mutex::new(HashMap::new()),
        })
    }

    fn name<'a>(&'a self, doc_id: &'a str) -> &'a str {
        self.names.get(doc_id).map(String::as_str).unwrap_or(doc_id)
    }

    fn set_percent(&self, doc_id: &str, value: f32) {
        let mut percent = self.percent.lock().unwrap_or_else(|e| e.into_inner());
        percent.insert(doc_id.to_string(), value);
        let total: f32 = percent.values().sum();
        self.bar.set_position(total as u64);
    }
}

impl SanitizeProgressCallback for CliProgressCallback {
    fn on_batch_start(&self, total_documents: usize) {
        self.bar.set_length(total_documents as u64 * 100);
    }

    fn on_state_change(&self, doc_id: &str, state: DocumentState) {
        match state {
            DocumentState::Safe => {
                self.set_percent(doc_id, 100.0);
                self.bar
                    .println(format!("  {} {}", green("✓"), self.name(doc_id)));
            }
            DocumentState::Failed => {
                self.set_percent(doc_id, 100.0);
            }
            _ => {}
        }
    }

    fn on_progress(&self, doc_id: &str, event: &ProgressEvent) {
        if event.error {
            self.bar.println(format!(
                "  {} {}  {}",
                red("✗"),
                self.name(doc_id),
                red(&event.text)
            ));
            return;
        }
        self.set_percent(doc_id, event.percentage);
        self.bar.set_message(format!("{}: {}", self.name(doc_id), event.text));
    }

    fn on_batch_complete(&self, safe: usize, failed: usize) {
        self.bar.finish_and_clear();
        if failed == 0 {
            eprintln!("{} {} documents sanitized", green("✔"), bold(&safe.to_string()));
        } else {
            eprintln!(
                "{} {} sanitized, {} failed",
                red("✘"),
                bold(&safe.to_string()),
                red(&failed.to_string())
            );
        }
    }
}

const AFTER_HELP: &str = r#"EXAMPLES:
  # Sanitize one document next to the original (report-safe.pdf)
  docsanitize report.docx

  # Choose the output file
  docsanitize suspicious.pdf -o clean.pdf

  # A whole batch into another directory, with an English text layer
  docsanitize --output-dir ~/safe --ocr-lang eng *.pdf *.docx

  # Move the originals into ./unsafe/ once converted
  docsanitize --archive invoices/*.xlsx

  # Inside a Qubes OS qube
  docsanitize --backend qubes attachment.odt

ENVIRONMENT VARIABLES:
  DOCSANITIZE_BACKEND     Isolation backend (container, qubes, dummy)
  DOCSANITIZE_RUNTIME     Container runtime (podman, docker)
  DOCSANITIZE_IMAGE       Worker container image
  DOCSANITIZE_OCR_LANG    OCR language code or name
  RUST_LOG                Log filter, overrides -v / -q
"#;

#[derive(clap::ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum BackendArg {
    Container,
    Qubes,
    Dummy,
}

/// Convert untrusted documents into safe, image-only PDFs.
#[derive(Parser, Debug)]
#[command(
    name = "docsanitize",
    version,
    about = "Convert untrusted documents into safe, image-only PDFs",
    long_about = "Render untrusted documents (PDF, office files, images) to pixels inside a \
sandbox, then rebuild a flat PDF from those pixels inside a second sandbox. Nothing from the \
original file survives the conversion.",
    arg_required_else_help = true,
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    /// Documents to sanitize.
    #[arg(required = true)]
    inputs: Vec<PathBuf>,

    /// Output file (single document only).
    #[arg(short, long, env = "DOCSANITIZE_OUTPUT")]
    output: Option<PathBuf>,

    /// Write safe PDFs into this directory.
    #[arg(long, env = "DOCSANITIZE_OUTPUT_DIR")]
    output_dir: Option<PathBuf>,

    /// Suffix of default output names.
    #[arg(long, env = "DOCSANITIZE_SUFFIX")]
    suffix: Option<String>,

    /// Move originals into an `unsafe/` directory after conversion.
    #[arg(long, env = "DOCSANITIZE_ARCHIVE")]
    archive: bool,

    /// Add a text layer in this language (code or name, e.g. `eng`).
    #[arg(long, env = "DOCSANITIZE_OCR_LANG")]
    ocr_lang: Option<String>,

    /// Isolation backend.
    #[arg(long, env = "DOCSANITIZE_BACKEND", value_enum, default_value = "container")]
    backend: BackendArg,

    /// Container runtime; auto-detected when unset.
    #[arg(long, env = "DOCSANITIZE_RUNTIME")]
    runtime: Option<ContainerRuntime>,

    /// Verified worker image.
    #[arg(long, env = "DOCSANITIZE_IMAGE")]
    image: Option<String>,

    /// Custom seccomp profile for the containers.
    #[arg(long, env = "DOCSANITIZE_SECCOMP_PROFILE")]
    seccomp_profile: Option<PathBuf>,

    /// Disposable VM template (qubes backend).
    #[arg(long, env = "DOCSANITIZE_DVM_TEMPLATE")]
    dvm_template: Option<String>,

    /// Worker binary run unsandboxed by the dummy backend.
    #[arg(long, env = "DOCSANITIZE_WORKER", default_value = "sanitizer-worker")]
    worker: PathBuf,

    /// Confirm that the dummy backend performs no isolation at all.
    #[arg(long)]
    i_understand_the_dummy_backend_is_unsafe: bool,

    /// Documents converted at once; defaults to what the backend supports.
    #[arg(short = 'j', long, env = "DOCSANITIZE_MAX_PARALLEL")]
    max_parallel: Option<usize>,

    /// Disable every timeout (debugging only).
    #[arg(long, env = "DOCSANITIZE_NO_TIMEOUTS")]
    no_timeouts: bool,

    /// Directory for per-document scratch space.
    #[arg(long, env = "DOCSANITIZE_WORK_DIR")]
    work_dir: Option<PathBuf>,

    /// Log the sandbox's diagnostic output.
    #[arg(long, env = "DOCSANITIZE_CAPTURE_OUTPUT")]
    capture_output: bool,

    /// Disable progress bar.
    #[arg(long, env = "DOCSANITIZE_NO_PROGRESS")]
    no_progress: bool,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long, env = "DOCSANITIZE_VERBOSE")]
    verbose: bool,

    /// Suppress all output except errors.
    #[arg(short, long, env = "DOCSANITIZE_QUIET")]
    quiet: bool,
}

fn build_provider(cli: &Cli) -> Result<Arc<dyn IsolationProvider>> {
    Ok(match cli.backend {
        BackendArg::Container => {
            let mut config = ContainerConfig {
                runtime: cli.runtime,
                seccomp_profile: cli.seccomp_profile.clone(),
                ..ContainerConfig::default()
            };
            if let Some(image) = &cli.image {
                config.image = image.clone();
            }
            Arc::new(ContainerProvider::new(config)?)
        }
        BackendArg::Qubes => {
            let mut config = DisposableVmConfig::default();
            if let Some(template) = &cli.dvm_template {
                config.template = template.clone();
            }
            Arc::new(DisposableVmProvider::new(config))
        }
        BackendArg::Dummy => Arc::new(DummyProvider::new(DummyConfig {
            acknowledge_unsafe: cli.i_understand_the_dummy_backend_is_unsafe,
            worker_program: cli.worker.clone(),
            transport: PixelTransport::Stream,
            ..DummyConfig::default()
        })?),
    })
}

fn build_documents(cli: &Cli) -> Result<Vec<Document>> {
    if cli.output.is_some() && cli.inputs.len() > 1 {
        bail!("--output can only be used with a single input document");
    }
    let mut docs = Vec::with_capacity(cli.inputs.len());
    for input in &cli.inputs {
        let mut doc = match &cli.output {
            Some(output) => Document::with_output(input, output)?,
            None => Document::new(input)?,
        };
        if let Some(suffix) = &cli.suffix {
            doc.set_suffix(suffix.clone())?;
        }
        if let Some(dir) = &cli.output_dir {
            doc.set_output_dir(dir)?;
        }
        doc.set_archive_after_conversion(cli.archive);
        docs.push(doc);
    }
    Ok(docs)
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    // ── Logging setup ────────────────────────────────────────────────────
    // The progress bar replaces INFO-level logs unless -v is given.
    let show_progress = !cli.quiet && !cli.no_progress;
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

    // ── Documents and backend ────────────────────────────────────────────
    let documents = build_documents(&cli).context("Invalid input")?;
    let provider = build_provider(&cli).context("Isolation backend unavailable")?;

    // ── Build config ─────────────────────────────────────────────────────
    let mut builder = SanitizerConfig::builder().capture_stderr(cli.capture_output);
    if let Some(lang) = &cli.ocr_lang {
        builder = builder.ocr_language(lang);
    }
    if let Some(n) = cli.max_parallel {
        builder = builder.max_parallel(n);
    }
    if let Some(dir) = &cli.work_dir {
        builder = builder.work_root(dir);
    }
    if cli.no_timeouts {
        builder = builder.disable_timeouts();
    }
    if show_progress {
        let names = documents
            .iter()
            .map(|d| {
                let name = d
                    .input_path()
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| d.id().to_string());
                (d.id().to_string(), name)
            })
            .collect();
        builder = builder.progress_callback(CliProgressCallback::new(names));
    }
    let config = Arc::new(builder.build().context("Invalid configuration")?);
    let sanitizer = Sanitizer::new(provider, config);

    // ── Ctrl-C cancels the batch ─────────────────────────────────────────
    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            on_signal.cancel();
        }
    });

    // ── Convert ──────────────────────────────────────────────────────────
    let documents = sanitize_documents_with_cancel(&sanitizer, documents, cancel).await;

    // ── Report ───────────────────────────────────────────────────────────
    if !cli.quiet {
        for doc in &documents {
            match doc.failure() {
                None => eprintln!(
                    "{} {} → {}",
                    green("✓"),
                    doc.input_path().display(),
                    doc.output_path().display()
                ),
                Some(e) => eprintln!(
                    "{} {}  {}",
                    red("✗"),
                    doc.input_path().display(),
                    dim(&e.user_message())
                ),
            }
        }
    }
    let counts = BatchCounts::of(&documents);
    Ok(if counts.failed == 0 {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}
