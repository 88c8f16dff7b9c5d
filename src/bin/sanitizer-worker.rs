//! Conversion worker binary, run inside the sandbox.
//!
//! Speaks the wire protocol on stdin/stdout, prints progress as JSON lines on
//! stderr and reports failures through its exit status (`128 + N`).

use clap::{Parser, ValueEnum};
use docsanitize::{worker, Phase};
use std::io;
use tracing_subscriber::EnvFilter;

#[derive(ValueEnum, Clone, Copy, Debug)]
enum PhaseArg {
    /// Untrusted document on stdin → pixel stream on stdout.
    DocumentToPixels,
    /// Pixel stream on stdin (or PIXELS_DIR) → PDF on stdout (or SAFE_OUTPUT_DIR).
    PixelsToPdf,
}

impl From<PhaseArg> for Phase {
    fn from(v: PhaseArg) -> Self {
        match v {
            PhaseArg::DocumentToPixels => Phase::DocumentToPixels,
            PhaseArg::PixelsToPdf => Phase::PixelsToPdf,
        }
    }
}

/// Sandboxed half of docsanitize. Not meant to be run by hand.
#[derive(Parser, Debug)]
#[command(name = "sanitizer-worker", version)]
struct Cli {
    /// Which phase to run.
    #[arg(value_enum)]
    phase: PhaseArg,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(io::stderr)
        .with_ansi(false)
        .init();

    let code = worker::run(cli.phase.into()).await;
    std::process::exit(code);
}
