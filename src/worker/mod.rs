//! The conversion worker that runs inside the sandbox.
//!
//! ```text
//! sanitizer-worker document-to-pixels   untrusted document (stdin) → pixels (stdout)
//! sanitizer-worker pixels-to-pdf        pixels (stdin or PIXELS_DIR) → flat PDF
//! ```
//!
//! The worker talks to the host through three channels only:
//!
//! * **stdout**: the wire protocol (phase A) or the PDF bytes (phase B).
//! * **stderr**: JSON progress records and free-form log lines, treated by
//!   the host as untrusted text.
//! * **exit status**: `0` or `128 + N` for the [`ConversionError`] that
//!   stopped the phase. This is the only failure signal the host acts on.
//!
//! Job parameters arrive through the environment (`OCR`, `OCR_LANGUAGE`,
//! `ENABLE_TIMEOUTS`, `PIXELS_DIR`, `SAFE_OUTPUT_DIR`), never through the
//! argument list.

pub mod command;
pub mod doc_to_pixels;
pub mod mime;
pub mod pixels_to_pdf;
pub mod render;

use crate::error::ConversionError;
use crate::isolation::Phase;
use crate::ocr::OcrLanguage;
use crate::progress::ProgressEvent;
use crate::timeout::TimeoutPolicy;
use std::io::Write;
use std::path::PathBuf;
use tracing::{error, warn};

pub const OCR_ENV: &str = "OCR";
pub const OCR_LANGUAGE_ENV: &str = "OCR_LANGUAGE";
pub const PIXELS_DIR_ENV: &str = "PIXELS_DIR";
pub const SAFE_OUTPUT_DIR_ENV: &str = "SAFE_OUTPUT_DIR";
/// Set by qrexec to the part of the service name after `+`.
pub const QREXEC_ARGUMENT_ENV: &str = "QREXEC_SERVICE_ARGUMENT";

/// Parameters of one worker run.
#[derive(Debug, Clone, Default)]
pub struct WorkerEnv {
    pub ocr_language: Option<OcrLanguage>,
    pub timeouts: TimeoutPolicy,
    /// Read pages from here instead of stdin.
    pub pixels_dir: Option<PathBuf>,
    /// Write the PDF here instead of stdout.
    pub safe_output_dir: Option<PathBuf>,
}

impl WorkerEnv {
    /// Read the job parameters from the process environment.
    ///
    /// An OCR language outside the allow-list is an error: the worker must
    /// never hand an unvalidated string to the OCR engine.
    pub fn from_env() -> Result<Self, ConversionError> {
        let ocr_language = match std::env::var(QREXEC_ARGUMENT_ENV) {
            Ok(arg) if !arg.is_empty() => Some(allowed_language(&arg)?),
            _ => match std::env::var(OCR_ENV).as_deref() {
                Ok("1") => {
                    let code = std::env::var(OCR_LANGUAGE_ENV).unwrap_or_default();
                    Some(allowed_language(&code)?)
                }
                _ => None,
            },
        };
        Ok(Self {
            ocr_language,
            timeouts: TimeoutPolicy::from_env(),
            pixels_dir: std::env::var_os(PIXELS_DIR_ENV).map(PathBuf::from),
            safe_output_dir: std::env::var_os(SAFE_OUTPUT_DIR_ENV).map(PathBuf::from),
        })
    }
}

fn allowed_language(code: &str) -> Result<OcrLanguage, ConversionError> {
    OcrLanguage::lookup(code).ok_or_else(|| {
        error!("OCR language {:?} is not in the allow-list", code);
        ConversionError::Unexpected
    })
}

/// Writes progress records to stderr, one JSON object per line.
#[derive(Debug, Default)]
pub struct ProgressReporter {
    percentage: f32,
}

impl ProgressReporter {
    pub fn starting_at(percentage: f32) -> Self {
        Self { percentage }
    }

    pub fn percentage(&self) -> f32 {
        self.percentage
    }

    /// Add `step` to the running percentage and report `text`.
    pub fn advance(&mut self, step: f32, text: &str) {
        self.percentage = (self.percentage + step).min(100.0);
        self.emit(&ProgressEvent::info(text, self.percentage));
    }

    pub fn fail(&self, text: &str) {
        self.emit(&ProgressEvent::error(text, self.percentage));
    }

    fn emit(&self, event: &ProgressEvent) {
        let Ok(line) = serde_json::to_string(event) else {
            return;
        };
        let mut stderr = std::io::stderr().lock();
        if writeln!(stderr, "{line}").and_then(|_| stderr.flush()).is_err() {
            warn!("Could not write progress to stderr");
        }
    }
}

/// Run one phase and return the process exit status.
pub async fn run(phase: Phase) -> i32 {
    let result = match WorkerEnv::from_env() {
        Ok(env) => match phase {
            Phase::DocumentToPixels => {
                let mut progress = ProgressReporter::starting_at(0.0);
                doc_to_pixels::run(tokio::io::stdin(), tokio::io::stdout(), &env, &mut progress)
                    .await
                    .inspect_err(|e| progress.fail(&e.to_string()))
            }
            Phase::PixelsToPdf => {
                let mut progress = ProgressReporter::starting_at(50.0);
                pixels_to_pdf::run(tokio::io::stdin(), tokio::io::stdout(), &env, &mut progress)
                    .await
                    .inspect_err(|e| progress.fail(&e.to_string()))
            }
        },
        Err(e) => Err(e),
    };
    match result {
        Ok(()) => 0,
        Err(e) => {
            error!("{} failed: {}", phase, e);
            e.exit_status()
        }
    }
}
