//! Error types for the docsanitize library.
//!
//! Two distinct error types reflect the two sides of the trust boundary:
//!
//! * [`ConversionError`]: raised **inside** the sandbox by the conversion
//!   worker. Its only way out of the sandbox is the worker's process exit
//!   status, so every variant carries a stable numeric code `N` and the
//!   worker exits with `128 + N`. The mapping is a wire format in its own
//!   right and must never be renumbered.
//!
//! * [`SanitizeError`]: raised on the **host**: invalid documents, a missing
//!   sandbox technology, timeouts, cancellation, and decoded worker failures
//!   (wrapped as [`SanitizeError::Conversion`]). It is stored on the failed
//!   [`crate::document::Document`], so it is cheap to clone.
//!
//! The host never parses the worker's diagnostic text to decide what went
//! wrong; it only ever looks at the numeric exit status.

use crate::isolation::Phase;
use crate::sanitize::replace_control_chars;
use serde::{Deserialize, Serialize};
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Offset added to a [`ConversionError`] code to form the worker exit status.
pub const EXIT_STATUS_OFFSET: i32 = 128;

/// Exit statuses reserved by shells and container runtimes for "could not
/// execute the command". They sit outside the `128 + N` space.
pub const LAUNCH_FAILURE_STATUSES: [i32; 2] = [126, 127];

/// Failure reasons raised by the sandboxed conversion worker.
///
/// Messages are fixed and short so they can be shown to a user verbatim.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error, Serialize, Deserialize)]
pub enum ConversionError {
    // ── Input classification ──────────────────────────────────────────────
    /// The content-sniffed MIME type is not in the conversion table.
    #[error("The document format is not supported")]
    DocFormatUnsupported,

    /// The format is known but refused on the isolation backend in use.
    #[error("The document format is not supported on this isolation backend")]
    DocFormatUnsupportedOnBackend,

    // ── External converters ───────────────────────────────────────────────
    /// The office suite failed or produced no usable PDF.
    #[error("Conversion to PDF with LibreOffice failed")]
    LibreofficeFailure,

    /// The PDF produced (or supplied) could not be opened.
    #[error("The document is corrupted and could not be opened")]
    DocCorrupted,

    // ── Untrusted page geometry ───────────────────────────────────────────
    /// Page data was malformed or truncated.
    #[error("The page data is malformed")]
    Pages,

    /// The page count could not be determined.
    #[error("Number of pages could not be extracted from PDF")]
    NoPageCount,

    /// The declared page count is zero or above the page limit.
    #[error("The document has too many pages")]
    MaxPages,

    /// A page is wider than the width limit (or zero pixels wide).
    #[error("A page of the document is too wide")]
    MaxPageWidth,

    /// A page is taller than the height limit (or zero pixels tall).
    #[error("A page of the document is too tall")]
    MaxPageHeight,

    /// The set of pages on disk does not match the declared page count.
    #[error("The number of pages does not match the page data")]
    PageCountMismatch,

    // ── Process level ─────────────────────────────────────────────────────
    /// A converter process failed or its streams broke unexpectedly.
    #[error("The conversion process failed")]
    ConverterProc,

    /// An external tool inside the worker ran past its timeout.
    #[error("The conversion timed out")]
    ConversionTimeout,

    /// Anything not otherwise classified.
    #[error("An unexpected error occurred during conversion")]
    Unexpected,
}

impl ConversionError {
    /// Every variant, in code order.
    pub const ALL: [ConversionError; 13] = [
        ConversionError::DocFormatUnsupported,
        ConversionError::DocFormatUnsupportedOnBackend,
        ConversionError::LibreofficeFailure,
        ConversionError::DocCorrupted,
        ConversionError::Pages,
        ConversionError::NoPageCount,
        ConversionError::MaxPages,
        ConversionError::MaxPageWidth,
        ConversionError::MaxPageHeight,
        ConversionError::PageCountMismatch,
        ConversionError::ConverterProc,
        ConversionError::ConversionTimeout,
        ConversionError::Unexpected,
    ];

    /// Stable numeric code `N` of this failure.
    pub const fn code(self) -> u8 {
        match self {
            ConversionError::DocFormatUnsupported => 10,
            ConversionError::DocFormatUnsupportedOnBackend => 16,
            ConversionError::LibreofficeFailure => 20,
            ConversionError::DocCorrupted => 30,
            ConversionError::Pages => 40,
            ConversionError::NoPageCount => 41,
            ConversionError::MaxPages => 42,
            ConversionError::MaxPageWidth => 43,
            ConversionError::MaxPageHeight => 44,
            ConversionError::PageCountMismatch => 45,
            ConversionError::ConverterProc => 60,
            ConversionError::ConversionTimeout => 70,
            ConversionError::Unexpected => 90,
        }
    }

    /// Process exit status the worker uses to report this failure.
    pub const fn exit_status(self) -> i32 {
        EXIT_STATUS_OFFSET + self.code() as i32
    }

    /// Look up a failure by its numeric code.
    pub fn from_code(code: u8) -> Option<Self> {
        Self::ALL.into_iter().find(|e| e.code() == code)
    }

    /// Whether this failure guards the untrusted page geometry.
    pub const fn is_pages_error(self) -> bool {
        matches!(
            self,
            ConversionError::Pages
                | ConversionError::NoPageCount
                | ConversionError::MaxPages
                | ConversionError::MaxPageWidth
                | ConversionError::MaxPageHeight
                | ConversionError::PageCountMismatch
        )
    }
}

/// What a sandboxed process's exit status means.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitOutcome {
    /// Exit status 0.
    Success,
    /// 126 / 127: the sandbox could not run the worker at all.
    LaunchFailure(i32),
    /// `128 + N` for a known `N`.
    Conversion(ConversionError),
    /// Killed by a signal (`None`) or an exit status outside the contract.
    Unknown(Option<i32>),
}

/// Decode a worker exit status. `None` means the process died from a signal.
pub fn decode_exit_status(status: Option<i32>) -> ExitOutcome {
    match status {
        Some(0) => ExitOutcome::Success,
        Some(s) if LAUNCH_FAILURE_STATUSES.contains(&s) => ExitOutcome::LaunchFailure(s),
        Some(s) if s > EXIT_STATUS_OFFSET => u8::try_from(s - EXIT_STATUS_OFFSET)
            .ok()
            .and_then(ConversionError::from_code)
            .map_or(ExitOutcome::Unknown(Some(s)), ExitOutcome::Conversion),
        other => ExitOutcome::Unknown(other),
    }
}

/// All errors raised on the host side of the sandbox.
#[derive(Debug, Clone, Error)]
pub enum SanitizeError {
    // ── Document errors ───────────────────────────────────────────────────
    /// Input file was not found at the given path.
    #[error("Input file not found: '{path}'")]
    InputNotFound { path: PathBuf },

    /// Process does not have read permission on the input.
    #[error("Permission denied reading '{path}'")]
    InputNotReadable { path: PathBuf },

    /// The requested output does not end in `.pdf`.
    #[error("Safe PDF filename must end in '.pdf': '{path}'")]
    NonPdfOutput { path: PathBuf },

    /// The output directory cannot be written to.
    #[error("Output directory is not writable: '{path}'")]
    UnwritableOutputDir { path: PathBuf },

    /// The requested output directory does not exist.
    #[error("Output directory does not exist: '{path}'")]
    OutputDirNotFound { path: PathBuf },

    /// The requested output directory is a file.
    #[error("Output path is not a directory: '{path}'")]
    OutputDirNotADirectory { path: PathBuf },

    /// The archive directory for originals could not be created.
    #[error("Archive directory for unsafe documents cannot be created: '{path}'")]
    UnwritableArchiveDir { path: PathBuf },

    /// The suffix is only used to derive a default output path.
    #[error("Cannot set a suffix after setting an output filename")]
    SuffixNotApplicable,

    // ── Sandbox errors ────────────────────────────────────────────────────
    /// The sandbox technology is missing or not running. Never retried.
    #[error("Isolation backend '{backend}' is not available: {detail}")]
    SandboxUnavailable { backend: String, detail: String },

    /// The sandbox could not execute the worker (exit status 126 / 127).
    #[error("The sandbox could not be launched (exit status {status})")]
    SandboxLaunchFailure { status: i32 },

    /// A failure reported by the worker through its exit status.
    #[error(transparent)]
    Conversion(#[from] ConversionError),

    /// A phase did not finish within its deadline.
    #[error("{phase} timed out after {}s", after.as_secs())]
    Timeout { phase: Phase, after: Duration },

    /// The conversion was cancelled by the caller.
    #[error("Conversion was cancelled")]
    Cancelled,

    // ── I/O and config ────────────────────────────────────────────────────
    /// Host-side I/O failure.
    #[error("I/O error while {context}: {source}")]
    Io {
        context: String,
        #[source]
        source: Arc<io::Error>,
    },

    /// Builder validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl SanitizeError {
    /// Wrap an I/O error with a short description of what was being done.
    pub fn io(context: impl Into<String>, source: io::Error) -> Self {
        SanitizeError::Io {
            context: context.into(),
            source: Arc::new(source),
        }
    }

    /// Whether retrying the same document could plausibly succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SanitizeError::Timeout { .. } | SanitizeError::Io { .. } | SanitizeError::Cancelled
        )
    }

    /// Short, fixed message suitable for showing to a user.
    ///
    /// Paths are the only variable part and are passed through
    /// [`replace_control_chars`].
    pub fn user_message(&self) -> String {
        match self {
            SanitizeError::Conversion(e) => e.to_string(),
            SanitizeError::Timeout { .. } => "The conversion timed out".to_string(),
            SanitizeError::Cancelled => "The conversion was cancelled".to_string(),
            SanitizeError::SandboxUnavailable { .. } => {
                "The sandbox required for conversion is not available".to_string()
            }
            SanitizeError::SandboxLaunchFailure { .. } => {
                "The sandbox could not be started".to_string()
            }
            SanitizeError::Io { .. } | SanitizeError::Internal(_) => {
                "An unexpected error occurred during conversion".to_string()
            }
            other => replace_control_chars(&other.to_string(), false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_unique() {
        let mut codes: Vec<u8> = ConversionError::ALL.iter().map(|e| e.code()).collect();
        codes.sort_unstable();
        codes.dedup();
        assert_eq!(codes.len(), ConversionError::ALL.len());
    }

    #[test]
    fn exit_status_is_offset_code() {
        assert_eq!(ConversionError::DocFormatUnsupported.exit_status(), 138);
        assert_eq!(ConversionError::MaxPages.exit_status(), 170);
        for e in ConversionError::ALL {
            assert!(e.exit_status() <= 255, "{e:?} does not fit in an exit status");
        }
    }

    #[test]
    fn decode_known_statuses() {
        assert_eq!(decode_exit_status(Some(0)), ExitOutcome::Success);
        assert_eq!(decode_exit_status(Some(126)), ExitOutcome::LaunchFailure(126));
        assert_eq!(decode_exit_status(Some(127)), ExitOutcome::LaunchFailure(127));
        for e in ConversionError::ALL {
            assert_eq!(
                decode_exit_status(Some(e.exit_status())),
                ExitOutcome::Conversion(e)
            );
        }
    }

    #[test]
    fn decode_unknown_statuses() {
        assert_eq!(decode_exit_status(None), ExitOutcome::Unknown(None));
        assert_eq!(decode_exit_status(Some(1)), ExitOutcome::Unknown(Some(1)));
        assert_eq!(decode_exit_status(Some(128)), ExitOutcome::Unknown(Some(128)));
        assert_eq!(decode_exit_status(Some(129)), ExitOutcome::Unknown(Some(129)));
    }

    #[test]
    fn pages_family() {
        assert!(ConversionError::MaxPages.is_pages_error());
        assert!(ConversionError::Pages.is_pages_error());
        assert!(!ConversionError::LibreofficeFailure.is_pages_error());
    }

    #[test]
    fn timeout_display() {
        let e = SanitizeError::Timeout {
            phase: Phase::DocumentToPixels,
            after: Duration::from_secs(75),
        };
        let msg = e.to_string();
        assert!(msg.contains("75s"), "got: {msg}");
        assert!(msg.contains("document-to-pixels"), "got: {msg}");
        assert_eq!(e.user_message(), "The conversion timed out");
    }

    #[test]
    fn user_message_strips_control_chars() {
        let e = SanitizeError::InputNotFound {
            path: PathBuf::from("/tmp/evil\x1b[31m.pdf"),
        };
        let msg = e.user_message();
        assert!(!msg.contains('\x1b'), "got: {msg:?}");
        assert!(msg.contains('\u{FFFD}'));
    }

    #[test]
    fn sandbox_unavailable_is_not_retryable() {
        let e = SanitizeError::SandboxUnavailable {
            backend: "podman".into(),
            detail: "not found".into(),
        };
        assert!(!e.is_retryable());
        assert!(SanitizeError::Cancelled.is_retryable());
    }
}
