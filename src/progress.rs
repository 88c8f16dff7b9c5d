//! Progress reporting for sanitization jobs.
//!
//! Inject an [`Arc<dyn SanitizeProgressCallback>`] via
//! [`crate::config::SanitizerConfigBuilder::progress_callback`] to receive
//! per-document state changes and progress messages.
//!
//! # Where progress comes from
//!
//! The sandboxed worker prints one JSON [`ProgressEvent`] per line on its
//! diagnostic stream. That stream is untrusted: the host only ever uses it
//! for display, parses it with [`ProgressEvent::from_untrusted_line`] (which
//! strips control characters and clamps the percentage), and never makes a
//! control decision based on it. The host adds its own events for the parts
//! of the job it drives.
//!
//! # Ordering
//!
//! Events for one document arrive in emission order. Callbacks for different
//! documents may run concurrently, so implementations must be `Send + Sync`
//! and synchronise any shared state.
//!
//! # Example
//!
//! ```rust
//! use docsanitize::{DocumentState, ProgressEvent, SanitizeProgressCallback};
//! use std::sync::Arc;
//!
//! struct Printer;
//!
//! impl SanitizeProgressCallback for Printer {
//!     fn on_progress(&self, doc_id: &str, event: &ProgressEvent) {
//!         eprintln!("[doc {}] {:>3.0}% {}", doc_id, event.percentage, event.text);
//!     }
//! }
//!
//! let cb: Arc<dyn SanitizeProgressCallback> = Arc::new(Printer);
//! cb.on_state_change("abc123", DocumentState::Converting);
//! ```

use crate::document::DocumentState;
use crate::sanitize::replace_control_chars;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Longest progress text kept after sanitizing.
const MAX_TEXT_CHARS: usize = 512;

/// One progress record, as printed by the worker and forwarded to callbacks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub error: bool,
    pub text: String,
    /// 0–100. Phase A covers 0–50, phase B 50–100.
    pub percentage: f32,
}

impl ProgressEvent {
    pub fn info(text: impl Into<String>, percentage: f32) -> Self {
        Self {
            error: false,
            text: text.into(),
            percentage,
        }
    }

    pub fn error(text: impl Into<String>, percentage: f32) -> Self {
        Self {
            error: true,
            text: text.into(),
            percentage,
        }
    }

    /// Parse a line from the worker's diagnostic stream.
    ///
    /// Returns `None` for anything that is not a progress record. The text
    /// is sanitized and truncated, and the percentage clamped to `0..=100`.
    pub fn from_untrusted_line(line: &str) -> Option<Self> {
        let raw: ProgressEvent = serde_json::from_str(line.trim()).ok()?;
        let percentage = if raw.percentage.is_finite() {
            raw.percentage.clamp(0.0, 100.0)
        } else {
            0.0
        };
        let text: String = raw.text.chars().take(MAX_TEXT_CHARS).collect();
        Some(Self {
            error: raw.error,
            text: replace_control_chars(&text, false),
            percentage,
        })
    }
}

/// Receives events while documents are sanitized.
///
/// All methods have default no-op implementations so callers only override
/// what they care about.
pub trait SanitizeProgressCallback: Send + Sync {
    /// Called once before a batch starts.
    fn on_batch_start(&self, total_documents: usize) {
        let _ = total_documents;
    }

    /// Called every time a document changes state.
    fn on_state_change(&self, doc_id: &str, state: DocumentState) {
        let _ = (doc_id, state);
    }

    /// Called for every progress message of a document.
    fn on_progress(&self, doc_id: &str, event: &ProgressEvent) {
        let _ = (doc_id, event);
    }

    /// Called once after every document of a batch reached a terminal state.
    fn on_batch_complete(&self, safe: usize, failed: usize) {
        let _ = (safe, failed);
    }
}

/// A no-op implementation for callers that don't need progress events.
///
/// This is the default when no callback is configured.
pub struct NoopProgressCallback;

impl SanitizeProgressCallback for NoopProgressCallback {}

/// Convenience alias matching the type stored in [`crate::config::SanitizerConfig`].
pub type ProgressCallback = Arc<dyn SanitizeProgressCallback>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    struct TrackingCallback {
        states: Mutex<Vec<(String, DocumentState)>>,
        events: AtomicUsize,
        safe: AtomicUsize,
    }

    impl SanitizeProgressCallback for TrackingCallback {
        fn on_state_change(&self, doc_id: &str, state: DocumentState) {
            self.states.lock().unwrap().push((doc_id.to_string(), state));
        }

        fn on_progress(&self, _doc_id: &str, _event: &ProgressEvent) {
            self.events.fetch_add(1, Ordering::SeqCst);
        }

        fn on_batch_complete(&self, safe: usize, _failed: usize) {
            self.safe.store(safe, Ordering::SeqCst);
        }
    }

    #[test]
    fn noop_callback_does_not_panic() {
        let cb = NoopProgressCallback;
        cb.on_batch_start(2);
        cb.on_state_change("abc", DocumentState::Converting);
        cb.on_progress("abc", &ProgressEvent::info("x", 1.0));
        cb.on_batch_complete(1, 1);
    }

    #[test]
    fn tracking_callback_receives_events() {
        let tracker = TrackingCallback::default();
        tracker.on_state_change("a", DocumentState::Converting);
        tracker.on_progress("a", &ProgressEvent::info("page 1", 10.0));
        tracker.on_progress("a", &ProgressEvent::info("page 2", 20.0));
        tracker.on_state_change("a", DocumentState::Safe);
        tracker.on_batch_complete(1, 0);

        assert_eq!(tracker.events.load(Ordering::SeqCst), 2);
        assert_eq!(tracker.safe.load(Ordering::SeqCst), 1);
        let states = tracker.states.lock().unwrap();
        assert_eq!(states.last(), Some(&("a".to_string(), DocumentState::Safe)));
    }

    #[test]
    fn parses_worker_line() {
        let line = r#"{"error":false,"text":"Converting page 1/3 to pixels","percentage":20.0}"#;
        let ev = ProgressEvent::from_untrusted_line(line).unwrap();
        assert!(!ev.error);
        assert_eq!(ev.text, "Converting page 1/3 to pixels");
        assert_eq!(ev.percentage, 20.0);
    }

    #[test]
    fn untrusted_line_is_sanitized_and_clamped() {
        let line = r#"{"error":true,"text":"bad\u001b[2J\u202e","percentage":1e9}"#;
        let ev = ProgressEvent::from_untrusted_line(line).unwrap();
        assert!(ev.error);
        assert_eq!(ev.text, "bad\u{FFFD}[2J\u{FFFD}");
        assert_eq!(ev.percentage, 100.0);
    }

    #[test]
    fn free_form_lines_are_not_events() {
        assert!(ProgressEvent::from_untrusted_line("INFO starting").is_none());
        assert!(ProgressEvent::from_untrusted_line("").is_none());
    }
}
