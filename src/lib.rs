//! # docsanitize
//!
//! Make untrusted documents safe by turning them into pixels inside one
//! sandbox and rebuilding a flat PDF from those pixels inside another.
//!
//! ## Why pixels?
//!
//! Office files and PDFs can carry scripts, embedded objects, exploit
//! payloads for the parser that opens them, and tracking beacons. Instead of
//! trying to recognize and strip every such thing, the document is rendered
//! to raw RGB bytes by a throwaway sandbox. A second sandbox turns those
//! bytes back into a PDF with one image per page. Nothing but pixel values
//! crosses from the first sandbox to the second, so no object of the
//! original file can survive.
//!
//! ## Pipeline Overview
//!
//! ```text
//! untrusted file
//!  │
//!  ├─ Phase A  (sandbox)  sniff type → office/raster → PDF → RGB pages
//!  │        │
//!  │        └─ wire protocol: u16 count, then per page u16 w, u16 h, w·h·3 bytes
//!  │
//!  ├─ Host     validate every count, size and byte; store pages on disk
//!  │
//!  ├─ Phase B  (sandbox)  RGB pages → image-only PDF (optional OCR layer)
//!  │
//!  └─ Output   staged beside the target and renamed into place
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use docsanitize::{
//!     sanitize_documents, ContainerConfig, ContainerProvider, Document, Sanitizer,
//!     SanitizerConfig,
//! };
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let provider = Arc::new(ContainerProvider::new(ContainerConfig::default())?);
//!     let config = Arc::new(SanitizerConfig::builder().ocr_language("eng").build()?);
//!     let sanitizer = Sanitizer::new(provider, config);
//!
//!     let docs = vec![Document::new("invoice.docx")?];
//!     for doc in sanitize_documents(&sanitizer, docs).await {
//!         match doc.failure() {
//!             None => println!("{}", doc.output_path().display()),
//!             Some(e) => eprintln!("{}", e.user_message()),
//!         }
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`   | on      | Builds the `docsanitize` and `sanitizer-worker` binaries |

// ── Modules ──────────────────────────────────────────────────────────────

pub mod config;
pub mod convert;
pub mod document;
pub mod error;
pub mod isolation;
pub mod ocr;
pub mod progress;
pub mod protocol;
pub mod sanitize;
pub mod scheduler;
pub mod timeout;
pub mod worker;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use config::{SanitizerConfig, SanitizerConfigBuilder};
pub use convert::Sanitizer;
pub use document::{Document, DocumentState};
pub use error::{decode_exit_status, ConversionError, ExitOutcome, SanitizeError};
pub use isolation::{
    stop_phase, ContainerConfig, ContainerProvider, ContainerRuntime, DisposableVmConfig,
    DisposableVmProvider, DummyConfig, DummyProvider, IsolationProvider, Phase, PixelTransport,
    ProcessHandle,
};
pub use ocr::OcrLanguage;
pub use progress::{NoopProgressCallback, ProgressCallback, ProgressEvent, SanitizeProgressCallback};
pub use scheduler::{
    sanitize_documents, sanitize_documents_with_cancel, sanitize_stream, BatchCounts,
    DocumentStream,
};
pub use timeout::TimeoutPolicy;
pub use tokio_util::sync::CancellationToken;
