//! Parallel scheduler: many documents through one [`Sanitizer`].
//!
//! ## Pool size
//!
//! The pool holds `min(max_parallel(A), max_parallel(B))` documents at a time
//! unless [`SanitizerConfig::max_parallel`](crate::config::SanitizerConfig)
//! overrides it. Documents share nothing but that admission limit: each gets
//! its own sandboxes, its own scratch directory and its own failure. A
//! document that fails, or even panics, never stops its siblings.
//!
//! Two shapes are offered:
//!
//! * [`sanitize_documents`]: wait for the whole batch, get the documents
//!   back in input order.
//! * [`sanitize_stream`]: get each document as soon as it reaches a
//!   terminal state (completion order).

use crate::convert::Sanitizer;
use crate::document::{Document, DocumentState};
use crate::error::SanitizeError;
use crate::isolation::Phase;
use futures::stream::{self, StreamExt};
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use tokio_stream::Stream;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// A boxed stream of documents in a terminal state.
pub type DocumentStream = Pin<Box<dyn Stream<Item = Document> + Send>>;

/// How many documents of a batch are in each state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchCounts {
    pub unconverted: usize,
    pub converting: usize,
    pub safe: usize,
    pub failed: usize,
}

impl BatchCounts {
    pub fn of<'a>(documents: impl IntoIterator<Item = &'a Document>) -> Self {
        let mut counts = Self::default();
        for doc in documents {
            match doc.state() {
                DocumentState::Unconverted => counts.unconverted += 1,
                DocumentState::Converting => counts.converting += 1,
                DocumentState::Safe => counts.safe += 1,
                DocumentState::Failed => counts.failed += 1,
            }
        }
        counts
    }

    pub fn total(&self) -> usize {
        self.unconverted + self.converting + self.safe + self.failed
    }
}

/// Number of documents converted at once.
pub fn pool_size(sanitizer: &Sanitizer) -> usize {
    sanitizer.config().max_parallel.unwrap_or_else(|| {
        let provider = sanitizer.provider();
        provider
            .max_parallel(Phase::DocumentToPixels)
            .min(provider.max_parallel(Phase::PixelsToPdf))
    })
    .max(1)
}

/// Fail every document that has not started, with `err`.
fn fail_all(sanitizer: &Sanitizer, documents: &mut [Document], err: &SanitizeError) {
    for doc in documents.iter_mut().filter(|d| d.is_unconverted()) {
        if doc.mark_as_failed(err.clone()).is_ok() {
            if let Some(cb) = &sanitizer.config().progress_callback {
                cb.on_state_change(doc.id(), doc.state());
            }
        }
    }
}

/// Convert one document, turning a panic into a failure.
async fn sanitize_one(sanitizer: Sanitizer, mut document: Document, cancel: CancellationToken) -> Document {
    let outcome = AssertUnwindSafe(sanitizer.sanitize_with_cancel(&mut document, &cancel))
        .catch_unwind()
        .await;
    if outcome.is_err() {
        error!("[doc {}] Conversion panicked", document.id());
        let failed = document.mark_as_failed(SanitizeError::Internal(
            "the conversion task panicked".into(),
        ));
        if failed.is_ok() {
            if let Some(cb) = &sanitizer.config().progress_callback {
                cb.on_state_change(document.id(), document.state());
            }
        }
    }
    document
}

/// Check the backend once for the whole batch. On failure every document
/// fails without any phase being started.
async fn admit(sanitizer: &Sanitizer, documents: &mut [Document]) -> bool {
    match sanitizer.provider().ensure_available().await {
        Ok(()) => true,
        Err(e) => {
            error!(
                "Isolation provider '{}' is unavailable: {}",
                sanitizer.provider().name(),
                e
            );
            fail_all(sanitizer, documents, &e);
            false
        }
    }
}

/// Sanitize a batch and return the documents in input order.
pub async fn sanitize_documents(sanitizer: &Sanitizer, documents: Vec<Document>) -> Vec<Document> {
    sanitize_documents_with_cancel(sanitizer, documents, CancellationToken::new()).await
}

/// Like [`sanitize_documents`]; documents still pending or running when
/// `cancel` fires end up failed with [`SanitizeError::Cancelled`].
pub async fn sanitize_documents_with_cancel(
    sanitizer: &Sanitizer,
    mut documents: Vec<Document>,
    cancel: CancellationToken,
) -> Vec<Document> {
    let callback = sanitizer.config().progress_callback.clone();
    if let Some(cb) = &callback {
        cb.on_batch_start(documents.len());
    }

    if admit(sanitizer, &mut documents).await {
        let pool = pool_size(sanitizer);
        info!("Sanitizing {} documents, {} at a time", documents.len(), pool);
        let mut done: Vec<(usize, Document)> = stream::iter(documents.into_iter().enumerate())
            .map(|(i, doc)| {
                let sanitizer = sanitizer.clone();
                let cancel = cancel.clone();
                async move { (i, sanitize_one(sanitizer, doc, cancel).await) }
            })
            .buffer_unordered(pool)
            .collect()
            .await;
        done.sort_by_key(|(i, _)| *i);
        documents = done.into_iter().map(|(_, doc)| doc).collect();
    }

    let counts = BatchCounts::of(&documents);
    info!("Batch done: {} safe, {} failed", counts.safe, counts.failed);
    if let Some(cb) = &callback {
        cb.on_batch_complete(counts.safe, counts.failed);
    }
    documents
}

/// Sanitize a batch, yielding each document as it finishes.
pub async fn sanitize_stream(
    sanitizer: Sanitizer,
    mut documents: Vec<Document>,
    cancel: CancellationToken,
) -> DocumentStream {
    if let Some(cb) = &sanitizer.config().progress_callback {
        cb.on_batch_start(documents.len());
    }
    if !admit(&sanitizer, &mut documents).await {
        return Box::pin(stream::iter(documents));
    }

    let pool = pool_size(&sanitizer);
    let s = stream::iter(documents.into_iter().map(move |doc| {
        sanitize_one(sanitizer.clone(), doc, cancel.clone())
    }))
    .buffer_unordered(pool);
    Box::pin(s)
}
