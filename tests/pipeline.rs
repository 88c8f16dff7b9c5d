//! Integration tests for the sanitization pipeline.
//!
//! Phase B always runs the real `sanitizer-worker` binary, unsandboxed.
//! Phase A is either the dummy provider's synthetic pixel stream or a small
//! scripted provider defined here, so none of these tests need a container
//! runtime, a VM or a PDFium library.
//!
//! Run with:
//!   cargo test --test pipeline -- --nocapture

use async_trait::async_trait;
use docsanitize::isolation::PhaseContext;
use docsanitize::protocol::MAX_PAGES;
use docsanitize::{
    sanitize_documents, stop_phase, ConversionError, DocumentState, DummyConfig, DummyProvider,
    IsolationProvider, Phase, PixelTransport, ProcessHandle, ProgressEvent,
    CancellationToken, SanitizeError, SanitizeProgressCallback, Sanitizer, SanitizerConfig,
    TimeoutPolicy,
};
use docsanitize::Document;
use nix::sys::signal::Signal;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::process::Command;

// ── Test helpers ─────────────────────────────────────────────────────────────

const WORKER: &str = env!("CARGO_BIN_EXE_sanitizer-worker");

fn input(dir: &Path, name: &str, bytes: &[u8]) -> PathBuf {
    let p = dir.join(name);
    std::fs::write(&p, bytes).unwrap();
    p
}

fn dummy(pages: u16, declared: Option<u16>, transport: PixelTransport) -> Arc<DummyProvider> {
    Arc::new(
        DummyProvider::new(DummyConfig {
            acknowledge_unsafe: true,
            pages,
            declared_pages: declared,
            width: 8,
            height: 6,
            worker_program: PathBuf::from(WORKER),
            transport,
            max_parallel: 2,
        })
        .unwrap(),
    )
}

fn config(work_root: &Path) -> Arc<SanitizerConfig> {
    Arc::new(SanitizerConfig::builder().work_root(work_root).build().unwrap())
}

fn page_count(pdf: &Path) -> usize {
    lopdf::Document::load(pdf).unwrap().get_pages().len()
}

/// A provider whose phase A is an arbitrary command and whose phase B is
/// the real worker.
struct ScriptedProvider {
    phase_a: Vec<String>,
    available: bool,
    starts: Arc<AtomicUsize>,
    terminations: Arc<AtomicUsize>,
}

impl ScriptedProvider {
    fn new(phase_a: &[&str]) -> Self {
        Self {
            phase_a: phase_a.iter().map(|s| s.to_string()).collect(),
            available: true,
            starts: Arc::new(AtomicUsize::new(0)),
            terminations: Arc::new(AtomicUsize::new(0)),
        }
    }
}

#[async_trait]
impl IsolationProvider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn ensure_available(&self) -> Result<(), SanitizeError> {
        if self.available {
            Ok(())
        } else {
            Err(SanitizeError::SandboxUnavailable {
                backend: "scripted".into(),
                detail: "switched off".into(),
            })
        }
    }

    fn start_phase(
        &self,
        document: &Document,
        phase: Phase,
        _ctx: &PhaseContext<'_>,
    ) -> Result<ProcessHandle, SanitizeError> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        let mut cmd = match phase {
            Phase::DocumentToPixels => {
                let mut cmd = Command::new(&self.phase_a[0]);
                cmd.args(&self.phase_a[1..]);
                cmd
            }
            Phase::PixelsToPdf => {
                let mut cmd = Command::new(WORKER);
                cmd.arg(phase.tag());
                cmd
            }
        };
        cmd.env("OCR", "0").env_remove("QREXEC_SERVICE_ARGUMENT");
        ProcessHandle::spawn(cmd, format!("scripted {phase} {}", document.id()))
            .map_err(|e| SanitizeError::io("starting a scripted phase", e))
    }

    async fn terminate(&self, _document: &Document, _phase: Phase, handle: &mut ProcessHandle) {
        self.terminations.fetch_add(1, Ordering::SeqCst);
        handle.signal_group(Signal::SIGTERM);
    }

    fn max_parallel(&self, _phase: Phase) -> usize {
        1
    }
}

/// Phase A of documents named `stuck*` never finishes; every other
/// document gets the dummy pixel stream after a short delay. Phase B is the
/// real worker. Terminations are recorded per document id.
struct SplitProvider {
    pixels: DummyProvider,
    terminated: Mutex<Vec<String>>,
}

impl SplitProvider {
    fn new() -> Self {
        Self {
            pixels: DummyProvider::new(DummyConfig {
                acknowledge_unsafe: true,
                ..DummyConfig::default()
            })
            .unwrap(),
            terminated: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl IsolationProvider for SplitProvider {
    fn name(&self) -> &str {
        "split"
    }

    async fn ensure_available(&self) -> Result<(), SanitizeError> {
        Ok(())
    }

    fn start_phase(
        &self,
        document: &Document,
        phase: Phase,
        _ctx: &PhaseContext<'_>,
    ) -> Result<ProcessHandle, SanitizeError> {
        let stuck = document
            .input_path()
            .file_name()
            .is_some_and(|n| n.to_string_lossy().starts_with("stuck"));
        let mut cmd = match (phase, stuck) {
            (Phase::DocumentToPixels, true) => {
                let mut cmd = Command::new("sleep");
                cmd.arg("30");
                cmd
            }
            (Phase::DocumentToPixels, false) => {
                let mut cmd = Command::new("sh");
                cmd.arg("-c")
                    .arg(format!("sleep 0.5\n{}", self.pixels.phase_a_script()));
                cmd
            }
            (Phase::PixelsToPdf, _) => {
                let mut cmd = Command::new(WORKER);
                cmd.arg(phase.tag());
                cmd
            }
        };
        cmd.env("OCR", "0").env_remove("QREXEC_SERVICE_ARGUMENT");
        ProcessHandle::spawn(cmd, format!("split {phase} {}", document.id()))
            .map_err(|e| SanitizeError::io("starting a split phase", e))
    }

    async fn terminate(&self, document: &Document, _phase: Phase, handle: &mut ProcessHandle) {
        self.terminated.lock().unwrap().push(document.id().to_string());
        handle.signal_group(Signal::SIGTERM);
    }

    fn max_parallel(&self, _phase: Phase) -> usize {
        2
    }
}

/// Records every state change and progress event.
#[derive(Default)]
struct Recorder {
    states: Mutex<Vec<DocumentState>>,
    percentages: Mutex<Vec<f32>>,
    batches: Mutex<Vec<(usize, usize)>>,
}

impl SanitizeProgressCallback for Recorder {
    fn on_state_change(&self, _doc_id: &str, state: DocumentState) {
        self.states.lock().unwrap().push(state);
    }

    fn on_progress(&self, _doc_id: &str, event: &ProgressEvent) {
        self.percentages.lock().unwrap().push(event.percentage);
    }

    fn on_batch_complete(&self, safe: usize, failed: usize) {
        self.batches.lock().unwrap().push((safe, failed));
    }
}

// ── Successful conversions ───────────────────────────────────────────────────

#[tokio::test]
async fn dummy_stream_transport_produces_a_three_page_pdf() {
    let tmp = tempfile::tempdir().unwrap();
    let src = input(tmp.path(), "report.docx", b"not really a document");
    let mut doc = Document::new(&src).unwrap();
    let output = doc.output_path();

    let sanitizer = Sanitizer::new(dummy(3, None, PixelTransport::Stream), config(tmp.path()));
    let state = sanitizer.sanitize(&mut doc).await;

    assert_eq!(state, DocumentState::Safe, "failure: {:?}", doc.failure());
    assert_eq!(output.file_name().unwrap(), "report-safe.pdf");
    assert_eq!(page_count(&output), 3);
    assert!(std::fs::read(&output).unwrap().starts_with(b"%PDF"));
}

#[tokio::test]
async fn dummy_directory_transport_produces_a_three_page_pdf() {
    let tmp = tempfile::tempdir().unwrap();
    let src = input(tmp.path(), "sheet.xlsx", b"cells");
    let out = tmp.path().join("clean.pdf");
    let mut doc = Document::with_output(&src, &out).unwrap();

    let sanitizer = Sanitizer::new(dummy(3, None, PixelTransport::Directory), config(tmp.path()));
    let state = sanitizer.sanitize(&mut doc).await;

    assert_eq!(state, DocumentState::Safe, "failure: {:?}", doc.failure());
    assert_eq!(page_count(&out), 3);
}

#[tokio::test]
async fn no_scratch_or_staging_files_are_left_behind() {
    let tmp = tempfile::tempdir().unwrap();
    let docs_dir = tmp.path().join("docs");
    let work_dir = tmp.path().join("work");
    std::fs::create_dir_all(&docs_dir).unwrap();
    std::fs::create_dir_all(&work_dir).unwrap();
    let src = input(&docs_dir, "a.pdf", b"%PDF-1.4");
    let mut doc = Document::new(&src).unwrap();

    let sanitizer = Sanitizer::new(dummy(1, None, PixelTransport::Stream), config(&work_dir));
    assert_eq!(sanitizer.sanitize(&mut doc).await, DocumentState::Safe);

    assert_eq!(std::fs::read_dir(&work_dir).unwrap().count(), 0);
    let mut names: Vec<String> = std::fs::read_dir(&docs_dir)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    assert_eq!(names, vec!["a-safe.pdf", "a.pdf"]);
}

#[tokio::test]
async fn archive_moves_the_original_after_success() {
    let tmp = tempfile::tempdir().unwrap();
    let src = input(tmp.path(), "letter.odt", b"odt");
    let mut doc = Document::new(&src).unwrap();
    doc.set_archive_after_conversion(true);
    let archived = doc.archive_path();

    let sanitizer = Sanitizer::new(dummy(1, None, PixelTransport::Stream), config(tmp.path()));
    assert_eq!(sanitizer.sanitize(&mut doc).await, DocumentState::Safe);

    assert!(!src.exists());
    assert!(archived.exists());
    assert!(doc.output_path().exists());
}

// ── Failures ─────────────────────────────────────────────────────────────────

#[tokio::test]
async fn too_many_pages_fail_before_phase_b() {
    let tmp = tempfile::tempdir().unwrap();
    let src = input(tmp.path(), "huge.pdf", b"%PDF-1.4");
    let mut doc = Document::new(&src).unwrap();
    let output = doc.output_path();

    let provider = dummy(1, Some(MAX_PAGES + 1), PixelTransport::Stream);
    let sanitizer = Sanitizer::new(provider, config(tmp.path()));
    let state = sanitizer.sanitize(&mut doc).await;

    assert_eq!(state, DocumentState::Failed);
    assert!(matches!(
        doc.failure(),
        Some(SanitizeError::Conversion(ConversionError::MaxPages))
    ));
    assert!(!output.exists());
}

#[tokio::test]
async fn fewer_pages_than_declared_fail() {
    let tmp = tempfile::tempdir().unwrap();
    let src = input(tmp.path(), "short.pdf", b"%PDF-1.4");
    let mut doc = Document::new(&src).unwrap();

    let sanitizer = Sanitizer::new(dummy(2, Some(3), PixelTransport::Stream), config(tmp.path()));
    assert_eq!(sanitizer.sanitize(&mut doc).await, DocumentState::Failed);
    assert!(matches!(doc.failure(), Some(SanitizeError::Conversion(_))));
    assert!(!doc.output_path().exists());
}

#[tokio::test]
async fn worker_exit_code_names_the_failure() {
    let tmp = tempfile::tempdir().unwrap();
    let src = input(tmp.path(), "notes.txt", b"just some plain text\n");
    let mut doc = Document::new(&src).unwrap();

    let provider = Arc::new(ScriptedProvider::new(&[WORKER, "document-to-pixels"]));
    let sanitizer = Sanitizer::new(provider, config(tmp.path()));
    let state = sanitizer.sanitize(&mut doc).await;

    assert_eq!(state, DocumentState::Failed);
    assert!(
        matches!(
            doc.failure(),
            Some(SanitizeError::Conversion(ConversionError::DocFormatUnsupported))
        ),
        "failure: {:?}",
        doc.failure()
    );
    assert!(!doc.output_path().exists());
}

#[tokio::test]
async fn sandbox_that_cannot_launch_is_reported() {
    let tmp = tempfile::tempdir().unwrap();
    let src = input(tmp.path(), "a.pdf", b"%PDF-1.4");
    let mut doc = Document::new(&src).unwrap();

    let provider = Arc::new(ScriptedProvider::new(&["sh", "-c", "cat > /dev/null; exit 127"]));
    let sanitizer = Sanitizer::new(provider, config(tmp.path()));
    assert_eq!(sanitizer.sanitize(&mut doc).await, DocumentState::Failed);
    assert!(matches!(
        doc.failure(),
        Some(SanitizeError::SandboxLaunchFailure { status: 127 })
    ));
}

#[tokio::test]
async fn stuck_phase_times_out_and_is_terminated() {
    let tmp = tempfile::tempdir().unwrap();
    let src = input(tmp.path(), "slow.pdf", b"%PDF-1.4");
    let mut doc = Document::new(&src).unwrap();

    let provider = Arc::new(ScriptedProvider::new(&["sleep", "30"]));
    let terminations = Arc::clone(&provider.terminations);
    let policy = TimeoutPolicy {
        per_mb_secs: 0.0,
        min_secs: 0.2,
        per_page_secs: 0.0,
        enabled: true,
    };
    let config = SanitizerConfig::builder()
        .work_root(tmp.path())
        .timeouts(policy)
        .phase_grace(Duration::from_millis(100))
        .termination_grace(Duration::from_millis(500))
        .force_kill_wait(Duration::from_millis(500))
        .build()
        .unwrap();
    let sanitizer = Sanitizer::new(provider, Arc::new(config));

    let started = Instant::now();
    let state = sanitizer.sanitize(&mut doc).await;
    let elapsed = started.elapsed();

    assert_eq!(state, DocumentState::Failed);
    match doc.failure() {
        Some(SanitizeError::Timeout { phase, after }) => {
            assert_eq!(*phase, Phase::DocumentToPixels);
            assert!((after.as_secs_f64() - 0.3).abs() < 0.001, "limit was {after:?}");
            assert!(elapsed >= *after);
        }
        other => panic!("expected a timeout, got {other:?}"),
    }
    assert!(elapsed < Duration::from_secs(10));
    assert!(terminations.load(Ordering::SeqCst) > 0);
}

#[tokio::test]
async fn stopping_a_phase_twice_is_harmless() {
    let tmp = tempfile::tempdir().unwrap();
    let src = input(tmp.path(), "a.pdf", b"%PDF-1.4");
    let doc = Document::new(&src).unwrap();
    let provider = dummy(1, None, PixelTransport::Stream);

    let mut cmd = Command::new("sleep");
    cmd.arg("30");
    let mut handle = ProcessHandle::spawn(cmd, "sleeper").unwrap();
    let grace = Duration::from_millis(500);

    stop_phase(provider.as_ref(), &doc, Phase::DocumentToPixels, &mut handle, grace, grace).await;
    assert!(handle.try_status().is_some());

    let again = Instant::now();
    stop_phase(provider.as_ref(), &doc, Phase::DocumentToPixels, &mut handle, grace, grace).await;
    assert!(again.elapsed() < grace);
}

// ── Batches ──────────────────────────────────────────────────────────────────

#[tokio::test]
async fn batch_reports_states_in_order_and_keeps_input_order() {
    let tmp = tempfile::tempdir().unwrap();
    let recorder = Arc::new(Recorder::default());
    let config = SanitizerConfig::builder()
        .work_root(tmp.path())
        .progress_callback(recorder.clone())
        .build()
        .unwrap();
    let sanitizer = Sanitizer::new(dummy(2, None, PixelTransport::Stream), Arc::new(config));

    let docs: Vec<Document> = ["one.pdf", "two.pdf", "three.pdf"]
        .iter()
        .map(|n| Document::new(input(tmp.path(), n, b"%PDF-1.4")).unwrap())
        .collect();
    let ids: Vec<String> = docs.iter().map(|d| d.id().to_string()).collect();

    let done = sanitize_documents(&sanitizer, docs).await;

    let done_ids: Vec<&str> = done.iter().map(|d| d.id()).collect();
    assert_eq!(done_ids, ids);
    for doc in &done {
        assert_eq!(
            doc.history(),
            [
                DocumentState::Unconverted,
                DocumentState::Converting,
                DocumentState::Safe
            ]
        );
    }
    let states = recorder.states.lock().unwrap();
    assert_eq!(states.iter().filter(|s| **s == DocumentState::Safe).count(), 3);
    assert!(recorder
        .percentages
        .lock()
        .unwrap()
        .iter()
        .all(|p| (0.0..=100.0).contains(p)));
    assert_eq!(*recorder.batches.lock().unwrap(), vec![(3, 0)]);
}

#[tokio::test]
async fn one_failure_does_not_stop_the_batch() {
    let tmp = tempfile::tempdir().unwrap();
    let good = Document::new(input(tmp.path(), "good.pdf", b"%PDF-1.4")).unwrap();
    let mut bad = Document::new(input(tmp.path(), "bad.pdf", b"%PDF-1.4")).unwrap();
    // The output directory vanishes before the batch starts.
    let gone = tmp.path().join("gone");
    std::fs::create_dir(&gone).unwrap();
    bad.set_output_dir(&gone).unwrap();
    std::fs::remove_dir(&gone).unwrap();

    let sanitizer = Sanitizer::new(dummy(1, None, PixelTransport::Stream), config(tmp.path()));
    let done = sanitize_documents(&sanitizer, vec![good, bad]).await;

    assert_eq!(done[0].state(), DocumentState::Safe);
    assert_eq!(done[1].state(), DocumentState::Failed);
}

#[tokio::test]
async fn unusable_output_fails_before_any_sandbox_starts() {
    let tmp = tempfile::tempdir().unwrap();
    let mut doc = Document::new(input(tmp.path(), "a.pdf", b"%PDF-1.4")).unwrap();
    let gone = tmp.path().join("gone");
    std::fs::create_dir(&gone).unwrap();
    doc.set_output_dir(&gone).unwrap();
    std::fs::remove_dir(&gone).unwrap();

    let provider = Arc::new(ScriptedProvider::new(&["true"]));
    let starts = Arc::clone(&provider.starts);
    let sanitizer = Sanitizer::new(provider, config(tmp.path()));

    assert_eq!(sanitizer.sanitize(&mut doc).await, DocumentState::Failed);
    assert!(matches!(
        doc.failure(),
        Some(SanitizeError::OutputDirNotFound { .. })
    ));
    assert_eq!(doc.history(), [DocumentState::Unconverted, DocumentState::Failed]);
    assert_eq!(starts.load(Ordering::SeqCst), 0);
}

// ── Cancellation ─────────────────────────────────────────────────────────────

#[tokio::test]
async fn cancelling_a_live_phase_stops_it_once() {
    let tmp = tempfile::tempdir().unwrap();
    let docs_dir = tmp.path().join("docs");
    let work_dir = tmp.path().join("work");
    std::fs::create_dir_all(&docs_dir).unwrap();
    std::fs::create_dir_all(&work_dir).unwrap();
    let mut doc = Document::new(input(&docs_dir, "slow.pdf", b"%PDF-1.4")).unwrap();

    let provider = Arc::new(ScriptedProvider::new(&["sleep", "30"]));
    let terminations = Arc::clone(&provider.terminations);
    let sanitizer = Sanitizer::new(provider, config(&work_dir));

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(300)).await;
        trigger.cancel();
    });

    let started = Instant::now();
    let state = sanitizer.sanitize_with_cancel(&mut doc, &cancel).await;

    assert_eq!(state, DocumentState::Failed);
    assert!(matches!(doc.failure(), Some(SanitizeError::Cancelled)));
    assert!(started.elapsed() < Duration::from_secs(10));
    assert_eq!(terminations.load(Ordering::SeqCst), 1);
    assert_eq!(std::fs::read_dir(&work_dir).unwrap().count(), 0);
    assert!(!doc.output_path().exists());
    assert_eq!(std::fs::read_dir(&docs_dir).unwrap().count(), 1);
}

#[tokio::test]
async fn cancellation_cuts_short_the_wait_for_an_exit_status() {
    let tmp = tempfile::tempdir().unwrap();
    let mut doc = Document::new(input(tmp.path(), "mute.pdf", b"%PDF-1.4")).unwrap();

    // Closes stdout at once, then lingers without exiting.
    let provider = Arc::new(ScriptedProvider::new(&["sh", "-c", "exec >&-; sleep 30"]));
    let config = SanitizerConfig::builder()
        .work_root(tmp.path())
        .exit_status_wait(Duration::from_secs(20))
        .termination_grace(Duration::from_millis(500))
        .build()
        .unwrap();
    let sanitizer = Sanitizer::new(provider, Arc::new(config));

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(300)).await;
        trigger.cancel();
    });

    let started = Instant::now();
    let state = sanitizer.sanitize_with_cancel(&mut doc, &cancel).await;

    assert_eq!(state, DocumentState::Failed);
    assert!(matches!(doc.failure(), Some(SanitizeError::Cancelled)));
    assert!(started.elapsed() < Duration::from_secs(10));
}

#[tokio::test]
async fn stopping_one_document_leaves_its_sibling_running() {
    let tmp = tempfile::tempdir().unwrap();
    let mut stuck = Document::new(input(tmp.path(), "stuck.pdf", b"%PDF-1.4")).unwrap();
    let mut good = Document::new(input(tmp.path(), "good.pdf", b"%PDF-1.4")).unwrap();
    let provider = Arc::new(SplitProvider::new());
    let sanitizer = Sanitizer::new(provider.clone(), config(tmp.path()));

    let stop_stuck = CancellationToken::new();
    let trigger = stop_stuck.clone();
    tokio::spawn(async move {
        // Both phase A processes are alive at this point.
        tokio::time::sleep(Duration::from_millis(200)).await;
        trigger.cancel();
    });

    let never = CancellationToken::new();
    let (stuck_state, good_state) = tokio::join!(
        sanitizer.sanitize_with_cancel(&mut stuck, &stop_stuck),
        sanitizer.sanitize_with_cancel(&mut good, &never),
    );

    assert_eq!(stuck_state, DocumentState::Failed);
    assert!(matches!(stuck.failure(), Some(SanitizeError::Cancelled)));
    assert_eq!(good_state, DocumentState::Safe, "failure: {:?}", good.failure());
    assert_eq!(page_count(&good.output_path()), 2);
    assert_eq!(*provider.terminated.lock().unwrap(), vec![stuck.id().to_string()]);
}

#[tokio::test]
async fn unavailable_sandbox_fails_every_document() {
    let tmp = tempfile::tempdir().unwrap();
    let mut provider = ScriptedProvider::new(&["true"]);
    provider.available = false;
    let sanitizer = Sanitizer::new(Arc::new(provider), config(tmp.path()));

    let docs: Vec<Document> = ["a.pdf", "b.pdf"]
        .iter()
        .map(|n| Document::new(input(tmp.path(), n, b"%PDF-1.4")).unwrap())
        .collect();
    let done = sanitize_documents(&sanitizer, docs).await;

    for doc in &done {
        assert_eq!(doc.state(), DocumentState::Failed);
        assert!(matches!(
            doc.failure(),
            Some(SanitizeError::SandboxUnavailable { .. })
        ));
        assert_eq!(
            doc.history(),
            [DocumentState::Unconverted, DocumentState::Failed]
        );
    }
}
