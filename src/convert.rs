//! The conversion orchestrator: one document through both sandboxed phases.
//!
//! ```text
//! UNCONVERTED ─► CONVERTING ─┬─► SAFE
//!                            └─► FAILED
//! ```
//!
//! 1. Phase A is started with the untrusted document on its stdin. Its
//!    stdout is decoded and validated *on the host* and every page is
//!    deposited in the job's pixel directory.
//! 2. Phase B is started once phase A has exited successfully. Depending on
//!    the provider's [`PixelTransport`], the host either re-encodes the
//!    validated pages into its stdin or hands it the pixel directory.
//! 3. The PDF is staged beside the output path and renamed into place.
//!
//! Every stage is bounded by the phase deadline (`timeout + grace`) and by
//! the caller's [`CancellationToken`]. Whatever happens, a live phase is
//! stopped with [`stop_phase`] before the document leaves `CONVERTING`, and
//! no error ever escapes [`Sanitizer::sanitize`].

use crate::config::SanitizerConfig;
use crate::document::{Document, DocumentState};
use crate::error::{decode_exit_status, ConversionError, ExitOutcome, SanitizeError};
use crate::isolation::{
    stop_phase, IsolationProvider, JobWorkdir, Phase, PhaseContext, PixelTransport, ProcessHandle,
};
use crate::progress::ProgressEvent;
use crate::protocol::pixel_dir::PixelDir;
use crate::protocol::{read_page, read_page_count, write_page, write_page_count};
use crate::sanitize::replace_control_chars;
use futures::StreamExt;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::ChildStderr;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::codec::{FramedRead, LinesCodec, LinesCodecError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Longest stderr line kept from a sandboxed phase.
const MAX_STDERR_LINE: usize = 4096;

/// Bytes phase B may produce on top of twice the pixel bytes it was given.
const PDF_OUTPUT_SLACK: u64 = 64 * 1024 * 1024;

/// Largest PDF accepted from phase B for `pixel_bytes` of input.
fn pdf_output_limit(pixel_bytes: u64) -> u64 {
    pixel_bytes.saturating_mul(2).saturating_add(PDF_OUTPUT_SLACK)
}

/// Read `reader` to the end, refusing more than `limit` bytes.
///
/// A read error is [`ConversionError::ConverterProc`]; an oversized output
/// is [`ConversionError::Unexpected`].
async fn read_capped<R>(reader: R, limit: u64) -> Result<Vec<u8>, ConversionError>
where
    R: AsyncRead + Unpin,
{
    let mut out = Vec::new();
    reader
        .take(limit.saturating_add(1))
        .read_to_end(&mut out)
        .await
        .map_err(|e| {
            debug!("Reading phase B output failed: {}", e);
            ConversionError::ConverterProc
        })?;
    if out.len() as u64 > limit {
        warn!("Phase B produced more than {} bytes", limit);
        return Err(ConversionError::Unexpected);
    }
    Ok(out)
}

/// Drives documents through the two sandboxed phases of one provider.
#[derive(Clone)]
pub struct Sanitizer {
    provider: Arc<dyn IsolationProvider>,
    config: Arc<SanitizerConfig>,
}

impl std::fmt::Debug for Sanitizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sanitizer")
            .field("provider", &self.provider.name())
            .field("config", &self.config)
            .finish()
    }
}

impl Sanitizer {
    pub fn new(provider: Arc<dyn IsolationProvider>, config: Arc<SanitizerConfig>) -> Self {
        Self { provider, config }
    }

    pub fn provider(&self) -> &Arc<dyn IsolationProvider> {
        &self.provider
    }

    pub fn config(&self) -> &SanitizerConfig {
        &self.config
    }

    /// Sanitize one document. Returns its final state.
    pub async fn sanitize(&self, document: &mut Document) -> DocumentState {
        self.sanitize_with_cancel(document, &CancellationToken::new())
            .await
    }

    /// Like [`sanitize`](Self::sanitize), stopping early with
    /// [`SanitizeError::Cancelled`] once `cancel` fires.
    pub async fn sanitize_with_cancel(
        &self,
        document: &mut Document,
        cancel: &CancellationToken,
    ) -> DocumentState {
        if document.is_unconverted() {
            // The output location may have changed since the document was set up.
            if let Err(e) = document.validate_output() {
                self.fail(document, e);
                return document.state();
            }
        }
        if let Err(e) = document.mark_as_converting() {
            warn!("[doc {}] Not converting: {}", document.id(), e);
            return document.state();
        }
        self.notify_state(document);
        info!(
            "[doc {}] Converting '{}' with the {} backend",
            document.id(),
            document.input_path().display(),
            self.provider.name()
        );

        let result = {
            let mut job = ConversionJob::new(self, document);
            let result = job.run(cancel).await;
            job.shutdown().await;
            result
        };

        match result {
            Ok(()) => self.succeed(document).await,
            Err(e) => self.fail(document, e),
        }
        document.state()
    }

    async fn succeed(&self, document: &mut Document) {
        if let Err(e) = document.mark_as_safe() {
            error!("[doc {}] {}", document.id(), e);
            return;
        }
        info!(
            "[doc {}] Safe PDF written to '{}'",
            document.id(),
            document.output_path().display()
        );
        self.notify_state(document);

        if document.archive_after_conversion() {
            if let Err(e) = document.archive().await {
                warn!("[doc {}] Could not archive the original: {}", document.id(), e);
            }
        }
    }

    fn fail(&self, document: &mut Document, err: SanitizeError) {
        error!(
            "[doc {}] Conversion failed: {}",
            document.id(),
            replace_control_chars(&err.to_string(), false)
        );
        if let Some(cb) = &self.config.progress_callback {
            cb.on_progress(document.id(), &ProgressEvent::error(err.user_message(), 100.0));
        }
        if let Err(e) = document.mark_as_failed(err) {
            error!("[doc {}] {}", document.id(), e);
            return;
        }
        self.notify_state(document);
    }

    fn notify_state(&self, document: &Document) {
        if let Some(cb) = &self.config.progress_callback {
            cb.on_state_change(document.id(), document.state());
        }
    }

    /// `timeout(size, pages) + grace`, or `None` when timeouts are disabled.
    fn phase_limit(&self, size: u64, pages: Option<u16>) -> Option<Duration> {
        self.config
            .timeouts
            .timeout(size, pages.map(u32::from))
            .map(|t| t.saturating_add(self.config.phase_grace))
    }
}

/// Deadline of the phase being waited on.
#[derive(Debug, Clone, Copy)]
struct Budget {
    phase: Phase,
    started: Instant,
    limit: Option<Duration>,
}

impl Budget {
    fn start(phase: Phase, limit: Option<Duration>) -> Self {
        Self {
            phase,
            started: Instant::now(),
            limit,
        }
    }

    /// `None` when unbounded, or when the limit lies beyond what an
    /// `Instant` can represent.
    fn deadline(&self) -> Option<Instant> {
        self.limit.and_then(|l| self.started.checked_add(l))
    }

    /// Raise the limit to `limit`. Never lowers it.
    fn extend(&mut self, limit: Option<Duration>) {
        if let (Some(new), Some(old)) = (limit, self.limit) {
            if new > old {
                self.limit = Some(new);
            }
        }
    }

    fn expired(&self) -> SanitizeError {
        SanitizeError::Timeout {
            phase: self.phase,
            after: self.limit.unwrap_or_default(),
        }
    }
}

/// Await `fut` unless the budget runs out or the caller cancels first.
async fn bounded<T, F>(budget: Budget, cancel: &CancellationToken, fut: F) -> Result<T, SanitizeError>
where
    F: Future<Output = Result<T, SanitizeError>>,
{
    let expiry = async {
        match budget.deadline() {
            Some(deadline) => tokio::time::sleep_until(deadline).await,
            None => std::future::pending().await,
        }
    };
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(SanitizeError::Cancelled),
        _ = expiry => Err(budget.expired()),
        result = fut => result,
    }
}

/// Host-side state of one conversion: the scratch directory, the phase
/// currently running and the helper tasks attached to it.
struct ConversionJob<'a> {
    sanitizer: &'a Sanitizer,
    document: &'a Document,
    workdir: Option<JobWorkdir>,
    live: Option<(Phase, ProcessHandle)>,
    stdin_writer: Option<JoinHandle<()>>,
    stderr_forwarder: Option<JoinHandle<()>>,
}

impl<'a> ConversionJob<'a> {
    fn new(sanitizer: &'a Sanitizer, document: &'a Document) -> Self {
        Self {
            sanitizer,
            document,
            workdir: None,
            live: None,
            stdin_writer: None,
            stderr_forwarder: None,
        }
    }

    fn id(&self) -> &str {
        self.document.id()
    }

    async fn run(&mut self, cancel: &CancellationToken) -> Result<(), SanitizeError> {
        let transport = self.sanitizer.provider.pixel_transport();
        let workdir = JobWorkdir::create(
            self.sanitizer.config.work_root.as_deref(),
            self.id(),
            transport,
        )
        .map_err(|e| SanitizeError::io("creating the job directory", e))?;
        debug!("[doc {}] Job directory '{}'", self.id(), workdir.path().display());
        let workdir = &*self.workdir.insert(workdir);
        let pixel_dir = PixelDir::new(workdir.pixels_dir());
        let safe_pdf = workdir.safe_pdf();

        // ── Step 1: Document → pixels ────────────────────────────────────
        let (pages, pixel_bytes) = self.document_to_pixels(&pixel_dir, cancel).await?;

        // ── Step 2: Pixels → PDF ─────────────────────────────────────────
        let pdf = self
            .pixels_to_pdf(&pixel_dir, &safe_pdf, pages, pixel_bytes, transport, cancel)
            .await?;

        // ── Step 3: Move the PDF into place ──────────────────────────────
        publish(self.document, &pdf).await
    }

    fn start(&mut self, phase: Phase) -> Result<(), SanitizeError> {
        let ctx = PhaseContext {
            workdir: self.workdir.as_ref().ok_or_else(|| {
                SanitizeError::Internal("phase started without a job directory".into())
            })?,
            ocr_language: self.sanitizer.config.ocr_language,
        };
        let mut handle = self.sanitizer.provider.start_phase(self.document, phase, &ctx)?;
        if let Some(stderr) = handle.take_stderr() {
            self.stderr_forwarder = Some(self.forward_stderr(phase, stderr));
        }
        self.live = Some((phase, handle));
        Ok(())
    }

    fn handle(&mut self) -> Result<&mut ProcessHandle, SanitizeError> {
        self.live
            .as_mut()
            .map(|(_, h)| h)
            .ok_or_else(|| SanitizeError::Internal("no phase is running".into()))
    }

    fn forward_stderr(&self, phase: Phase, stderr: ChildStderr) -> JoinHandle<()> {
        let id = self.id().to_string();
        let callback = self.sanitizer.config.progress_callback.clone();
        let capture = self.sanitizer.config.capture_stderr;
        tokio::spawn(async move {
            let mut lines =
                FramedRead::new(stderr, LinesCodec::new_with_max_length(MAX_STDERR_LINE));
            while let Some(line) = lines.next().await {
                match line {
                    Ok(line) => match ProgressEvent::from_untrusted_line(&line) {
                        Some(event) => {
                            debug!("[doc {}] {} {:.1}%: {}", id, phase, event.percentage, event.text);
                            if let Some(cb) = &callback {
                                cb.on_progress(&id, &event);
                            }
                        }
                        None if capture => {
                            info!("[doc {}] {}: {}", id, phase, replace_control_chars(&line, false));
                        }
                        None => {}
                    },
                    Err(LinesCodecError::MaxLineLengthExceeded) => {
                        debug!("[doc {}] Dropped an over-long stderr line from {}", id, phase);
                    }
                    Err(LinesCodecError::Io(e)) => {
                        debug!("[doc {}] Stopped reading stderr of {}: {}", id, phase, e);
                        break;
                    }
                }
            }
        })
    }

    /// Turn a failure reading the worker's stream into the worker's own
    /// verdict, when it gives one.
    ///
    /// A broken or short stream usually means the worker failed. Give it
    /// `exit_status_wait` to exit and prefer its exit status over the
    /// generic stream error.
    async fn verdict(
        &mut self,
        err: ConversionError,
        budget: Budget,
        cancel: &CancellationToken,
    ) -> SanitizeError {
        if !matches!(
            err,
            ConversionError::Pages | ConversionError::NoPageCount | ConversionError::ConverterProc
        ) {
            return err.into();
        }
        let wait = self.sanitizer.config.exit_status_wait;
        let Ok(handle) = self.handle() else {
            return err.into();
        };
        let exited = bounded(budget, cancel, async {
            Ok(tokio::time::timeout(wait, handle.wait()).await)
        })
        .await;
        match exited {
            Err(stopped) => stopped,
            Ok(Ok(Ok(status))) => match decode_exit_status(status.code()) {
                ExitOutcome::Conversion(reported) => reported.into(),
                ExitOutcome::LaunchFailure(status) => SanitizeError::SandboxLaunchFailure { status },
                ExitOutcome::Success | ExitOutcome::Unknown(_) => err.into(),
            },
            Ok(Ok(Err(e))) => SanitizeError::io("waiting for the sandbox", e),
            Ok(Err(_)) => {
                debug!(
                    "[doc {}] Sandbox did not exit within {}s of a stream error",
                    self.id(),
                    wait.as_secs()
                );
                err.into()
            }
        }
    }

    /// Wait for the live phase to exit and decode its status.
    async fn finish_phase(
        &mut self,
        budget: Budget,
        cancel: &CancellationToken,
    ) -> Result<(), SanitizeError> {
        let handle = self.handle()?;
        let status = bounded(budget, cancel, async {
            handle
                .wait()
                .await
                .map_err(|e| SanitizeError::io("waiting for the sandbox", e))
        })
        .await?;
        let outcome = decode_exit_status(status.code());
        debug!("[doc {}] {} exited: {:?}", self.id(), budget.phase, outcome);
        match outcome {
            ExitOutcome::Success => {}
            ExitOutcome::Conversion(e) => return Err(e.into()),
            ExitOutcome::LaunchFailure(status) => {
                return Err(SanitizeError::SandboxLaunchFailure { status })
            }
            ExitOutcome::Unknown(code) => {
                warn!("[doc {}] {} exited with {:?}", self.id(), budget.phase, code);
                return Err(ConversionError::Unexpected.into());
            }
        }

        self.live = None;
        if let Some(writer) = self.stdin_writer.take() {
            writer.abort();
        }
        // Drain the progress stream so messages keep their order across phases.
        if let Some(forwarder) = self.stderr_forwarder.take() {
            let grace = self.sanitizer.config.phase_grace;
            if tokio::time::timeout(grace, forwarder).await.is_err() {
                debug!("[doc {}] stderr of {} still open after exit", self.id(), budget.phase);
            }
        }
        Ok(())
    }

    /// Phase A. Returns the page count and the total pixel byte count.
    async fn document_to_pixels(
        &mut self,
        pixel_dir: &PixelDir,
        cancel: &CancellationToken,
    ) -> Result<(u16, u64), SanitizeError> {
        let input = self.document.input_path().to_path_buf();
        let size = tokio::fs::metadata(&input)
            .await
            .map_err(|e| SanitizeError::io("reading the input document size", e))?
            .len();
        let mut budget = Budget::start(Phase::DocumentToPixels, self.sanitizer.phase_limit(size, None));

        self.start(Phase::DocumentToPixels)?;
        let id = self.id().to_string();
        let handle = self.handle()?;
        let mut stdout = handle
            .take_stdout()
            .ok_or_else(|| SanitizeError::Internal("phase A has no stdout".into()))?;
        let writer = handle.feed_stdin(move |mut stdin| async move {
            let result = async {
                let mut file = tokio::fs::File::open(&input).await?;
                tokio::io::copy(&mut file, &mut stdin).await?;
                stdin.shutdown().await
            }
            .await;
            if let Err(e) = result {
                // The worker may legitimately stop reading early.
                debug!("[doc {}] Stopped sending the document: {}", id, e);
            }
        });
        self.stdin_writer = writer;

        let pages = match bounded(budget, cancel, async {
            Ok(read_page_count(&mut stdout).await)
        })
        .await?
        {
            Ok(pages) => pages,
            Err(e) => return Err(self.verdict(e, budget, cancel).await),
        };
        info!("[doc {}] Document has {} pages", self.id(), pages);
        budget.extend(self.sanitizer.phase_limit(size, Some(pages)));

        let mut pixel_bytes = 0u64;
        for index in 1..=pages {
            let page = match bounded(budget, cancel, async {
                Ok(read_page(&mut stdout, index).await)
            })
            .await?
            {
                Ok(page) => page,
                Err(e) => return Err(self.verdict(e, budget, cancel).await),
            };
            pixel_bytes += page.pixels.len() as u64;
            pixel_dir
                .write_page(&page)
                .await
                .map_err(|e| SanitizeError::io("saving page pixels", e))?;
        }
        drop(stdout);

        self.finish_phase(budget, cancel).await?;
        Ok((pages, pixel_bytes))
    }

    /// Phase B. Returns where the finished PDF was left.
    async fn pixels_to_pdf(
        &mut self,
        pixel_dir: &PixelDir,
        safe_pdf: &Path,
        pages: u16,
        pixel_bytes: u64,
        transport: PixelTransport,
        cancel: &CancellationToken,
    ) -> Result<StagedPdf, SanitizeError> {
        let budget = Budget::start(
            Phase::PixelsToPdf,
            self.sanitizer.phase_limit(pixel_bytes, Some(pages)),
        );

        self.start(Phase::PixelsToPdf)?;
        let id = self.id().to_string();
        let dir = pixel_dir.clone();
        let handle = self.handle()?;
        let stdout = handle
            .take_stdout()
            .ok_or_else(|| SanitizeError::Internal("phase B has no stdout".into()))?;

        self.stdin_writer = match transport {
            PixelTransport::Stream => handle.feed_stdin(move |mut stdin| async move {
                let result: Result<(), ConversionError> = async {
                    write_page_count(&mut stdin, pages).await?;
                    for index in 1..=pages {
                        let page = dir.read_page(index).await?;
                        write_page(&mut stdin, &page).await?;
                    }
                    stdin.shutdown().await.map_err(|_| ConversionError::ConverterProc)
                }
                .await;
                if let Err(e) = result {
                    debug!("[doc {}] Stopped sending pixels: {}", id, e);
                }
            }),
            // Closing stdin tells a directory-based worker there is nothing
            // more to wait for.
            PixelTransport::Directory => {
                drop(handle.take_stdin());
                None
            }
        };

        let limit = pdf_output_limit(pixel_bytes);
        let pdf = match bounded(budget, cancel, async { Ok(read_capped(stdout, limit).await) })
            .await?
        {
            Ok(pdf) => pdf,
            Err(e) => return Err(self.verdict(e, budget, cancel).await),
        };
        self.finish_phase(budget, cancel).await?;

        let staged = match transport {
            PixelTransport::Stream => StagedPdf::Bytes(pdf),
            PixelTransport::Directory => StagedPdf::File(safe_pdf.to_path_buf()),
        };
        staged.check(limit).await?;
        Ok(staged)
    }

    /// Stop whatever is still running. Never fails.
    async fn shutdown(&mut self) {
        if let Some(writer) = self.stdin_writer.take() {
            writer.abort();
        }
        if let Some((phase, mut handle)) = self.live.take() {
            let config = &self.sanitizer.config;
            stop_phase(
                self.sanitizer.provider.as_ref(),
                self.document,
                phase,
                &mut handle,
                config.termination_grace,
                config.force_kill_wait,
            )
            .await;
        }
        if let Some(forwarder) = self.stderr_forwarder.take() {
            forwarder.abort();
        }
    }
}

/// The PDF produced by phase B, before it is moved into place.
#[derive(Debug)]
enum StagedPdf {
    Bytes(Vec<u8>),
    File(PathBuf),
}

impl StagedPdf {
    /// Must start with `%PDF` and be no larger than `limit` bytes.
    async fn check(&self, limit: u64) -> Result<(), SanitizeError> {
        let head = match self {
            StagedPdf::Bytes(bytes) => {
                if bytes.len() as u64 > limit {
                    return Err(ConversionError::Unexpected.into());
                }
                bytes.get(..4).map(<[u8]>::to_vec)
            }
            StagedPdf::File(path) => {
                let mut head = Vec::with_capacity(4);
                match tokio::fs::File::open(path).await {
                    Ok(file) => {
                        let len = file
                            .metadata()
                            .await
                            .map_err(|e| SanitizeError::io("reading the safe PDF", e))?
                            .len();
                        if len > limit {
                            warn!("Phase B left a {} byte PDF, over the {} byte limit", len, limit);
                            return Err(ConversionError::Unexpected.into());
                        }
                        file.take(4)
                            .read_to_end(&mut head)
                            .await
                            .map_err(|e| SanitizeError::io("reading the safe PDF", e))?;
                    }
                    Err(e) => {
                        warn!("Phase B left no PDF at '{}': {}", path.display(), e);
                        return Err(ConversionError::Unexpected.into());
                    }
                };
                Some(head)
            }
        };
        match head {
            Some(head) if head == b"%PDF" => Ok(()),
            _ => Err(ConversionError::Unexpected.into()),
        }
    }
}

/// Stage the PDF beside the output path and rename it into place.
async fn publish(document: &Document, pdf: &StagedPdf) -> Result<(), SanitizeError> {
    let output = document.output_path();
    let parent = output.parent().unwrap_or_else(|| Path::new("/"));
    let name = output
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let staging = parent.join(format!(".{}.{}.tmp", name, document.id()));

    let written = match pdf {
        StagedPdf::Bytes(bytes) => tokio::fs::write(&staging, bytes).await,
        StagedPdf::File(path) => tokio::fs::copy(path, &staging).await.map(|_| ()),
    };
    let result = match written {
        Ok(()) => tokio::fs::rename(&staging, &output).await,
        Err(e) => Err(e),
    };
    if let Err(e) = result {
        let _ = tokio::fs::remove_file(&staging).await;
        return Err(SanitizeError::io(
            format!("writing the safe PDF to '{}'", output.display()),
            e,
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn budget_only_grows() {
        let mut b = Budget::start(Phase::DocumentToPixels, Some(Duration::from_secs(60)));
        b.extend(Some(Duration::from_secs(30)));
        assert_eq!(b.limit, Some(Duration::from_secs(60)));
        b.extend(Some(Duration::from_secs(90)));
        assert_eq!(b.limit, Some(Duration::from_secs(90)));
        b.extend(None);
        assert_eq!(b.limit, Some(Duration::from_secs(90)));

        let far = Budget::start(Phase::PixelsToPdf, Some(Duration::MAX));
        assert!(far.deadline().is_none());

        let mut unbounded = Budget::start(Phase::PixelsToPdf, None);
        unbounded.extend(Some(Duration::from_secs(1)));
        assert!(unbounded.deadline().is_none());
    }

    #[tokio::test]
    async fn bounded_reports_the_limit_on_expiry() {
        let budget = Budget::start(Phase::PixelsToPdf, Some(Duration::from_millis(50)));
        let err = bounded(budget, &CancellationToken::new(), async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok::<_, SanitizeError>(())
        })
        .await
        .unwrap_err();
        match err {
            SanitizeError::Timeout { phase, after } => {
                assert_eq!(phase, Phase::PixelsToPdf);
                assert_eq!(after, Duration::from_millis(50));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn cancellation_wins() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let budget = Budget::start(Phase::DocumentToPixels, None);
        let err = bounded(budget, &cancel, std::future::pending::<Result<(), SanitizeError>>())
            .await
            .unwrap_err();
        assert!(matches!(err, SanitizeError::Cancelled));
    }

    #[tokio::test]
    async fn staged_output_must_look_like_a_pdf() {
        let limit = pdf_output_limit(0);
        assert!(StagedPdf::Bytes(b"%PDF-1.5 ...".to_vec()).check(limit).await.is_ok());
        assert!(StagedPdf::Bytes(b"<html>".to_vec()).check(limit).await.is_err());
        assert!(StagedPdf::Bytes(Vec::new()).check(limit).await.is_err());
        let tmp = tempfile::tempdir().unwrap();
        assert!(StagedPdf::File(tmp.path().join("missing.pdf")).check(limit).await.is_err());
    }

    #[tokio::test]
    async fn staged_file_over_the_limit_is_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("safe.pdf");
        std::fs::write(&path, b"%PDF-1.7 0123456789").unwrap();
        assert!(StagedPdf::File(path.clone()).check(64).await.is_ok());
        let err = StagedPdf::File(path).check(8).await.unwrap_err();
        assert!(matches!(err, SanitizeError::Conversion(ConversionError::Unexpected)));
    }

    #[test]
    fn output_limit_scales_with_pixels_and_saturates() {
        assert_eq!(pdf_output_limit(0), PDF_OUTPUT_SLACK);
        assert_eq!(pdf_output_limit(10), PDF_OUTPUT_SLACK + 20);
        assert_eq!(pdf_output_limit(u64::MAX), u64::MAX);
    }

    #[tokio::test]
    async fn phase_b_output_is_capped() {
        let pdf = read_capped(&b"%PDF-1.7 ok"[..], 11).await.unwrap();
        assert_eq!(pdf, b"%PDF-1.7 ok");

        let flood = tokio::io::repeat(b'A');
        let err = read_capped(flood, 1024).await.unwrap_err();
        assert_eq!(err, ConversionError::Unexpected);
    }

    #[tokio::test]
    async fn phase_b_read_errors_become_converter_failures() {
        let broken = tokio_test::io::Builder::new()
            .read(b"%PDF")
            .read_error(std::io::Error::other("pipe closed"))
            .build();
        assert_eq!(
            read_capped(broken, 1024).await.unwrap_err(),
            ConversionError::ConverterProc
        );
    }
}
