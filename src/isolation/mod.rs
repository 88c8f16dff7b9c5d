//! Sandbox backends that run the two conversion phases.
//!
//! Every backend implements [`IsolationProvider`]:
//!
//! | Provider | Sandbox | Termination |
//! |----------|---------|-------------|
//! | [`ContainerProvider`] | one hardened container per phase | runtime `kill` + local process group |
//! | [`DisposableVmProvider`] | one disposable VM per phase, over qrexec | close stdin/stdout |
//! | [`DummyProvider`] | none (tests only) | local process group |
//!
//! ## Why a trait object?
//!
//! The orchestrator only needs four things from a backend: start a phase,
//! stop it, report how many can run at once, and say how pixels travel
//! between the phases. Anything else a backend can do stays private to it,
//! so the orchestrator never assumes behaviour a backend did not declare.
//!
//! [`stop_phase`] holds the escalation sequence shared by every backend
//! (terminate → grace → SIGKILL the process group → force wait).

pub mod container;
pub mod dummy;
pub mod process;
pub mod qubes;

pub use container::{ContainerConfig, ContainerProvider, ContainerRuntime};
pub use dummy::{DummyConfig, DummyProvider};
pub use process::ProcessHandle;
pub use qubes::{DisposableVmConfig, DisposableVmProvider};

use crate::document::Document;
use crate::error::SanitizeError;
use crate::ocr::OcrLanguage;
use async_trait::async_trait;
use nix::sys::signal::Signal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::TempDir;
use tracing::{debug, warn};

/// File name of the final PDF inside a phase B output directory.
pub const SAFE_PDF_NAME: &str = "safe-output-compressed.pdf";

/// The two halves of the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Phase {
    /// Phase A: untrusted document → pixels.
    DocumentToPixels,
    /// Phase B: pixels → flat PDF.
    PixelsToPdf,
}

impl Phase {
    /// Argument passed to the worker to select this phase.
    pub const fn tag(self) -> &'static str {
        match self {
            Phase::DocumentToPixels => "document-to-pixels",
            Phase::PixelsToPdf => "pixels-to-pdf",
        }
    }

    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "document-to-pixels" => Some(Phase::DocumentToPixels),
            "pixels-to-pdf" => Some(Phase::PixelsToPdf),
            _ => None,
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

/// How phase A's pixels reach phase B.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PixelTransport {
    /// The host re-encodes the pages into phase B's stdin and reads the PDF
    /// from its stdout.
    #[default]
    Stream,
    /// The pixel directory is handed to phase B read-only, and phase B
    /// writes the PDF into the job's output directory.
    Directory,
}

/// Host-side scratch space of one job. Removed on drop.
#[derive(Debug)]
pub struct JobWorkdir {
    root: TempDir,
    pixels: PathBuf,
    output: PathBuf,
}

impl JobWorkdir {
    /// Create the job directories under `root` (or the system temp dir).
    ///
    /// With [`PixelTransport::Directory`] the output directory is made
    /// writable by the sandbox user; the enclosing directory stays private.
    pub fn create(root: Option<&Path>, doc_id: &str, transport: PixelTransport) -> io::Result<Self> {
        let mut builder = tempfile::Builder::new();
        let prefix = format!("docsanitize-{doc_id}-");
        builder.prefix(&prefix);
        let root = match root {
            Some(dir) => builder.tempdir_in(dir)?,
            None => builder.tempdir()?,
        };
        let pixels = root.path().join("pixels");
        let output = root.path().join("output");
        std::fs::create_dir(&pixels)?;
        std::fs::create_dir(&output)?;
        if transport == PixelTransport::Directory {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&pixels, std::fs::Permissions::from_mode(0o755))?;
            std::fs::set_permissions(&output, std::fs::Permissions::from_mode(0o777))?;
            std::fs::set_permissions(root.path(), std::fs::Permissions::from_mode(0o711))?;
        }
        Ok(Self {
            root,
            pixels,
            output,
        })
    }

    pub fn path(&self) -> &Path {
        self.root.path()
    }

    /// Where the host deposits phase A's validated pages.
    pub fn pixels_dir(&self) -> &Path {
        &self.pixels
    }

    /// Where phase B's PDF ends up.
    pub fn output_dir(&self) -> &Path {
        &self.output
    }

    pub fn safe_pdf(&self) -> PathBuf {
        self.output.join(SAFE_PDF_NAME)
    }
}

/// Everything a provider needs to start one phase of one document.
#[derive(Debug, Clone, Copy)]
pub struct PhaseContext<'a> {
    pub workdir: &'a JobWorkdir,
    pub ocr_language: Option<OcrLanguage>,
}

/// A sandbox backend.
#[async_trait]
pub trait IsolationProvider: Send + Sync {
    /// Short backend name for logs and errors.
    fn name(&self) -> &str;

    /// Fail with [`SanitizeError::SandboxUnavailable`] when the sandbox
    /// technology cannot be used. Called before any phase is started.
    async fn ensure_available(&self) -> Result<(), SanitizeError>;

    /// Spawn `phase` for `document`. Returns as soon as the process exists;
    /// stdin, stdout and stderr are piped.
    fn start_phase(
        &self,
        document: &Document,
        phase: Phase,
        ctx: &PhaseContext<'_>,
    ) -> Result<ProcessHandle, SanitizeError>;

    /// Ask a running phase to stop. Best effort, never fails, and safe to
    /// call on a phase that already exited.
    async fn terminate(&self, document: &Document, phase: Phase, handle: &mut ProcessHandle);

    /// How many documents this backend can safely convert at once.
    fn max_parallel(&self, phase: Phase) -> usize;

    fn pixel_transport(&self) -> PixelTransport {
        PixelTransport::Stream
    }

    /// Called once a phase has been stopped, to report leftovers.
    async fn after_stop(&self, document: &Document, phase: Phase) {
        let _ = (document, phase);
    }
}

/// Make sure a phase is gone.
///
/// Skips everything if the process already exited. Otherwise asks the
/// provider to terminate it, waits `grace`, kills the process group, and
/// waits `force`. Never fails; lingering resources are logged.
pub async fn stop_phase(
    provider: &dyn IsolationProvider,
    document: &Document,
    phase: Phase,
    handle: &mut ProcessHandle,
    grace: Duration,
    force: Duration,
) {
    escalate(provider, document, phase, handle, grace, force).await;
    provider.after_stop(document, phase).await;
}

async fn escalate(
    provider: &dyn IsolationProvider,
    document: &Document,
    phase: Phase,
    handle: &mut ProcessHandle,
    grace: Duration,
    force: Duration,
) {
    if let Some(status) = handle.try_status() {
        debug!("[doc {}] {} already exited ({})", document.id(), phase, status);
        return;
    }

    if tokio::time::timeout(grace, provider.terminate(document, phase, handle))
        .await
        .is_err()
    {
        warn!(
            "[doc {}] Terminating {} via {} did not complete within {}s",
            document.id(),
            phase,
            provider.name(),
            grace.as_secs()
        );
    }

    if tokio::time::timeout(grace, handle.wait()).await.is_ok() {
        return;
    }
    warn!(
        "[doc {}] {} did not terminate gracefully after {}s. Killing it forcefully...",
        document.id(),
        phase,
        grace.as_secs()
    );

    handle.signal_group(Signal::SIGKILL);
    if tokio::time::timeout(force, handle.wait()).await.is_err() {
        warn!(
            "[doc {}] {} did not terminate forcefully after {}s. Resources may linger...",
            document.id(),
            phase,
            force.as_secs()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phase_tags_round_trip() {
        for phase in [Phase::DocumentToPixels, Phase::PixelsToPdf] {
            assert_eq!(Phase::from_tag(phase.tag()), Some(phase));
        }
        assert_eq!(Phase::from_tag("pixels"), None);
    }

    #[test]
    fn workdir_layout() {
        let tmp = tempfile::tempdir().unwrap();
        let w = JobWorkdir::create(Some(tmp.path()), "abc123", PixelTransport::Stream).unwrap();
        assert!(w.pixels_dir().is_dir());
        assert!(w.output_dir().is_dir());
        assert!(w.path().file_name().unwrap().to_string_lossy().starts_with("docsanitize-abc123-"));
        let root = w.path().to_path_buf();
        drop(w);
        assert!(!root.exists());
    }

    #[test]
    fn shared_output_dir_is_writable_by_sandbox_user() {
        use std::os::unix::fs::PermissionsExt;
        let tmp = tempfile::tempdir().unwrap();
        let w = JobWorkdir::create(Some(tmp.path()), "abc123", PixelTransport::Directory).unwrap();
        let mode = std::fs::metadata(w.output_dir()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o777);
    }
}
