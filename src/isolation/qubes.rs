//! Disposable-VM backend (Qubes OS).
//!
//! Each phase is one qrexec call into a fresh disposable VM:
//!
//! ```text
//! qrexec-client-vm @dispvm:<template> <service>            (phase A)
//! qrexec-client-vm @dispvm:<template> <service>+<ocr code> (phase B)
//! ```
//!
//! The VM is offline and discarded when the call returns. Both phases speak
//! the wire protocol over the call's stdin/stdout.
//!
//! There is no host-side primitive to kill a disposable VM from a domU.
//! Terminating a phase closes its stdin and stdout so the worker hits
//! end-of-stream and exits; stderr stays open for diagnostics. If the VM is
//! stuck regardless, [`super::stop_phase`] kills the local qrexec client.

use super::{IsolationProvider, Phase, PhaseContext, ProcessHandle};
use crate::document::Document;
use crate::error::SanitizeError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::{debug, info};

/// File present inside every Qubes VM.
pub const QUBES_MARKER: &str = "/usr/share/qubes/marker-vm";

/// Whether this process runs inside a Qubes VM.
pub fn running_on_qubes() -> bool {
    Path::new(QUBES_MARKER).exists()
}

/// Settings for [`DisposableVmProvider`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DisposableVmConfig {
    /// qrexec client binary. Default: `/usr/bin/qrexec-client-vm`.
    pub client: PathBuf,
    /// Disposable VM template. Default: `docsanitize-dvm`.
    pub template: String,
    /// RPC service running phase A. Default: `docsanitize.DocumentToPixels`.
    pub document_to_pixels_service: String,
    /// RPC service running phase B. Default: `docsanitize.PixelsToPdf`.
    pub pixels_to_pdf_service: String,
}

impl Default for DisposableVmConfig {
    fn default() -> Self {
        Self {
            client: PathBuf::from("/usr/bin/qrexec-client-vm"),
            template: "docsanitize-dvm".to_string(),
            document_to_pixels_service: "docsanitize.DocumentToPixels".to_string(),
            pixels_to_pdf_service: "docsanitize.PixelsToPdf".to_string(),
        }
    }
}

/// Runs each phase in a disposable VM.
#[derive(Debug, Clone, Default)]
pub struct DisposableVmProvider {
    config: DisposableVmConfig,
}

impl DisposableVmProvider {
    pub fn new(config: DisposableVmConfig) -> Self {
        Self { config }
    }

    /// `<service>[+<argument>]` for one phase.
    pub fn service_call(&self, phase: Phase, ctx: &PhaseContext<'_>) -> String {
        match phase {
            Phase::DocumentToPixels => self.config.document_to_pixels_service.clone(),
            Phase::PixelsToPdf => match ctx.ocr_language {
                Some(lang) => format!("{}+{}", self.config.pixels_to_pdf_service, lang.code()),
                None => self.config.pixels_to_pdf_service.clone(),
            },
        }
    }
}

#[async_trait]
impl IsolationProvider for DisposableVmProvider {
    fn name(&self) -> &str {
        "qubes"
    }

    async fn ensure_available(&self) -> Result<(), SanitizeError> {
        if !running_on_qubes() {
            return Err(SanitizeError::SandboxUnavailable {
                backend: self.name().to_string(),
                detail: format!("'{QUBES_MARKER}' not found; not running inside Qubes OS"),
            });
        }
        which::which(&self.config.client).map_err(|e| SanitizeError::SandboxUnavailable {
            backend: self.name().to_string(),
            detail: format!("{}: {e}", self.config.client.display()),
        })?;
        Ok(())
    }

    fn start_phase(
        &self,
        document: &Document,
        phase: Phase,
        ctx: &PhaseContext<'_>,
    ) -> Result<ProcessHandle, SanitizeError> {
        let target = format!("@dispvm:{}", self.config.template);
        let service = self.service_call(phase, ctx);
        info!(
            "[doc {}] > {} {} {}",
            document.id(),
            self.config.client.display(),
            target,
            service
        );
        let mut cmd = Command::new(&self.config.client);
        cmd.arg(target).arg(service);
        ProcessHandle::spawn(cmd, format!("qrexec {phase} {}", document.id()))
            .map_err(|e| SanitizeError::io(format!("starting the {phase} disposable VM"), e))
    }

    async fn terminate(&self, document: &Document, phase: Phase, handle: &mut ProcessHandle) {
        debug!(
            "[doc {}] Closing the standard streams of {} to stop the disposable VM",
            document.id(),
            phase
        );
        handle.close_streams();
    }

    fn max_parallel(&self, _phase: Phase) -> usize {
        1
    }
}
