//! Dummy backend: no sandbox at all. FOR TESTS ONLY.
//!
//! Phase A is a shell script that swallows the document and prints a fixed,
//! synthetic pixel stream; phase B runs the real worker binary unsandboxed.
//! This validates the orchestration layer without a container runtime or a
//! VM, and must never be used on untrusted input.

use super::{IsolationProvider, Phase, PhaseContext, PixelTransport, ProcessHandle};
use crate::document::Document;
use crate::error::SanitizeError;
use crate::protocol::BYTES_PER_PIXEL;
use async_trait::async_trait;
use nix::sys::signal::Signal;
use std::path::PathBuf;
use tokio::process::Command;
use tracing::{debug, warn};

/// Settings for [`DummyProvider`].
#[derive(Debug, Clone)]
pub struct DummyConfig {
    /// Must be set to acknowledge that nothing is isolated.
    pub acknowledge_unsafe: bool,
    /// Pages phase A emits. Default: 2.
    pub pages: u16,
    /// Page count phase A declares; `None` declares `pages`.
    pub declared_pages: Option<u16>,
    /// Page width in pixels. Default: 9.
    pub width: u16,
    /// Page height in pixels. Default: 9.
    pub height: u16,
    /// Worker binary run for phase B.
    pub worker_program: PathBuf,
    /// How pixels reach phase B. Default: [`PixelTransport::Stream`].
    pub transport: PixelTransport,
    /// Parallelism hint. Default: 1.
    pub max_parallel: usize,
}

impl Default for DummyConfig {
    fn default() -> Self {
        Self {
            acknowledge_unsafe: false,
            pages: 2,
            declared_pages: None,
            width: 9,
            height: 9,
            worker_program: PathBuf::from("sanitizer-worker"),
            transport: PixelTransport::Stream,
            max_parallel: 1,
        }
    }
}

/// Unsandboxed test backend.
#[derive(Debug, Clone)]
pub struct DummyProvider {
    config: DummyConfig,
}

fn octal_escapes(value: u16) -> String {
    value.to_be_bytes().iter().map(|b| format!("\\{b:03o}")).collect()
}

impl DummyProvider {
    /// Refuses to build unless `config.acknowledge_unsafe` is set.
    pub fn new(config: DummyConfig) -> Result<Self, SanitizeError> {
        if !config.acknowledge_unsafe {
            return Err(SanitizeError::InvalidConfig(
                "the dummy isolation provider is UNSAFE and only meant for tests".into(),
            ));
        }
        warn!("Using the dummy isolation provider: documents are NOT sandboxed");
        Ok(Self { config })
    }

    /// Shell script emitting the synthetic phase A stream.
    pub fn phase_a_script(&self) -> String {
        let c = &self.config;
        let declared = c.declared_pages.unwrap_or(c.pages);
        let page_bytes = usize::from(c.width) * usize::from(c.height) * BYTES_PER_PIXEL;
        format!(
            "cat > /dev/null\n\
             printf '{count}'\n\
             i=0\n\
             while [ \"$i\" -lt {pages} ]; do\n\
             \x20 printf '{width}{height}'\n\
             \x20 head -c {page_bytes} /dev/zero | tr '\\000' 'A'\n\
             \x20 i=$((i + 1))\n\
             done\n",
            count = octal_escapes(declared),
            pages = c.pages,
            width = octal_escapes(c.width),
            height = octal_escapes(c.height),
        )
    }
}

#[async_trait]
impl IsolationProvider for DummyProvider {
    fn name(&self) -> &str {
        "dummy"
    }

    async fn ensure_available(&self) -> Result<(), SanitizeError> {
        Ok(())
    }

    fn start_phase(
        &self,
        document: &Document,
        phase: Phase,
        ctx: &PhaseContext<'_>,
    ) -> Result<ProcessHandle, SanitizeError> {
        let mut cmd = match phase {
            Phase::DocumentToPixels => {
                let mut cmd = Command::new("sh");
                cmd.arg("-c").arg(self.phase_a_script());
                cmd
            }
            Phase::PixelsToPdf => {
                let mut cmd = Command::new(&self.config.worker_program);
                cmd.arg(phase.tag());
                if self.config.transport == PixelTransport::Directory {
                    cmd.env("PIXELS_DIR", ctx.workdir.pixels_dir());
                    cmd.env("SAFE_OUTPUT_DIR", ctx.workdir.output_dir());
                }
                match ctx.ocr_language {
                    Some(lang) => {
                        cmd.env("OCR", "1").env("OCR_LANGUAGE", lang.code());
                    }
                    None => {
                        cmd.env("OCR", "0");
                    }
                }
                cmd
            }
        };
        cmd.env_remove("QREXEC_SERVICE_ARGUMENT");
        debug!("[doc {}] Starting dummy {}", document.id(), phase);
        ProcessHandle::spawn(cmd, format!("dummy {phase} {}", document.id()))
            .map_err(|e| SanitizeError::io(format!("starting the dummy {phase} process"), e))
    }

    async fn terminate(&self, _document: &Document, _phase: Phase, handle: &mut ProcessHandle) {
        handle.signal_group(Signal::SIGTERM);
    }

    fn max_parallel(&self, _phase: Phase) -> usize {
        self.config.max_parallel.max(1)
    }

    fn pixel_transport(&self) -> PixelTransport {
        self.config.transport
    }
}
