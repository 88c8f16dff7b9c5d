//! Container backend (Podman or Docker).
//!
//! Each phase runs in its own, uniquely named container:
//!
//! ```text
//! <prefix>-document-to-pixels-<doc id>
//! <prefix>-pixels-to-pdf-<doc id>
//! ```
//!
//! Containers get no network, drop every capability except `SYS_CHROOT`
//! (needed by the nested sandbox inside the image), run as an unprivileged
//! user with `no-new-privileges`, and optionally a custom seccomp profile.
//!
//! Phase A receives the document on stdin and writes the pixel stream on
//! stdout. Phase B gets the host's pixel directory mounted read-only and a
//! fresh output directory, and writes the final PDF there.
//!
//! ## Termination
//!
//! The `podman run` / `docker run` process on the host is not tied to the
//! container: with Docker it is only a client of the daemon. Terminating a
//! phase therefore does two independent things: `<runtime> kill <name>`
//! (bounded by [`KILL_TIMEOUT`]) and SIGTERM to the local process group, in
//! case the client is stuck on I/O after the container is gone.

use super::{IsolationProvider, Phase, PhaseContext, PixelTransport, ProcessHandle};
use crate::document::Document;
use crate::error::SanitizeError;
use crate::sanitize::replace_control_chars;
use async_trait::async_trait;
use nix::sys::signal::Signal;
use serde::{Deserialize, Serialize};
use std::ffi::OsString;
use std::fmt;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Ceiling on `<runtime> kill`. Fixed: some runtimes hang on kill.
pub const KILL_TIMEOUT: Duration = Duration::from_secs(5);

/// Where phase B finds the pixels inside the container.
pub const CONTAINER_PIXELS_DIR: &str = "/safezone/pixels";
/// Where phase B writes the PDF inside the container.
pub const CONTAINER_OUTPUT_DIR: &str = "/safezone/output";

/// Supported container runtimes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerRuntime {
    Podman,
    Docker,
}

impl ContainerRuntime {
    pub const fn binary_name(self) -> &'static str {
        match self {
            ContainerRuntime::Podman => "podman",
            ContainerRuntime::Docker => "docker",
        }
    }

    /// Podman first, then Docker.
    pub fn detect() -> Option<(Self, PathBuf)> {
        [ContainerRuntime::Podman, ContainerRuntime::Docker]
            .into_iter()
            .find_map(|rt| which::which(rt.binary_name()).ok().map(|p| (rt, p)))
    }
}

impl fmt::Display for ContainerRuntime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.binary_name())
    }
}

impl std::str::FromStr for ContainerRuntime {
    type Err = SanitizeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "podman" => Ok(ContainerRuntime::Podman),
            "docker" => Ok(ContainerRuntime::Docker),
            other => Err(SanitizeError::InvalidConfig(format!(
                "unknown container runtime '{other}'"
            ))),
        }
    }
}

/// Settings for [`ContainerProvider`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerConfig {
    /// Runtime to use. `None` auto-detects. Default: None.
    pub runtime: Option<ContainerRuntime>,
    /// Explicit path to the runtime binary. Default: looked up on `PATH`.
    pub runtime_path: Option<PathBuf>,
    /// Verified worker image, `name:tag`. Default: `docsanitize-worker:latest`.
    pub image: String,
    /// Prefix of container names. Default: `docsanitize`.
    pub name_prefix: String,
    /// Custom seccomp profile. Default: None (runtime default).
    pub seccomp_profile: Option<PathBuf>,
    /// Command that starts the worker inside the image; the phase tag is
    /// appended. Default: `["/usr/local/bin/sanitizer-worker"]`.
    pub worker_command: Vec<String>,
    /// User the worker runs as inside the container. Default: `sanitizer`.
    pub user: String,
    /// Parallelism hint. Default: 1.
    pub max_parallel: usize,
}

impl Default for ContainerConfig {
    fn default() -> Self {
        Self {
            runtime: None,
            runtime_path: None,
            image: "docsanitize-worker:latest".to_string(),
            name_prefix: "docsanitize".to_string(),
            seccomp_profile: None,
            worker_command: vec!["/usr/local/bin/sanitizer-worker".to_string()],
            user: "sanitizer".to_string(),
            max_parallel: 1,
        }
    }
}

/// Runs each phase in a hardened container.
#[derive(Debug, Clone)]
pub struct ContainerProvider {
    config: ContainerConfig,
    runtime: ContainerRuntime,
    binary: PathBuf,
}

impl ContainerProvider {
    /// Resolve the runtime binary.
    ///
    /// Fails with [`SanitizeError::SandboxUnavailable`] if no runtime is
    /// installed.
    pub fn new(config: ContainerConfig) -> Result<Self, SanitizeError> {
        let (runtime, binary) = match (config.runtime, &config.runtime_path) {
            (Some(rt), Some(path)) => (rt, path.clone()),
            (Some(rt), None) => {
                let path = which::which(rt.binary_name()).map_err(|e| {
                    SanitizeError::SandboxUnavailable {
                        backend: rt.to_string(),
                        detail: e.to_string(),
                    }
                })?;
                (rt, path)
            }
            (None, _) => ContainerRuntime::detect().ok_or_else(|| {
                SanitizeError::SandboxUnavailable {
                    backend: "container".to_string(),
                    detail: "neither podman nor docker was found on PATH".to_string(),
                }
            })?,
        };
        info!("Using container runtime {} at '{}'", runtime, binary.display());
        Ok(Self {
            config,
            runtime,
            binary,
        })
    }

    pub fn runtime(&self) -> ContainerRuntime {
        self.runtime
    }

    /// Unique container name of one phase of one document.
    pub fn container_name(&self, document: &Document, phase: Phase) -> String {
        format!("{}-{}-{}", self.config.name_prefix, phase.tag(), document.id())
    }

    fn security_args(&self) -> Vec<OsString> {
        let mut args: Vec<OsString> = Vec::new();
        match self.runtime {
            ContainerRuntime::Podman => {
                args.extend(["--log-driver", "none"].map(OsString::from));
                args.extend(["--security-opt", "no-new-privileges"].map(OsString::from));
                args.extend(["--userns", "nomap"].map(OsString::from));
            }
            ContainerRuntime::Docker => {
                args.push("--security-opt=no-new-privileges:true".into());
            }
        }
        if let Some(profile) = &self.config.seccomp_profile {
            args.push("--security-opt".into());
            let mut opt = OsString::from("seccomp=");
            opt.push(profile);
            args.push(opt);
        }
        args.extend(["--cap-drop", "all", "--cap-add", "SYS_CHROOT"].map(OsString::from));
        args.extend(["--security-opt", "label=type:container_engine_t"].map(OsString::from));
        args.push("--network=none".into());
        args.extend(["-u".into(), OsString::from(&self.config.user)]);
        args
    }

    /// Full argument list for `<runtime> run` of one phase.
    pub fn run_args(&self, document: &Document, phase: Phase, ctx: &PhaseContext<'_>) -> Vec<OsString> {
        let mut args: Vec<OsString> = vec!["run".into()];
        args.extend(self.security_args());
        args.extend(["--rm", "-i"].map(OsString::from));
        args.push("--name".into());
        args.push(self.container_name(document, phase).into());

        if phase == Phase::PixelsToPdf {
            let mut pixels = OsString::from("type=bind,src=");
            pixels.push(ctx.workdir.pixels_dir());
            pixels.push(format!(",dst={CONTAINER_PIXELS_DIR},ro"));
            let mut output = OsString::from("type=bind,src=");
            output.push(ctx.workdir.output_dir());
            output.push(format!(",dst={CONTAINER_OUTPUT_DIR}"));
            args.extend(["--mount".into(), pixels, "--mount".into(), output]);

            args.extend(["-e".into(), format!("PIXELS_DIR={CONTAINER_PIXELS_DIR}").into()]);
            args.extend(["-e".into(), format!("SAFE_OUTPUT_DIR={CONTAINER_OUTPUT_DIR}").into()]);
            if let Some(lang) = ctx.ocr_language {
                args.extend(["-e".into(), "OCR=1".into()]);
                args.extend(["-e".into(), format!("OCR_LANGUAGE={}", lang.code()).into()]);
            }
        }

        args.push(OsString::from(&self.config.image));
        args.extend(self.config.worker_command.iter().map(OsString::from));
        args.push(phase.tag().into());
        args
    }

    async fn kill_container(&self, name: &str) {
        let mut cmd = Command::new(&self.binary);
        cmd.arg("kill")
            .arg(name)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        // The container may have stopped right before this; its output is
        // captured only to keep it quiet.
        match tokio::time::timeout(KILL_TIMEOUT, cmd.output()).await {
            Ok(Ok(out)) => debug!("{} kill {} exited with {}", self.runtime, name, out.status),
            Ok(Err(e)) => warn!("Unexpected error while killing container '{}': {}", name, e),
            Err(_) => warn!(
                "Could not kill container '{}' within {} seconds",
                name,
                KILL_TIMEOUT.as_secs()
            ),
        }
    }

    /// Warn if the container still exists after a stop.
    async fn check_removed(&self, document: &Document, phase: Phase) {
        let name = self.container_name(document, phase);
        let mut cmd = Command::new(&self.binary);
        cmd.args(["ps", "-a", "--format", "{{.Names}}"])
            .stdin(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        if let Ok(Ok(out)) = tokio::time::timeout(KILL_TIMEOUT, cmd.output()).await {
            let listed = String::from_utf8_lossy(&out.stdout);
            if listed.lines().any(|l| l.trim() == name) {
                warn!("Container '{}' did not stop gracefully", name);
            }
        }
    }
}

#[async_trait]
impl IsolationProvider for ContainerProvider {
    fn name(&self) -> &str {
        self.runtime.binary_name()
    }

    async fn ensure_available(&self) -> Result<(), SanitizeError> {
        let unavailable = |detail: String| SanitizeError::SandboxUnavailable {
            backend: self.runtime.to_string(),
            detail,
        };
        let out = Command::new(&self.binary)
            .args(["image", "ls"])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| unavailable(e.to_string()))?;
        if !out.status.success() {
            let stderr = String::from_utf8_lossy(&out.stderr);
            return Err(unavailable(replace_control_chars(stderr.trim(), false)));
        }
        Ok(())
    }

    fn start_phase(
        &self,
        document: &Document,
        phase: Phase,
        ctx: &PhaseContext<'_>,
    ) -> Result<ProcessHandle, SanitizeError> {
        let args = self.run_args(document, phase, ctx);
        info!(
            "> {} {}",
            self.binary.display(),
            args.iter()
                .map(|a| a.to_string_lossy())
                .collect::<Vec<_>>()
                .join(" ")
        );
        let mut cmd = Command::new(&self.binary);
        cmd.args(&args);
        ProcessHandle::spawn(cmd, self.container_name(document, phase))
            .map_err(|e| SanitizeError::io(format!("starting the {phase} container"), e))
    }

    async fn terminate(&self, document: &Document, phase: Phase, handle: &mut ProcessHandle) {
        self.kill_container(&self.container_name(document, phase)).await;
        handle.signal_group(Signal::SIGTERM);
    }

    fn max_parallel(&self, _phase: Phase) -> usize {
        self.config.max_parallel.max(1)
    }

    fn pixel_transport(&self) -> PixelTransport {
        PixelTransport::Directory
    }

    async fn after_stop(&self, document: &Document, phase: Phase) {
        self.check_removed(document, phase).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::isolation::JobWorkdir;
    use crate::ocr::OcrLanguage;

    fn provider(runtime: ContainerRuntime) -> ContainerProvider {
        ContainerProvider::new(ContainerConfig {
            runtime: Some(runtime),
            runtime_path: Some(PathBuf::from("/usr/bin/true")),
            seccomp_profile: Some(PathBuf::from("/etc/docsanitize/seccomp.json")),
            ..ContainerConfig::default()
        })
        .unwrap()
    }

    fn fixture() -> (tempfile::TempDir, Document, JobWorkdir) {
        let tmp = tempfile::tempdir().unwrap();
        let input = tmp.path().join("in.pdf");
        std::fs::write(&input, b"%PDF").unwrap();
        let doc = Document::new(&input).unwrap();
        let work = JobWorkdir::create(Some(tmp.path()), doc.id(), PixelTransport::Directory).unwrap();
        (tmp, doc, work)
    }

    fn strings(args: Vec<OsString>) -> Vec<String> {
        args.into_iter().map(|a| a.to_string_lossy().into_owned()).collect()
    }

    fn has_pair(args: &[String], a: &str, b: &str) -> bool {
        args.windows(2).any(|w| w[0] == a && w[1] == b)
    }

    #[test]
    fn names_are_namespaced_by_phase_and_document() {
        let (_tmp, doc, _work) = fixture();
        let p = provider(ContainerRuntime::Podman);
        let a = p.container_name(&doc, Phase::DocumentToPixels);
        let b = p.container_name(&doc, Phase::PixelsToPdf);
        assert_eq!(a, format!("docsanitize-document-to-pixels-{}", doc.id()));
        assert_ne!(a, b);
    }

    #[test]
    fn podman_phase_a_is_hardened() {
        let (_tmp, doc, work) = fixture();
        let p = provider(ContainerRuntime::Podman);
        let ctx = PhaseContext {
            workdir: &work,
            ocr_language: None,
        };
        let args = strings(p.run_args(&doc, Phase::DocumentToPixels, &ctx));
        assert_eq!(args[0], "run");
        assert!(has_pair(&args, "--log-driver", "none"));
        assert!(has_pair(&args, "--userns", "nomap"));
        assert!(has_pair(&args, "--security-opt", "no-new-privileges"));
        assert!(has_pair(&args, "--security-opt", "seccomp=/etc/docsanitize/seccomp.json"));
        assert!(has_pair(&args, "--cap-drop", "all"));
        assert!(has_pair(&args, "--cap-add", "SYS_CHROOT"));
        assert!(has_pair(&args, "-u", "sanitizer"));
        assert!(args.contains(&"--network=none".to_string()));
        assert!(args.contains(&"--rm".to_string()));
        assert!(!args.iter().any(|a| a == "--mount"), "phase A gets no host mounts");
        assert_eq!(args.last().map(String::as_str), Some("document-to-pixels"));
    }

    #[test]
    fn docker_phase_b_mounts_and_env() {
        let (_tmp, doc, work) = fixture();
        let p = provider(ContainerRuntime::Docker);
        let ctx = PhaseContext {
            workdir: &work,
            ocr_language: OcrLanguage::lookup("deu"),
        };
        let args = strings(p.run_args(&doc, Phase::PixelsToPdf, &ctx));
        assert!(args.contains(&"--security-opt=no-new-privileges:true".to_string()));
        assert!(!args.contains(&"--userns".to_string()));
        let ro = format!(
            "type=bind,src={},dst={CONTAINER_PIXELS_DIR},ro",
            work.pixels_dir().display()
        );
        assert!(has_pair(&args, "--mount", &ro));
        assert!(has_pair(&args, "-e", "OCR=1"));
        assert!(has_pair(&args, "-e", "OCR_LANGUAGE=deu"));
        assert!(has_pair(&args, "-e", &format!("PIXELS_DIR={CONTAINER_PIXELS_DIR}")));
        let image_pos = args.iter().position(|a| a == "docsanitize-worker:latest").unwrap();
        assert_eq!(&args[image_pos + 1..], ["/usr/local/bin/sanitizer-worker", "pixels-to-pdf"]);
    }

    #[test]
    fn runtime_parsing() {
        assert_eq!("Podman".parse::<ContainerRuntime>().unwrap(), ContainerRuntime::Podman);
        assert!("lxc".parse::<ContainerRuntime>().is_err());
    }

    #[tokio::test]
    async fn failing_image_ls_means_unavailable() {
        let p = ContainerProvider::new(ContainerConfig {
            runtime: Some(ContainerRuntime::Docker),
            runtime_path: Some(PathBuf::from("/bin/false")),
            ..ContainerConfig::default()
        })
        .unwrap();
        let err = p.ensure_available().await.unwrap_err();
        assert!(matches!(err, SanitizeError::SandboxUnavailable { .. }));
        assert!(!err.is_retryable());
    }
}
