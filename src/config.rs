//! Configuration for sanitization jobs.
//!
//! All host-side behaviour is controlled through [`SanitizerConfig`], built
//! via its [`SanitizerConfigBuilder`]. The config is immutable once built and
//! is shared as `Arc<SanitizerConfig>` between the orchestrator and the
//! scheduler, so concurrent jobs read the same values and never race on them.
//!
//! Backend-specific settings (container runtime, disposable VM template, …)
//! live in the provider configs next to each provider, see
//! [`crate::isolation`].

use crate::error::SanitizeError;
use crate::ocr::OcrLanguage;
use crate::progress::ProgressCallback;
use crate::timeout::TimeoutPolicy;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// Longest grace or wait period accepted by [`SanitizerConfigBuilder::build`].
pub const MAX_WAIT: Duration = Duration::from_secs(24 * 3600);

/// Configuration for sanitizing documents.
///
/// Built via [`SanitizerConfig::builder()`] or using
/// [`SanitizerConfig::default()`].
///
/// # Example
/// ```rust
/// use docsanitize::SanitizerConfig;
/// use std::time::Duration;
///
/// let config = SanitizerConfig::builder()
///     .ocr_language("eng")
///     .phase_grace(Duration::from_secs(10))
///     .build()
///     .unwrap();
/// assert_eq!(config.ocr_language.unwrap().code(), "eng");
/// ```
#[derive(Clone)]
pub struct SanitizerConfig {
    /// Language for the OCR text layer. `None` disables OCR. Default: None.
    pub ocr_language: Option<OcrLanguage>,

    /// Timeout policy for sandboxed phases. Default: [`TimeoutPolicy::default`].
    pub timeouts: TimeoutPolicy,

    /// Extra time a phase gets on top of its computed timeout. Default: 15 s.
    ///
    /// The worker enforces the same policy on each tool it runs, so the grace
    /// period lets it report its own timeout through its exit status before
    /// the host gives up on it.
    pub phase_grace: Duration,

    /// How long a terminated phase gets to exit before it is killed. Default: 15 s.
    pub termination_grace: Duration,

    /// How long to wait after a forced kill before giving up. Default: 5 s.
    pub force_kill_wait: Duration,

    /// After an I/O error on a worker stream, how long to wait for the
    /// worker's exit status. Default: 15 s.
    pub exit_status_wait: Duration,

    /// Override of the provider's parallelism hint. Default: None.
    pub max_parallel: Option<usize>,

    /// Where per-job scratch directories are created. Default: system temp dir.
    pub work_root: Option<PathBuf>,

    /// Log the worker's diagnostic stream. Default: false.
    ///
    /// Progress records are always parsed; this only controls whether the
    /// remaining (sanitized) lines are logged.
    pub capture_stderr: bool,

    /// Receives state changes and progress messages. Default: None.
    pub progress_callback: Option<ProgressCallback>,
}

impl Default for SanitizerConfig {
    fn default() -> Self {
        Self {
            ocr_language: None,
            timeouts: TimeoutPolicy::default(),
            phase_grace: Duration::from_secs(15),
            termination_grace: Duration::from_secs(15),
            force_kill_wait: Duration::from_secs(5),
            exit_status_wait: Duration::from_secs(15),
            max_parallel: None,
            work_root: None,
            capture_stderr: false,
            progress_callback: None,
        }
    }
}

impl fmt::Debug for SanitizerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SanitizerConfig")
            .field("ocr_language", &self.ocr_language)
            .field("timeouts", &self.timeouts)
            .field("phase_grace", &self.phase_grace)
            .field("termination_grace", &self.termination_grace)
            .field("force_kill_wait", &self.force_kill_wait)
            .field("exit_status_wait", &self.exit_status_wait)
            .field("max_parallel", &self.max_parallel)
            .field("work_root", &self.work_root)
            .field("capture_stderr", &self.capture_stderr)
            .field(
                "progress_callback",
                &self.progress_callback.as_ref().map(|_| "<dyn SanitizeProgressCallback>"),
            )
            .finish()
    }
}

impl SanitizerConfig {
    /// Create a new builder for `SanitizerConfig`.
    pub fn builder() -> SanitizerConfigBuilder {
        SanitizerConfigBuilder {
            config: Self::default(),
            errors: Vec::new(),
        }
    }
}

/// Builder for [`SanitizerConfig`].
#[derive(Debug)]
pub struct SanitizerConfigBuilder {
    config: SanitizerConfig,
    errors: Vec<String>,
}

impl SanitizerConfigBuilder {
    /// OCR language by engine code or display name. Unknown values make
    /// [`build`](Self::build) fail.
    pub fn ocr_language(mut self, lang: &str) -> Self {
        match OcrLanguage::lookup(lang) {
            Some(l) => self.config.ocr_language = Some(l),
            None => self.errors.push(format!("unsupported OCR language '{}'", lang.trim())),
        }
        self
    }

    pub fn ocr(mut self, lang: Option<OcrLanguage>) -> Self {
        self.config.ocr_language = lang;
        self
    }

    pub fn timeouts(mut self, policy: TimeoutPolicy) -> Self {
        self.config.timeouts = policy;
        self
    }

    pub fn disable_timeouts(mut self) -> Self {
        self.config.timeouts.enabled = false;
        self
    }

    pub fn phase_grace(mut self, d: Duration) -> Self {
        self.config.phase_grace = d;
        self
    }

    pub fn termination_grace(mut self, d: Duration) -> Self {
        self.config.termination_grace = d;
        self
    }

    pub fn force_kill_wait(mut self, d: Duration) -> Self {
        self.config.force_kill_wait = d;
        self
    }

    pub fn exit_status_wait(mut self, d: Duration) -> Self {
        self.config.exit_status_wait = d;
        self
    }

    pub fn max_parallel(mut self, n: usize) -> Self {
        self.config.max_parallel = Some(n);
        self
    }

    pub fn work_root(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.work_root = Some(dir.into());
        self
    }

    pub fn capture_stderr(mut self, v: bool) -> Self {
        self.config.capture_stderr = v;
        self
    }

    pub fn progress_callback(mut self, cb: ProgressCallback) -> Self {
        self.config.progress_callback = Some(cb);
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<SanitizerConfig, SanitizeError> {
        if let Some(e) = self.errors.into_iter().next() {
            return Err(SanitizeError::InvalidConfig(e));
        }
        let c = &self.config;
        if c.max_parallel == Some(0) {
            return Err(SanitizeError::InvalidConfig(
                "max_parallel must be ≥ 1".into(),
            ));
        }
        let t = &c.timeouts;
        let factors = [t.per_mb_secs, t.min_secs, t.per_page_secs];
        if factors.iter().any(|f| !f.is_finite()) {
            return Err(SanitizeError::InvalidConfig(format!(
                "timeouts must be finite, got {t:?}"
            )));
        }
        if t.per_mb_secs < 0.0 || t.min_secs <= 0.0 || t.per_page_secs < 0.0 {
            return Err(SanitizeError::InvalidConfig(format!(
                "timeouts must be positive, got {t:?}"
            )));
        }
        let waits = [
            ("phase_grace", c.phase_grace),
            ("termination_grace", c.termination_grace),
            ("force_kill_wait", c.force_kill_wait),
            ("exit_status_wait", c.exit_status_wait),
        ];
        if let Some((name, d)) = waits.iter().find(|(_, d)| *d > MAX_WAIT) {
            return Err(SanitizeError::InvalidConfig(format!(
                "{name} must be at most {}s, got {}s",
                MAX_WAIT.as_secs(),
                d.as_secs()
            )));
        }
        if let Some(root) = &c.work_root {
            if !root.is_dir() {
                return Err(SanitizeError::InvalidConfig(format!(
                    "work root '{}' is not a directory",
                    root.display()
                )));
            }
        }
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let c = SanitizerConfig::default();
        assert!(c.ocr_language.is_none());
        assert_eq!(c.phase_grace, Duration::from_secs(15));
        assert_eq!(c.termination_grace, Duration::from_secs(15));
        assert_eq!(c.force_kill_wait, Duration::from_secs(5));
        assert_eq!(c.exit_status_wait, Duration::from_secs(15));
        assert!(c.timeouts.enabled);
    }

    #[test]
    fn builder_sets_values() {
        let c = SanitizerConfig::builder()
            .ocr_language("French")
            .max_parallel(3)
            .disable_timeouts()
            .build()
            .unwrap();
        assert_eq!(c.ocr_language.map(|l| l.code()), Some("fra"));
        assert_eq!(c.max_parallel, Some(3));
        assert!(!c.timeouts.enabled);
    }

    #[test]
    fn unbounded_durations_fail_build() {
        let nan = TimeoutPolicy {
            min_secs: f64::NAN,
            ..TimeoutPolicy::default()
        };
        let err = SanitizerConfig::builder().timeouts(nan).build().unwrap_err();
        assert!(matches!(err, SanitizeError::InvalidConfig(_)));

        let inf = TimeoutPolicy {
            per_page_secs: f64::INFINITY,
            ..TimeoutPolicy::default()
        };
        assert!(SanitizerConfig::builder().timeouts(inf).build().is_err());

        let err = SanitizerConfig::builder()
            .phase_grace(Duration::MAX)
            .build()
            .unwrap_err();
        assert!(matches!(err, SanitizeError::InvalidConfig(m) if m.contains("phase_grace")));
        assert!(SanitizerConfig::builder().phase_grace(MAX_WAIT).build().is_ok());
    }

    #[test]
    fn unknown_language_fails_build() {
        let err = SanitizerConfig::builder().ocr_language("zz").build().unwrap_err();
        assert!(matches!(err, SanitizeError::InvalidConfig(_)));
    }

    #[test]
    fn zero_parallelism_fails_build() {
        assert!(SanitizerConfig::builder().max_parallel(0).build().is_err());
    }

    #[test]
    fn work_root_must_exist() {
        let err = SanitizerConfig::builder()
            .work_root("/definitely/not/here")
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("not a directory"));
    }

    #[test]
    fn debug_hides_callback() {
        let c = SanitizerConfig::builder()
            .progress_callback(std::sync::Arc::new(crate::progress::NoopProgressCallback))
            .build()
            .unwrap();
        assert!(format!("{c:?}").contains("<dyn SanitizeProgressCallback>"));
    }
}
