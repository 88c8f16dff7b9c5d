//! Running the external converters (LibreOffice, GraphicsMagick, Tesseract).
//!
//! A zero exit status is not trusted on its own: every run names the file it
//! must produce, and an absent or empty file is the tool's failure.

use crate::error::ConversionError;
use crate::sanitize::replace_control_chars;
use std::ffi::OsStr;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, warn};

/// One external tool invocation.
#[derive(Debug)]
pub struct ToolRun<'a> {
    pub program: &'a str,
    pub args: Vec<&'a OsStr>,
    /// `None` waits forever.
    pub timeout: Option<Duration>,
    /// Raised when the tool fails or does not produce `output`.
    pub failure: ConversionError,
    pub output: &'a Path,
}

impl<'a> ToolRun<'a> {
    pub fn new(program: &'a str, output: &'a Path, failure: ConversionError) -> Self {
        Self {
            program,
            args: Vec::new(),
            timeout: None,
            failure,
            output,
        }
    }

    pub fn arg(mut self, arg: &'a (impl AsRef<OsStr> + ?Sized)) -> Self {
        self.args.push(arg.as_ref());
        self
    }

    pub fn timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Run the tool and check that it produced its output file.
    pub async fn run(self) -> Result<(), ConversionError> {
        debug!("Running {} {:?}", self.program, self.args);
        let mut cmd = Command::new(self.program);
        cmd.args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child = cmd.output();
        let output = match self.timeout {
            Some(limit) => match tokio::time::timeout(limit, child).await {
                Ok(result) => result,
                Err(_) => {
                    warn!("{} timed out after {}s", self.program, limit.as_secs());
                    return Err(ConversionError::ConversionTimeout);
                }
            },
            None => child.await,
        };

        let output = output.map_err(|e| {
            warn!("Could not run {}: {}", self.program, e);
            self.failure
        })?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            warn!(
                "{} exited with {}: {}",
                self.program,
                output.status,
                replace_control_chars(stderr.trim(), true)
            );
            return Err(self.failure);
        }

        require_output(self.output, self.failure).await
    }
}

/// Fail with `failure` unless `path` is a non-empty file.
pub async fn require_output(path: &Path, failure: ConversionError) -> Result<(), ConversionError> {
    match tokio::fs::metadata(path).await {
        Ok(meta) if meta.is_file() && meta.len() > 0 => Ok(()),
        Ok(_) => {
            warn!("{} is empty", path.display());
            Err(failure)
        }
        Err(e) => {
            warn!("{} was not produced: {}", path.display(), e);
            Err(failure)
        }
    }
}
