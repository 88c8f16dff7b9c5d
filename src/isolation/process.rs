//! Host-side handle on a sandboxed phase process.
//!
//! Each phase runs in its own process group so the whole tree (runtime
//! client, shell wrappers, …) can be signalled at once without touching the
//! host process.

use nix::errno::Errno;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use std::future::Future;
use std::io;
use std::process::{ExitStatus, Stdio};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// A spawned phase process with piped stdio.
#[derive(Debug)]
pub struct ProcessHandle {
    child: Child,
    pid: Option<u32>,
    label: String,
    stdin: Option<ChildStdin>,
    stdout: Option<ChildStdout>,
    stderr: Option<ChildStderr>,
    status: Option<ExitStatus>,
    /// Fired by [`close_streams`](Self::close_streams); stdin feeders stop on it.
    closed: CancellationToken,
}

impl ProcessHandle {
    /// Spawn `command` in a new process group with all three streams piped.
    pub fn spawn(mut command: Command, label: impl Into<String>) -> io::Result<Self> {
        command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .kill_on_drop(true);
        let mut child = command.spawn()?;
        let label = label.into();
        let pid = child.id();
        debug!("Spawned {} (pid {:?})", label, pid);
        Ok(Self {
            stdin: child.stdin.take(),
            stdout: child.stdout.take(),
            stderr: child.stderr.take(),
            child,
            pid,
            label,
            status: None,
            closed: CancellationToken::new(),
        })
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn take_stdin(&mut self) -> Option<ChildStdin> {
        self.stdin.take()
    }

    pub fn take_stdout(&mut self) -> Option<ChildStdout> {
        self.stdout.take()
    }

    pub fn take_stderr(&mut self) -> Option<ChildStderr> {
        self.stderr.take()
    }

    /// Feed stdin from a background task.
    ///
    /// The task, and with it stdin, is dropped as soon as
    /// [`close_streams`](Self::close_streams) is called, so the process sees
    /// EOF even though the handle gave its stdin away. Returns `None` when
    /// stdin was already taken.
    pub fn feed_stdin<F, Fut>(&mut self, feed: F) -> Option<JoinHandle<()>>
    where
        F: FnOnce(ChildStdin) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let stdin = self.stdin.take()?;
        let closed = self.closed.clone();
        let feeding = feed(stdin);
        let label = self.label.clone();
        Some(tokio::spawn(async move {
            tokio::select! {
                _ = closed.cancelled() => debug!("Closed stdin of {}", label),
                () = feeding => {}
            }
        }))
    }

    /// Close stdin and stdout, including a stdin handed to
    /// [`feed_stdin`](Self::feed_stdin).
    pub fn close_streams(&mut self) {
        self.stdin = None;
        self.stdout = None;
        self.closed.cancel();
    }

    /// Exit status if the process has exited, without blocking.
    pub fn try_status(&mut self) -> Option<ExitStatus> {
        if self.status.is_none() {
            match self.child.try_wait() {
                Ok(status) => self.status = status,
                Err(e) => debug!("Could not poll {}: {}", self.label, e),
            }
        }
        self.status
    }

    /// Wait for the process to exit. Safe to call repeatedly.
    pub async fn wait(&mut self) -> io::Result<ExitStatus> {
        if let Some(status) = self.status {
            return Ok(status);
        }
        let status = self.child.wait().await?;
        self.status = Some(status);
        Ok(status)
    }

    /// Send `signal` to the process group. A group that is already gone is
    /// not an error.
    pub fn signal_group(&mut self, signal: Signal) {
        if self.try_status().is_some() {
            return;
        }
        let Some(pid) = self.pid.and_then(|p| i32::try_from(p).ok()) else {
            return;
        };
        match killpg(Pid::from_raw(pid), signal) {
            Ok(()) => debug!("Sent {} to process group of {}", signal, self.label),
            Err(Errno::ESRCH) | Err(Errno::EPERM) => {}
            Err(e) => warn!(
                "Unexpected error while sending {} to process group {} ({}): {}",
                signal, pid, self.label, e
            ),
        }
    }
}
