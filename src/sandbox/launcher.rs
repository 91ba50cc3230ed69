//! Running commands inside a container
//!
//! A [`SandboxLauncher`] enforces a compiled [`SandboxSpec`] for one command.
//! The launcher only runs things; what to run and with which restrictions is
//! decided by the caller.

use crate::error::{ConbuilderError, ConbuilderResult};
use crate::sandbox::policy::SandboxSpec;
use async_trait::async_trait;
use std::os::unix::process::ExitStatusExt;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::watch;
use tracing::warn;

/// Max number of output lines carried in error messages
const OUTPUT_TAIL_LINES: usize = 50;

/// Requests cancellation of running work
#[derive(Debug, Clone)]
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }
}

/// Observes cancellation
#[derive(Debug, Clone)]
pub struct CancelToken {
    rx: watch::Receiver<bool>,
}

impl CancelToken {
    pub fn pair() -> (CancelHandle, CancelToken) {
        let (tx, rx) = watch::channel(false);
        (CancelHandle { tx }, CancelToken { rx })
    }

    /// A token that is never cancelled
    pub fn never() -> Self {
        Self::pair().1
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once cancellation is requested
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                // Handle dropped without cancelling
                std::future::pending::<()>().await;
            }
        }
    }
}

/// How a host path appears inside the container
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BindMode {
    ReadOnly,
    /// Writable view whose writes are thrown away with the container
    Overlay,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bind {
    pub source: PathBuf,
    pub target: String,
    pub mode: BindMode,
}

/// One command to run in a container
#[derive(Debug, Clone)]
pub struct Invocation {
    /// Container name, unique per concurrent run
    pub machine: String,
    /// Container root directory
    pub root: PathBuf,
    pub spec: SandboxSpec,
    pub command: Vec<String>,
    pub env: Vec<(String, String)>,
    pub binds: Vec<Bind>,
    /// Mount the root read-only
    pub read_only: bool,
    pub workdir: String,
}

impl Invocation {
    pub fn new(machine: impl Into<String>, root: impl Into<PathBuf>, spec: SandboxSpec) -> Self {
        Self {
            machine: machine.into(),
            root: root.into(),
            spec,
            command: vec![],
            env: vec![],
            binds: vec![],
            read_only: false,
            workdir: "/srv".to_string(),
        }
    }

    pub fn command<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.command = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn bind(mut self, source: impl Into<PathBuf>, target: impl Into<String>, mode: BindMode) -> Self {
        self.binds.push(Bind {
            source: source.into(),
            target: target.into(),
            mode,
        });
        self
    }

    pub fn read_only(mut self) -> Self {
        self.read_only = true;
        self
    }

    /// Printable command line for messages
    pub fn display_command(&self) -> String {
        self.command.join(" ")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitStatus {
    Exited(i32),
    Signaled(i32),
    Cancelled,
}

impl std::fmt::Display for ExitStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Exited(code) => write!(f, "exited with status {}", code),
            Self::Signaled(signal) => write!(f, "killed by signal {}", signal),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Result of a finished container run
#[derive(Debug, Clone)]
pub struct ProcessOutcome {
    pub status: ExitStatus,
    /// Combined stdout and stderr lines
    pub output: Vec<String>,
}

impl ProcessOutcome {
    pub fn success(&self) -> bool {
        self.status == ExitStatus::Exited(0)
    }

    pub fn exit_code(&self) -> Option<i32> {
        match self.status {
            ExitStatus::Exited(code) => Some(code),
            _ => None,
        }
    }

    /// Last lines of output, for error messages
    pub fn tail(&self) -> String {
        output_tail(&self.output)
    }

    /// Turn anything but a clean exit into a command error
    pub fn check(self, command: &str) -> ConbuilderResult<Vec<String>> {
        if self.success() {
            Ok(self.output)
        } else {
            Err(ConbuilderError::command_exec(
                command,
                format!("{}\n{}", self.status, self.tail()),
            ))
        }
    }
}

/// Runs commands confined by a compiled sandbox spec
#[async_trait]
pub trait SandboxLauncher: Send + Sync {
    /// Run to completion, or until `cancel` fires
    async fn run(
        &self,
        invocation: &Invocation,
        cancel: &CancelToken,
        on_output: &(dyn Fn(String) + Send + Sync),
    ) -> ConbuilderResult<ProcessOutcome>;

    /// Human-readable launcher name for display
    fn name(&self) -> &'static str;
}

/// The last [`OUTPUT_TAIL_LINES`] lines of output
pub(crate) fn output_tail(lines: &[String]) -> String {
    let start = lines.len().saturating_sub(OUTPUT_TAIL_LINES);
    lines[start..].join("\n")
}

/// Stream stdout+stderr from a child process into `collected`, calling
/// `on_output` for each line.
///
/// Lines already read stay in `collected` if the future is dropped early.
pub(crate) async fn stream_child_output(
    child: &mut tokio::process::Child,
    collected: &mut Vec<String>,
    on_output: &(dyn Fn(String) + Send + Sync),
) -> ConbuilderResult<()> {
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| ConbuilderError::Internal("child stderr not piped".to_string()))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| ConbuilderError::Internal("child stdout not piped".to_string()))?;

    let mut stderr_reader = BufReader::new(stderr);
    let mut stdout_reader = BufReader::new(stdout);
    // Partial lines survive a lost select race and are completed next round
    let mut stderr_buf = Vec::new();
    let mut stdout_buf = Vec::new();

    let mut stderr_done = false;
    let mut stdout_done = false;

    while !stderr_done || !stdout_done {
        tokio::select! {
            read = stderr_reader.read_until(b'\n', &mut stderr_buf), if !stderr_done => {
                stderr_done = consume_line(read, &mut stderr_buf, collected, on_output);
            }
            read = stdout_reader.read_until(b'\n', &mut stdout_buf), if !stdout_done => {
                stdout_done = consume_line(read, &mut stdout_buf, collected, on_output);
            }
        }
    }

    Ok(())
}

/// Hand one raw line on, decoded lossily since build logs are not always
/// UTF-8. Returns true once the stream is finished.
fn consume_line(
    read: std::io::Result<usize>,
    buf: &mut Vec<u8>,
    collected: &mut Vec<String>,
    on_output: &(dyn Fn(String) + Send + Sync),
) -> bool {
    match read {
        Ok(0) => true,
        Ok(_) => {
            let mut end = buf.len();
            while end > 0 && matches!(buf[end - 1], b'\n' | b'\r') {
                end -= 1;
            }
            let line = String::from_utf8_lossy(&buf[..end]).into_owned();
            buf.clear();
            on_output(line.clone());
            collected.push(line);
            false
        }
        Err(e) => {
            warn!("Reading container output failed: {}", e);
            true
        }
    }
}

/// Spawn `command` with piped output and wait for it, killing it if `cancel`
/// fires first. Output lines read before cancellation are kept.
pub(crate) async fn run_child(
    mut command: Command,
    program: &str,
    cancel: &CancelToken,
    on_output: &(dyn Fn(String) + Send + Sync),
) -> ConbuilderResult<ProcessOutcome> {
    let mut child = command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| ConbuilderError::command_failed(program, e))?;

    let mut output = Vec::new();
    let finished = tokio::select! {
        streamed = stream_child_output(&mut child, &mut output, on_output) => Some(streamed),
        _ = cancel.cancelled() => None,
    };

    let status = match finished {
        Some(streamed) => {
            streamed?;
            let status = child
                .wait()
                .await
                .map_err(|e| ConbuilderError::command_failed(program, e))?;
            match status.code() {
                Some(code) => ExitStatus::Exited(code),
                None => ExitStatus::Signaled(status.signal().unwrap_or_default()),
            }
        }
        None => {
            warn!("Cancelling {}", program);
            if let Err(e) = child.kill().await {
                warn!("Failed to kill {}: {}", program, e);
            }
            ExitStatus::Cancelled
        }
    };

    Ok(ProcessOutcome { status, output })
}
