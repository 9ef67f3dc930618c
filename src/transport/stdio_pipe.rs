//! Stdin/stdout pipe transport for worker processes.
//!
//! Owns a child process and exchanges newline-delimited JSON on the child's
//! stdin (requests) and stdout (responses). Worker stderr is forwarded into
//! the host's tracing output line by line, at the level the worker logged it.
//!
//! Every way a transport ends (cancel, failed shutdown, drop) kills the
//! worker's whole process group, not only the worker itself.

use std::ffi::OsString;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tracing::{debug, error, info, warn, Level};

use super::protocol::{OperationRequest, OperationResponse};
use super::{recv_line, send_line, Transport, TransportError, WorkerLauncher};

/// Tracing target for forwarded worker stderr.
const WORKER_TARGET: &str = "uia_bridge::worker";

/// How long to wait for a reply already in flight once the worker has exited.
const EXIT_DRAIN: Duration = Duration::from_millis(100);

/// How to start a worker process.
#[derive(Debug, Clone)]
pub struct WorkerCommand {
    /// Executable to run.
    pub program: PathBuf,
    /// Arguments passed to the executable.
    pub args: Vec<OsString>,
    /// Extra environment variables.
    pub env: Vec<(String, String)>,
    /// How long a clean shutdown may take before the tree is killed.
    pub shutdown_grace: Duration,
}

impl WorkerCommand {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
            shutdown_grace: Duration::from_secs(2),
        }
    }

    #[must_use]
    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    #[must_use]
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    #[must_use]
    pub const fn shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }
}

/// Launches `StdioPipeTransport` workers from a fixed command.
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    command: WorkerCommand,
}

impl ProcessLauncher {
    pub const fn new(command: WorkerCommand) -> Self {
        Self { command }
    }

    pub const fn command(&self) -> &WorkerCommand {
        &self.command
    }
}

#[async_trait]
impl WorkerLauncher for ProcessLauncher {
    async fn launch(&self) -> Result<Box<dyn Transport>, TransportError> {
        let transport = StdioPipeTransport::spawn(&self.command)?;
        Ok(Box::new(transport))
    }
}

/// Transport that talks to a worker via stdin/stdout pipes.
///
/// The worker is spawned once and kept alive across requests. The caller must
/// hold `&mut self` for the whole send/receive, which serializes access.
pub struct StdioPipeTransport {
    child: Child,
    stdin: Option<ChildStdin>,
    stdout: BufReader<ChildStdout>,
    pid: Option<u32>,
    alive: bool,
    tree_killed: bool,
    shutdown_grace: Duration,
}

impl StdioPipeTransport {
    /// Spawn a worker process with piped stdio.
    ///
    /// On Unix the worker becomes the leader of a new process group so that
    /// anything the backend spawns can be killed along with it.
    pub fn spawn(command: &WorkerCommand) -> Result<Self, TransportError> {
        debug!(program = %command.program.display(), "Spawning worker process");

        let mut cmd = Command::new(&command.program);
        cmd.args(&command.args)
            .envs(command.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd.spawn().map_err(|e| TransportError::Spawn {
            message: format!("{}: {e}", command.program.display()),
            source: Some(Arc::new(e)),
        })?;

        let pid = child.id();
        let stdin = child.stdin.take().ok_or_else(|| TransportError::Spawn {
            message: "failed to capture worker stdin".to_string(),
            source: None,
        })?;
        let stdout = child.stdout.take().ok_or_else(|| TransportError::Spawn {
            message: "failed to capture worker stdout".to_string(),
            source: None,
        })?;

        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_stderr(pid, stderr));
        }

        debug!(pid = ?pid, "Worker process started");

        Ok(Self {
            child,
            stdin: Some(stdin),
            stdout: BufReader::new(stdout),
            pid,
            alive: true,
            tree_killed: false,
            shutdown_grace: command.shutdown_grace,
        })
    }

    /// Exit status if the child has already exited, reaping it.
    fn exit_code(&mut self) -> Option<i32> {
        match self.child.try_wait() {
            Ok(Some(status)) => {
                self.alive = false;
                status.code()
            }
            _ => None,
        }
    }

    /// Map a closed pipe to `Closed`, attaching the exit status when the
    /// process has gone.
    async fn closed(&mut self) -> TransportError {
        self.alive = false;
        let status = tokio::time::timeout(Duration::from_millis(500), self.child.wait())
            .await
            .ok()
            .and_then(Result::ok)
            .and_then(|s| s.code());
        TransportError::Closed { status }
    }

    /// Read one reply line, returning early if the worker exits.
    ///
    /// A helper the backend started can inherit the worker's stdout and keep
    /// the pipe open after the worker dies, so EOF alone does not prove a
    /// crash.
    async fn read_reply(&mut self) -> Result<Vec<u8>, TransportError> {
        let exited = tokio::select! {
            biased;
            line = recv_line(&mut self.stdout) => return self.reply_line(line).await,
            status = self.child.wait() => status.ok().and_then(|s| s.code()),
        };

        match tokio::time::timeout(EXIT_DRAIN, recv_line(&mut self.stdout)).await {
            Ok(Ok(Some(line))) => Ok(line),
            _ => {
                debug!(pid = ?self.pid, status = ?exited, "Worker exited before replying");
                self.alive = false;
                Err(TransportError::Closed { status: exited })
            }
        }
    }

    async fn reply_line(
        &mut self,
        line: std::io::Result<Option<Vec<u8>>>,
    ) -> Result<Vec<u8>, TransportError> {
        match line {
            Ok(Some(line)) => Ok(line),
            Ok(None) => Err(self.closed().await),
            Err(e) => Err(match TransportError::from(e) {
                TransportError::Closed { .. } => self.closed().await,
                TransportError::Io(io) if io.kind() == std::io::ErrorKind::InvalidData => {
                    TransportError::Malformed {
                        message: io.to_string(),
                    }
                }
                other => other,
            }),
        }
    }
}

impl Drop for StdioPipeTransport {
    fn drop(&mut self) {
        // kill_on_drop reaches only the worker itself.
        if let Some(pid) = self.pid.filter(|_| !self.tree_killed) {
            kill_process_tree(pid);
        }
    }
}

#[async_trait]
impl Transport for StdioPipeTransport {
    async fn request(
        &mut self,
        req: &OperationRequest,
    ) -> Result<OperationResponse, TransportError> {
        if !self.alive {
            return Err(TransportError::Closed { status: None });
        }

        let payload = serde_json::to_vec(req).map_err(|e| TransportError::Malformed {
            message: format!("failed to serialize request: {e}"),
        })?;

        let Some(stdin) = self.stdin.as_mut() else {
            return Err(TransportError::Closed { status: None });
        };
        if let Err(e) = send_line(stdin, &payload).await {
            let err = TransportError::from(e);
            return Err(match err {
                TransportError::Closed { .. } => self.closed().await,
                other => other,
            });
        }

        let line = self.read_reply().await?;

        serde_json::from_slice(&line).map_err(|e| {
            let preview: String = String::from_utf8_lossy(&line).chars().take(200).collect();
            TransportError::Malformed {
                message: format!("{e}: {preview}"),
            }
        })
    }

    async fn cancel(&mut self) {
        self.alive = false;
        self.stdin = None;
        if let Some(pid) = self.pid {
            kill_process_tree(pid);
            self.tree_killed = true;
        }
        if let Err(e) = self.child.kill().await {
            debug!(pid = ?self.pid, error = %e, "Worker already gone");
        }
        debug!(pid = ?self.pid, "Worker process tree terminated");
    }

    async fn shutdown(&mut self) {
        if !self.alive {
            return;
        }

        // Closing stdin is the worker's "no more work" signal.
        self.stdin = None;

        match tokio::time::timeout(self.shutdown_grace, self.child.wait()).await {
            Ok(Ok(status)) => {
                self.alive = false;
                debug!(pid = ?self.pid, ?status, "Worker exited cleanly");
            }
            Ok(Err(e)) => {
                warn!(pid = ?self.pid, error = %e, "Failed to wait for worker, killing it");
                self.cancel().await;
            }
            Err(_) => {
                warn!(
                    pid = ?self.pid,
                    grace = ?self.shutdown_grace,
                    "Worker ignored shutdown, killing it"
                );
                self.cancel().await;
            }
        }
    }

    fn is_alive(&mut self) -> bool {
        if self.alive && self.exit_code().is_some() {
            debug!(pid = ?self.pid, "Worker found dead");
        }
        self.alive
    }

    fn pid(&self) -> Option<u32> {
        self.pid
    }
}

async fn forward_stderr(pid: Option<u32>, stderr: tokio::process::ChildStderr) {
    let mut lines = BufReader::new(stderr).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) if !line.trim().is_empty() => match worker_level(&line) {
                Some(Level::ERROR) => error!(target: WORKER_TARGET, worker = ?pid, "{line}"),
                Some(Level::WARN) => warn!(target: WORKER_TARGET, worker = ?pid, "{line}"),
                Some(Level::INFO) => info!(target: WORKER_TARGET, worker = ?pid, "{line}"),
                Some(_) => debug!(target: WORKER_TARGET, worker = ?pid, "{line}"),
                // Not a tracing line: panic output and the like.
                None => warn!(target: WORKER_TARGET, worker = ?pid, "{line}"),
            },
            Ok(Some(_)) => {}
            Ok(None) | Err(_) => break,
        }
    }
}

/// Level of a line written by the worker's fmt subscriber
/// (`<timestamp>  WARN <target>: <message>`).
fn worker_level(line: &str) -> Option<Level> {
    line.split_whitespace().take(2).find_map(|word| match word {
        "ERROR" => Some(Level::ERROR),
        "WARN" => Some(Level::WARN),
        "INFO" => Some(Level::INFO),
        "DEBUG" => Some(Level::DEBUG),
        "TRACE" => Some(Level::TRACE),
        _ => None,
    })
}

/// Kill a worker and everything it spawned.
#[cfg(unix)]
fn kill_process_tree(pid: u32) {
    use nix::errno::Errno;
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pid) else {
        return;
    };
    match killpg(Pid::from_raw(raw), Signal::SIGKILL) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(e) => warn!(pid, error = %e, "Failed to signal worker process group"),
    }
}

/// Kill a worker and everything it spawned.
#[cfg(windows)]
fn kill_process_tree(pid: u32) {
    let result = std::process::Command::new("taskkill")
        .args(["/PID", &pid.to_string(), "/T", "/F"])
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status();
    if let Err(e) = result {
        warn!(pid, error = %e, "Failed to run taskkill on worker tree");
    }
}

#[cfg(not(any(unix, windows)))]
const fn kill_process_tree(_pid: u32) {}
