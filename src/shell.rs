//! Shell launching under a wall-clock timeout and an output byte cap.
//!
//! A [`ShellLauncher`] starts exactly one external process for one
//! [`ShellKind`]. The command text is handed to the interpreter as a single
//! argument vector element; it is never spliced into another command line.
//!
//! While the process runs, stdout and stderr are drained concurrently by two
//! reader tasks into [`CappedBuffer`]s. Bytes past the cap are read and
//! discarded so a chatty child can never stall on a full pipe, and the
//! `truncated` flag records that it happened.

use crate::error::LaunchError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::process::Stdio;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Exit code recorded when the watchdog terminated the process.
pub const TIMEOUT_EXIT_CODE: i32 = -1;

/// Exit code recorded when the process died from a signal.
pub const SIGNALLED_EXIT_CODE: i32 = -2;

/// How long reader tasks may keep draining once the process is gone.
///
/// Grandchildren can inherit the pipes and keep them open; after this grace
/// the readers are abandoned and whatever was captured is kept.
pub const PIPE_DRAIN_GRACE: Duration = Duration::from_millis(500);

const READ_CHUNK: usize = 8 * 1024;

/// Supported command interpreters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShellKind {
    PowerShell,
    Cmd,
    Bash,
    Sh,
}

impl ShellKind {
    pub const ALL: [ShellKind; 4] = [ShellKind::PowerShell, ShellKind::Cmd, ShellKind::Bash, ShellKind::Sh];

    /// Executable name used when no override is configured.
    pub fn default_program(self) -> &'static str {
        match self {
            ShellKind::PowerShell if cfg!(windows) => "powershell.exe",
            ShellKind::PowerShell => "pwsh",
            ShellKind::Cmd => "cmd.exe",
            ShellKind::Bash if cfg!(windows) => "bash.exe",
            ShellKind::Bash => "bash",
            ShellKind::Sh => "sh",
        }
    }

    /// Interpreter arguments that run `command` non-interactively.
    pub fn arguments(self, command: &str) -> Vec<String> {
        let mut args: Vec<String> = match self {
            ShellKind::PowerShell => ["-NoProfile", "-NonInteractive", "-ExecutionPolicy", "Bypass", "-Command"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            ShellKind::Cmd => vec!["/C".to_string()],
            ShellKind::Bash | ShellKind::Sh => vec!["-c".to_string()],
        };
        args.push(command.to_string());
        args
    }

    /// Default fallback sequence for the current platform.
    pub fn platform_priority() -> Vec<ShellKind> {
        if cfg!(windows) {
            vec![ShellKind::PowerShell, ShellKind::Cmd, ShellKind::Bash]
        } else {
            vec![ShellKind::Bash, ShellKind::Sh, ShellKind::PowerShell]
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ShellKind::PowerShell => "powershell",
            ShellKind::Cmd => "cmd",
            ShellKind::Bash => "bash",
            ShellKind::Sh => "sh",
        }
    }
}

impl fmt::Display for ShellKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ShellKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "powershell" | "pwsh" => Ok(ShellKind::PowerShell),
            "cmd" => Ok(ShellKind::Cmd),
            "bash" => Ok(ShellKind::Bash),
            "sh" | "posix" => Ok(ShellKind::Sh),
            other => Err(format!("unknown shell kind '{}'", other)),
        }
    }
}

/// Resource limits applied to every launch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutionLimits {
    pub timeout: Duration,
    pub output_cap: usize,
}

/// Outcome of one completed (or timed out) process run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionResult {
    pub exit_code: i32,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub elapsed: Duration,
    pub timed_out: bool,
    pub truncated: bool,
    pub shell: ShellKind,
}

impl ExecutionResult {
    pub fn succeeded(&self) -> bool {
        self.exit_code == 0 && !self.timed_out
    }

    pub fn stdout_text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.stdout)
    }

    pub fn stderr_text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.stderr)
    }
}

/// Byte buffer that keeps at most `cap` bytes and remembers overflow.
#[derive(Debug, Default)]
pub struct CappedBuffer {
    data: Vec<u8>,
    cap: usize,
    truncated: bool,
}

impl CappedBuffer {
    pub fn new(cap: usize) -> Self {
        Self {
            data: Vec::new(),
            cap,
            truncated: false,
        }
    }

    pub fn push(&mut self, chunk: &[u8]) {
        let room = self.cap.saturating_sub(self.data.len());
        if chunk.len() > room {
            self.truncated = true;
        }
        let take = chunk.len().min(room);
        self.data.extend_from_slice(&chunk[..take]);
    }

    pub fn into_parts(self) -> (Vec<u8>, bool) {
        (self.data, self.truncated)
    }
}

/// Starts one shell process for one command.
///
/// Implementations must enforce `limits` themselves; the coordinator only
/// decides which shell to try next.
#[async_trait]
pub trait ShellLauncher: Send + Sync {
    async fn launch(
        &self,
        shell: ShellKind,
        command: &str,
        limits: &ExecutionLimits,
    ) -> Result<ExecutionResult, LaunchError>;
}

/// Launcher backed by real OS processes.
#[derive(Debug, Default, Clone)]
pub struct ProcessLauncher {
    program_overrides: BTreeMap<ShellKind, PathBuf>,
}

impl ProcessLauncher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Uses `program` instead of the default executable for `shell`.
    pub fn with_program(mut self, shell: ShellKind, program: impl Into<PathBuf>) -> Self {
        self.program_overrides.insert(shell, program.into());
        self
    }

    pub fn with_programs(self, programs: &BTreeMap<ShellKind, PathBuf>) -> Self {
        programs
            .iter()
            .fold(self, |launcher, (shell, path)| launcher.with_program(*shell, path.clone()))
    }

    pub fn program_for(&self, shell: ShellKind) -> PathBuf {
        self.program_overrides
            .get(&shell)
            .cloned()
            .unwrap_or_else(|| PathBuf::from(shell.default_program()))
    }
}

#[async_trait]
impl ShellLauncher for ProcessLauncher {
    async fn launch(
        &self,
        shell: ShellKind,
        command: &str,
        limits: &ExecutionLimits,
    ) -> Result<ExecutionResult, LaunchError> {
        let program = self.program_for(shell);
        debug!("Spawning {} via {}", shell, program.display());

        let mut cmd = Command::new(&program);
        cmd.args(shell.arguments(command))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        // Own process group, so a timeout can take down everything the shell started.
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd
            .spawn()
            .map_err(|e| LaunchError::from_spawn(shell, program.clone(), e))?;

        let started = Instant::now();
        info!("Launched {} (pid {:?})", shell, child.id());

        let stdout_buf = Arc::new(Mutex::new(CappedBuffer::new(limits.output_cap)));
        let stderr_buf = Arc::new(Mutex::new(CappedBuffer::new(limits.output_cap)));
        let stdout_task = child
            .stdout
            .take()
            .map(|pipe| tokio::spawn(drain_capped(pipe, Arc::clone(&stdout_buf))));
        let stderr_task = child
            .stderr
            .take()
            .map(|pipe| tokio::spawn(drain_capped(pipe, Arc::clone(&stderr_buf))));

        let (exit_code, timed_out) = match tokio::time::timeout(limits.timeout, child.wait()).await {
            Ok(Ok(status)) => (status.code().unwrap_or(SIGNALLED_EXIT_CODE), false),
            Ok(Err(source)) => {
                return Err(LaunchError::Io {
                    shell,
                    program,
                    source,
                });
            }
            Err(_) => {
                warn!("{} exceeded timeout of {:?}, terminating", shell, limits.timeout);
                if let Some(pid) = child.id() {
                    kill_process_tree(pid).await;
                }
                if let Err(e) = child.kill().await {
                    warn!("Failed to terminate timed out process: {}", e);
                }
                (TIMEOUT_EXIT_CODE, true)
            }
        };
        let elapsed = started.elapsed();

        tokio::join!(settle_reader(stdout_task), settle_reader(stderr_task));

        let (stdout, stdout_truncated) = take_buffer(&stdout_buf);
        let (stderr, stderr_truncated) = take_buffer(&stderr_buf);
        let truncated = stdout_truncated || stderr_truncated;
        if truncated {
            warn!("Output exceeded {} bytes and was truncated", limits.output_cap);
        }

        info!(
            "{} finished: exit_code={}, timed_out={}, elapsed={:.2?}",
            shell, exit_code, timed_out, elapsed
        );

        Ok(ExecutionResult {
            exit_code,
            stdout,
            stderr,
            elapsed,
            timed_out,
            truncated,
            shell,
        })
    }
}

async fn drain_capped<R>(mut pipe: R, sink: Arc<Mutex<CappedBuffer>>)
where
    R: AsyncRead + Unpin,
{
    let mut chunk = vec![0u8; READ_CHUNK];
    loop {
        match pipe.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => lock(&sink).push(&chunk[..n]),
            Err(e) => {
                debug!("Output pipe read failed: {}", e);
                break;
            }
        }
    }
}

/// Kills the process group led by `pid`, which holds every process the shell spawned.
#[cfg(unix)]
async fn kill_process_tree(pid: u32) {
    use nix::sys::signal::{Signal, killpg};
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pid) else {
        return;
    };
    if let Err(e) = killpg(Pid::from_raw(raw), Signal::SIGKILL) {
        debug!("Failed to kill process group {}: {}", pid, e);
    }
}

/// Kills `pid` and its descendants.
#[cfg(windows)]
async fn kill_process_tree(pid: u32) {
    let status = Command::new("taskkill")
        .args(["/T", "/F", "/PID", &pid.to_string()])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await;
    if let Err(e) = status {
        debug!("taskkill failed for pid {}: {}", pid, e);
    }
}

async fn settle_reader(task: Option<JoinHandle<()>>) {
    if let Some(mut task) = task {
        if tokio::time::timeout(PIPE_DRAIN_GRACE, &mut task).await.is_err() {
            debug!("Output pipe still open after process exit, abandoning reader");
            task.abort();
        }
    }
}

fn lock(buffer: &Mutex<CappedBuffer>) -> MutexGuard<'_, CappedBuffer> {
    buffer.lock().unwrap_or_else(PoisonError::into_inner)
}

fn take_buffer(buffer: &Mutex<CappedBuffer>) -> (Vec<u8>, bool) {
    std::mem::take(&mut *lock(buffer)).into_parts()
}
